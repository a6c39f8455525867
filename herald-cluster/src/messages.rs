//! The cluster wire envelope and its framing.
//!
//! Every exchange between nodes is one [`ClusterMessage`], a `(node_id,
//! kind, body)` triple serialized with bincode and length-prefixed on the
//! wire. Broker
//! messages travel in the body using their normal deterministic encoding, so
//! what a peer persists is byte-identical to what the origin persisted.

use crate::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound for a single frame on the wire.
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// What a cluster frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// An encoded broker message to store and fan out locally.
    Broker,
    /// A node announcing itself; body is a [`NodeAnnouncement`].
    Join,
    /// A membership snapshot; body is a `Vec<(u8, SocketAddr)>`.
    Members,
    /// Liveness probe.
    Ping,
    /// Probe answer.
    Pong,
}

/// The envelope for all inter-node communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMessage {
    /// Id of the sending node.
    pub node_id: u8,
    /// Payload discriminator.
    pub kind: MessageKind,
    /// Kind-specific payload bytes.
    pub body: Vec<u8>,
}

/// Payload of a [`MessageKind::Join`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    /// The joining node's id.
    pub node_id: u8,
    /// Address the joining node's cluster listener is reachable at.
    pub listen: SocketAddr,
}

impl ClusterMessage {
    /// Build an envelope.
    pub fn new(node_id: u8, kind: MessageKind, body: Vec<u8>) -> Self {
        Self { node_id, kind, body }
    }

    /// Encode to the framed wire form: `u32-le length ++ bincode`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self).map_err(|e| ClusterError::Codec(e.to_string()))?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode the bincode payload of a frame (without the length prefix).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        bincode::deserialize(payload).map_err(|e| ClusterError::Codec(e.to_string()))
    }
}

/// Write one framed message to the stream.
pub async fn write_frame<W>(stream: &mut W, message: &ClusterMessage) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let frame = message.encode()?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed message from the stream.
pub async fn read_frame<R>(stream: &mut R) -> Result<ClusterMessage>
where
    R: AsyncReadExt + Unpin,
{
    let mut length_buf = [0u8; 4];
    stream.read_exact(&mut length_buf).await?;
    let length = u32::from_le_bytes(length_buf);
    if length > MAX_FRAME_SIZE {
        return Err(ClusterError::OversizedFrame(length));
    }
    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).await?;
    ClusterMessage::decode(&payload)
}
