//! # Herald Cluster
//!
//! Optional cluster mode for the Herald broker: gossip membership over TCP
//! and rebroadcast of locally-published messages so that every node ends up
//! holding every message.
//!
//! There is deliberately no consensus, no partition-tolerance story and no
//! deduplication beyond id ordering: a message authored on node A appears on
//! node B with A's node id stamped into its message id, which keeps the two
//! nodes' id spaces disjoint.

pub mod cluster;
pub mod membership;
pub mod messages;

pub use cluster::{Cluster, MessageHandler};
pub use membership::{Membership, Peer, PeerStatus};
pub use messages::{ClusterMessage, MessageKind};

use thiserror::Error;

/// Errors produced by the cluster layer.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A socket operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Codec(String),

    /// An inbound frame exceeded the size limit.
    #[error("oversized frame: {0} bytes")]
    OversizedFrame(u32),

    /// No remote peer could be contacted at join time.
    #[error("no remote hosts could be contacted to join the cluster")]
    JoinFailed,

    /// `start` was called before a message handler was installed.
    #[error("no message handler installed on the cluster")]
    HandlerMissing,

    /// The health score crossed the configured threshold.
    #[error("cluster health score {score} is above threshold {threshold}")]
    Unhealthy {
        /// Current health score (number of degraded peers).
        score: u32,
        /// Configured acceptable maximum.
        threshold: u32,
    },

    /// An embedded broker message failed to decode.
    #[error(transparent)]
    Message(#[from] herald_core::Error),
}

/// Result type alias for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
