//! The Herald message record and its wire encoding.
//!
//! The encoding is deterministic so that cluster broadcast and persistence
//! agree byte-for-byte: a metadata line, the raw header JSON line, then the
//! body. Filters are kept in a [`BTreeMap`] so their JSON form is stable.

use crate::error::{Error, Result};
use crate::path::Path;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;

/// An immutable pub/sub message.
///
/// `id`, `time` and `node_id` are assigned by the message store when the
/// message is first persisted on its originating node; messages arriving from
/// the cluster keep the values stamped by their origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Monotonic message id within the partition (0 until stored).
    pub id: u64,

    /// Identifier of the originating cluster node (0 in standalone mode).
    pub node_id: u8,

    /// Server-assigned publication time, unix seconds.
    pub time: i64,

    /// The topic path the message was published to.
    pub path: Path,

    /// The user that published the message.
    pub user_id: String,

    /// The connection (application) that published the message.
    pub application_id: String,

    /// Opaque client correlation id, may be empty.
    pub message_id: String,

    /// Optional delivery filters, matched against route parameters.
    pub filters: Option<BTreeMap<String, String>>,

    /// Raw client-supplied header JSON, may be empty.
    pub header_json: String,

    /// The message body.
    pub body: Bytes,
}

impl Message {
    /// Set a single filter key, creating the filter map on first use.
    pub fn set_filter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.filters
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
    }

    /// The metadata line of the wire format, without the trailing newline.
    pub fn metadata_line(&self) -> String {
        let filters_json = match &self.filters {
            Some(filters) if !filters.is_empty() => {
                serde_json::to_string(filters).unwrap_or_default()
            }
            _ => String::new(),
        };
        format!(
            "{},{},{},{},{},{},{},{}",
            self.id,
            self.path,
            self.user_id,
            self.application_id,
            self.message_id,
            self.time,
            self.node_id,
            filters_json,
        )
    }

    /// Encode the message into its wire form.
    ///
    /// Layout: `metadata-line \n header-json \n body`. The same bytes are
    /// written to the partition log and broadcast to cluster peers.
    pub fn encode(&self) -> Bytes {
        let metadata = self.metadata_line();
        let mut buf =
            BytesMut::with_capacity(metadata.len() + self.header_json.len() + self.body.len() + 2);
        buf.put_slice(metadata.as_bytes());
        buf.put_u8(b'\n');
        buf.put_slice(self.header_json.as_bytes());
        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decode a message from its wire form.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let meta_end = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::invalid_message("missing metadata line"))?;
        let metadata = std::str::from_utf8(&data[..meta_end])
            .map_err(|_| Error::invalid_message("metadata line is not valid utf-8"))?;

        let rest = &data[meta_end + 1..];
        let header_end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::invalid_message("missing header line"))?;
        let header_json = std::str::from_utf8(&rest[..header_end])
            .map_err(|_| Error::invalid_message("header line is not valid utf-8"))?
            .to_string();
        let body = Bytes::copy_from_slice(&rest[header_end + 1..]);

        // The filters field is JSON and may itself contain commas, so it has
        // to be the final field of the metadata line.
        let fields: Vec<&str> = metadata.splitn(8, ',').collect();
        if fields.len() != 8 {
            return Err(Error::invalid_message(format!(
                "metadata line has {} fields, expected 8",
                fields.len()
            )));
        }

        let id = fields[0]
            .parse::<u64>()
            .map_err(|e| Error::invalid_message(format!("bad id {:?}: {e}", fields[0])))?;
        let time = fields[5]
            .parse::<i64>()
            .map_err(|e| Error::invalid_message(format!("bad time {:?}: {e}", fields[5])))?;
        let node_id = fields[6]
            .parse::<u8>()
            .map_err(|e| Error::invalid_message(format!("bad node id {:?}: {e}", fields[6])))?;
        let filters = if fields[7].is_empty() {
            None
        } else {
            Some(serde_json::from_str::<BTreeMap<String, String>>(fields[7])?)
        };

        Ok(Self {
            id,
            node_id,
            time,
            path: Path::from(fields[1]),
            user_id: fields[2].to_string(),
            application_id: fields[3].to_string(),
            message_id: fields[4].to_string(),
            filters,
            header_json,
            body,
        })
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        self.encode().len()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (node {})", self.path, self.id, self.node_id)
    }
}
