//! The line-oriented client protocol.
//!
//! Clients speak single-character commands:
//!
//! ```text
//! > /path [messageId]\n<headerJson>\n<body>   publish
//! + /path [startId [count]]                   receive (replay and/or live)
//! - /path                                     cancel
//! ```
//!
//! The server answers with notification frames, one per line, prefixed with
//! `#` (or `#!` for errors), e.g. `#subscribed-to /foo` or
//! `#!error-bad-request unknown command`.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Notification name: connection established.
pub const SUCCESS_CONNECTED: &str = "connected";
/// Notification name: publish accepted.
pub const SUCCESS_SEND: &str = "send";
/// Notification name: replay stream starts.
pub const SUCCESS_FETCH_START: &str = "fetch-start";
/// Notification name: replay stream complete.
pub const SUCCESS_FETCH_END: &str = "fetch-end";
/// Notification name: live subscription installed.
pub const SUCCESS_SUBSCRIBED_TO: &str = "subscribed-to";
/// Notification name: subscription canceled.
pub const SUCCESS_CANCELED: &str = "canceled";
/// Error notification name: subscription failed.
pub const ERROR_SUBSCRIBED_TO: &str = "error-subscribed-to";
/// Error notification name: publish failed.
pub const ERROR_SEND: &str = "error-send";
/// Error notification name: malformed command.
pub const ERROR_BAD_REQUEST: &str = "error-bad-request";
/// Error notification name: internal server failure.
pub const ERROR_INTERNAL_SERVER: &str = "error-server-internal";

/// The kind of a parsed client command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdType {
    /// `>`: publish a message.
    Send,
    /// `+`: fetch and/or subscribe.
    Receive,
    /// `-`: cancel a subscription.
    Cancel,
}

impl CmdType {
    /// The single-character wire form of the command.
    pub const fn as_char(self) -> char {
        match self {
            Self::Send => '>',
            Self::Receive => '+',
            Self::Cancel => '-',
        }
    }
}

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    /// The command kind.
    pub name: CmdType,
    /// Everything after the command character on the first line.
    pub arg: String,
    /// The header JSON line (publish only, may be empty).
    pub header_json: String,
    /// The raw body (publish only, may be empty).
    pub body: Bytes,
}

impl Cmd {
    /// Parse a raw client frame into a command.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::bad_request("empty command"));
        }
        let line_end = data.iter().position(|&b| b == b'\n').unwrap_or(data.len());
        let first_line = std::str::from_utf8(&data[..line_end])
            .map_err(|_| Error::bad_request("command line is not valid utf-8"))?;

        let mut chars = first_line.chars();
        let name = match chars.next() {
            Some('>') => CmdType::Send,
            Some('+') => CmdType::Receive,
            Some('-') => CmdType::Cancel,
            Some(other) => {
                return Err(Error::bad_request(format!("unknown command {other:?}")));
            }
            None => return Err(Error::bad_request("empty command")),
        };
        let arg = chars.as_str().trim().to_string();

        let (header_json, body) = if name == CmdType::Send && line_end < data.len() {
            let rest = &data[line_end + 1..];
            match rest.iter().position(|&b| b == b'\n') {
                Some(header_end) => {
                    let header = std::str::from_utf8(&rest[..header_end])
                        .map_err(|_| Error::bad_request("header line is not valid utf-8"))?
                        .to_string();
                    (header, Bytes::copy_from_slice(&rest[header_end + 1..]))
                }
                None => (
                    std::str::from_utf8(rest)
                        .map_err(|_| Error::bad_request("header line is not valid utf-8"))?
                        .to_string(),
                    Bytes::new(),
                ),
            }
        } else {
            (String::new(), Bytes::new())
        };

        Ok(Self { name, arg, header_json, body })
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name.as_char(), self.arg)
    }
}

/// A server-to-client notification frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Frame name, e.g. `subscribed-to`.
    pub name: &'static str,
    /// Frame argument, e.g. the path.
    pub arg: String,
    /// Optional JSON attachment rendered on the following line.
    pub json: Option<String>,
    /// Whether the frame reports an error (`#!` prefix).
    pub is_error: bool,
}

impl Notification {
    /// A success notification.
    pub fn ok(name: &'static str, arg: impl Into<String>) -> Self {
        Self { name, arg: arg.into(), json: None, is_error: false }
    }

    /// An error notification.
    pub fn error(name: &'static str, arg: impl Into<String>) -> Self {
        Self { name, arg: arg.into(), json: None, is_error: true }
    }

    /// Attach a JSON payload line.
    pub fn with_json(mut self, json: impl Into<String>) -> Self {
        self.json = Some(json.into());
        self
    }

    /// Render the frame into its wire form.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(if self.is_error { b"#!" } else { b"#" });
        buf.put_slice(self.name.as_bytes());
        if !self.arg.is_empty() {
            buf.put_u8(b' ');
            buf.put_slice(self.arg.as_bytes());
        }
        if let Some(json) = &self.json {
            buf.put_u8(b'\n');
            buf.put_slice(json.as_bytes());
        }
        buf.freeze()
    }
}
