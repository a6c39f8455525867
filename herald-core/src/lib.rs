//! # Herald Core
//!
//! Shared vocabulary for the Herald pub/sub broker.
//!
//! This crate provides the building blocks every other Herald crate speaks in:
//! - Hierarchical topic [`Path`]s and their partition mapping
//! - The immutable [`Message`] record and its deterministic wire encoding
//! - The line-oriented client protocol (commands and notification frames)
//! - Configuration types for the whole service surface
//!
//! Messages are immutable values: the body is a cheap-to-clone [`bytes::Bytes`]
//! slice and the headers are small, so they are passed by value or by borrow
//! rather than behind shared pointers.

pub mod config;
pub mod error;
pub mod message;
pub mod path;
pub mod protocol;

pub use config::{ClusterConfig, HeraldConfig, StorageConfig, StoreBackend};
pub use error::{Error, Result};
pub use message::Message;
pub use path::Path;
pub use protocol::{Cmd, CmdType, Notification};

/// Re-export commonly used types for convenience.
pub mod prelude {
    pub use crate::{Cmd, CmdType, Error, Message, Notification, Path, Result};
    pub use bytes::Bytes;
}
