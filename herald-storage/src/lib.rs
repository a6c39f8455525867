//! # Herald Storage
//!
//! Message persistence for the Herald broker.
//!
//! This crate provides:
//! - [`MessagePartition`]: one append-only, chunked log per topic partition
//!   with a positional on-disk index and monotonic id allocation
//! - [`FileMessageStore`]: the durable store façade mapping partition names
//!   to lazily-opened partitions
//! - [`MemoryMessageStore`]: a non-persistent store that checkpoints its id
//!   sequences through the KV store
//! - [`kv`]: the small `(schema, key) → bytes` store abstraction with
//!   in-memory and sled backends
//!
//! Fetches are streamed: a [`FetchRequest`] carries bounded channels, the
//! fetcher task releases all shared locks before blocking on channel sends,
//! so slow readers never starve writers.

pub mod disk;
pub mod file_store;
pub mod kv;
pub mod memory_store;
pub mod partition;
pub mod store;

pub use file_store::FileMessageStore;
pub use memory_store::MemoryMessageStore;
pub use partition::MessagePartition;
pub use store::{
    FetchDirection, FetchRequest, FetchResults, FetchedMessage, MessageStore, TxCallback,
};

use thiserror::Error;

/// Errors produced by the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// An underlying filesystem operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// `store` was called with an id at or below the partition's current max.
    #[error(
        "out-of-sequence store on partition {partition:?}: next id should be {expected}, but was {got}"
    )]
    InvalidSequence {
        /// The partition rejecting the append.
        partition: String,
        /// The lowest id the partition would have accepted.
        expected: u64,
        /// The id that was supplied.
        got: u64,
    },

    /// A fetch referenced a partition that does not exist yet.
    #[error("no such partition: {0}")]
    PartitionNotFound(String),

    /// On-disk state disagrees with itself beyond what open-time repair fixes.
    #[error("partition {partition} is corrupt: {reason}")]
    Corrupt {
        /// The affected partition.
        partition: String,
        /// What was found.
        reason: String,
    },

    /// A key-value backend operation failed.
    #[error("kv store error: {0}")]
    Kv(String),

    /// The filesystem holding the store is above the usage threshold.
    #[error("storage is almost full: {usage_percent}% used")]
    AlmostFull {
        /// Current filesystem usage.
        usage_percent: u64,
    },

    /// Sentinel returned from a `do_in_tx` hand-off when messages were
    /// persisted past the caller's last seen id; the caller should fetch
    /// again before subscribing.
    #[error("unread messages available")]
    UnreadMessagesAvailable,

    /// A core-level failure surfaced through the storage seam, e.g. from a
    /// `do_in_tx` callback.
    #[error(transparent)]
    Core(#[from] herald_core::Error),

    /// The store has been stopped.
    #[error("message store is stopping")]
    Stopped,
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
