//! The message store seam and the asynchronous fetch protocol.

use crate::{Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use herald_core::Message;
use tokio::sync::{mpsc, oneshot};

/// Capacity of the per-fetch message channel.
pub const FETCH_CHANNEL_CAPACITY: usize = 10;

/// Direction of a fetch relative to ascending message ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    /// Ids `>= start_id`, ascending.
    Forward,
    /// Ids `<= start_id`, descending.
    Backward,
}

/// One message streamed out of a fetch.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    /// The message id.
    pub id: u64,
    /// Byte offset of the blob inside its data file.
    pub offset: u64,
    /// The encoded message, byte-identical to what was stored.
    pub message: Bytes,
}

/// A request for a bounded range of messages, streamed asynchronously.
///
/// The fetcher first sends a best-effort upper bound of the number of results
/// on `start_tx`, then each message on `message_tx` in the requested order,
/// then closes `message_tx` by dropping it. On the first error it sends on
/// `error_tx` and abandons both other channels.
#[derive(Debug)]
pub struct FetchRequest {
    /// Partition to read from.
    pub partition: String,
    /// First id of the range; `0` with [`FetchDirection::Forward`] means
    /// "from the oldest surviving id", `0` with [`FetchDirection::Backward`]
    /// means "from the current max".
    pub start_id: u64,
    /// Range direction.
    pub direction: FetchDirection,
    /// Maximum number of messages to return.
    pub count: usize,
    /// Streamed results.
    pub message_tx: mpsc::Sender<FetchedMessage>,
    /// Result-count upper bound, sent once before the first message.
    pub start_tx: oneshot::Sender<usize>,
    /// First error, if any.
    pub error_tx: oneshot::Sender<StorageError>,
}

/// Consumer half of a [`FetchRequest`].
#[derive(Debug)]
pub struct FetchResults {
    /// Streamed results; closed cleanly after the last message.
    pub messages: mpsc::Receiver<FetchedMessage>,
    /// Result-count upper bound.
    pub start: oneshot::Receiver<usize>,
    /// First error, if any.
    pub error: oneshot::Receiver<StorageError>,
}

impl FetchRequest {
    /// Create a request plus the consumer half of its channels.
    pub fn new(
        partition: impl Into<String>,
        start_id: u64,
        direction: FetchDirection,
        count: usize,
    ) -> (Self, FetchResults) {
        let (message_tx, messages) = mpsc::channel(FETCH_CHANNEL_CAPACITY);
        let (start_tx, start) = oneshot::channel();
        let (error_tx, error) = oneshot::channel();
        (
            Self { partition: partition.into(), start_id, direction, count, message_tx, start_tx, error_tx },
            FetchResults { messages, start, error },
        )
    }
}

/// Callback executed by [`MessageStore::do_in_tx`] under the partition lock.
pub type TxCallback<'a> = Box<dyn FnOnce(u64) -> BoxFuture<'a, Result<()>> + Send + 'a>;

/// The store seam the router and receivers depend on.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, assigning `(id, time, node_id)` first when the
    /// message originated locally (`node_id == 0` or `message.node_id == 0`).
    /// Returns the encoded size in bytes.
    async fn store_message(&self, message: &mut Message, node_id: u8) -> Result<usize>;

    /// Append a pre-encoded blob under an explicit id.
    async fn store(&self, partition: &str, id: u64, data: &[u8]) -> Result<()>;

    /// Serve a fetch request; all outcomes are reported on the request's
    /// channels, never through a return value.
    async fn fetch(&self, request: FetchRequest);

    /// Highest id stored in the partition, `0` if none.
    async fn max_message_id(&self, partition: &str) -> Result<u64>;

    /// Allocate the next message id and a timestamp for the partition.
    async fn generate_next_msg_id(&self, partition: &str, node_id: u8) -> Result<(u64, i64)>;

    /// Run `f(max_message_id)` while holding the partition's write lock, so
    /// no message can be stored to the partition until `f` resolves.
    async fn do_in_tx<'a>(&self, partition: &str, f: TxCallback<'a>) -> Result<()>;

    /// Enumerate partition names from the durable source of truth.
    async fn partitions(&self) -> Result<Vec<String>>;

    /// Storage health; an error marks the store unhealthy.
    fn check(&self) -> Result<()>;

    /// Flush and release all resources.
    async fn stop(&self) -> Result<()>;
}
