//! Filesystem-backed message store: one directory per partition.

use crate::disk::{fs_usage, USAGE_THRESHOLD_PERCENT};
use crate::partition::MessagePartition;
use crate::store::{FetchRequest, MessageStore, TxCallback};
use crate::{Result, StorageError};
use async_trait::async_trait;
use herald_core::Message;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Durable [`MessageStore`] keeping one [`MessagePartition`] per first path
/// segment under a base directory. Partitions are created lazily on first
/// reference and enumerated from the directory tree, which stays the source
/// of truth across restarts.
pub struct FileMessageStore {
    base_dir: PathBuf,
    partitions: RwLock<HashMap<String, Arc<MessagePartition>>>,
}

impl FileMessageStore {
    /// Create a store rooted at `base_dir`; the directory is created if
    /// missing.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        info!(dir = %base_dir.display(), "opened file message store");
        Ok(Self { base_dir, partitions: RwLock::new(HashMap::new()) })
    }

    /// The partition for `name`, opened (and its directory created) on first
    /// use.
    pub async fn partition(&self, name: &str) -> Result<Arc<MessagePartition>> {
        {
            let partitions = self.partitions.read().await;
            if let Some(partition) = partitions.get(name) {
                return Ok(Arc::clone(partition));
            }
        }

        let mut partitions = self.partitions.write().await;
        // Racing openers: the second one finds the entry inserted first.
        if let Some(partition) = partitions.get(name) {
            return Ok(Arc::clone(partition));
        }
        let dir = self.base_dir.join(name);
        std::fs::create_dir_all(&dir)?;
        let partition = Arc::new(MessagePartition::open(dir, name)?);
        partitions.insert(name.to_string(), Arc::clone(&partition));
        Ok(partition)
    }
}

impl std::fmt::Debug for FileMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMessageStore").field("base_dir", &self.base_dir).finish()
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn store_message(&self, message: &mut Message, node_id: u8) -> Result<usize> {
        let partition = self.partition(message.path.partition()).await?;
        let size = partition.store_message(message, node_id).await?;
        tracing::debug!(
            id = message.id,
            partition = message.path.partition(),
            user_id = %message.user_id,
            node_id,
            size,
            "stored message"
        );
        Ok(size)
    }

    async fn store(&self, partition: &str, id: u64, data: &[u8]) -> Result<()> {
        self.partition(partition).await?.store(id, data).await
    }

    async fn fetch(&self, request: FetchRequest) {
        let partitions = self.partitions.read().await;
        match partitions.get(&request.partition) {
            Some(partition) => partition.fetch(request),
            None => {
                // Only partitions that exist on disk but are not yet open are
                // worth the lazy-open detour; anything else is an error.
                drop(partitions);
                if self.base_dir.join(&request.partition).is_dir() {
                    match self.partition(&request.partition).await {
                        Ok(partition) => partition.fetch(request),
                        Err(err) => {
                            let _ = request.error_tx.send(err);
                        }
                    }
                } else {
                    let _ = request
                        .error_tx
                        .send(StorageError::PartitionNotFound(request.partition.clone()));
                }
            }
        }
    }

    async fn max_message_id(&self, partition: &str) -> Result<u64> {
        Ok(self.partition(partition).await?.max_message_id().await)
    }

    async fn generate_next_msg_id(&self, partition: &str, node_id: u8) -> Result<(u64, i64)> {
        Ok(self.partition(partition).await?.generate_next_msg_id(node_id).await)
    }

    async fn do_in_tx<'a>(&self, partition: &str, f: TxCallback<'a>) -> Result<()> {
        self.partition(partition).await?.do_in_tx(|max_id| f(max_id)).await
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn check(&self) -> Result<()> {
        let usage = fs_usage(&self.base_dir)?;
        let percent = usage.usage_percent();
        if percent > USAGE_THRESHOLD_PERCENT {
            warn!(percent, "storage is almost full");
            return Err(StorageError::AlmostFull { usage_percent: percent });
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("stopping file message store");
        let mut partitions = self.partitions.write().await;
        let mut result = Ok(());
        for (name, partition) in partitions.drain() {
            if let Err(err) = partition.close().await {
                error!(partition = %name, error = %err, "error closing partition");
                result = Err(err);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FetchDirection;
    use bytes::Bytes;
    use herald_core::Path;
    use tempfile::TempDir;

    fn message(path: &str, body: &str) -> Message {
        Message {
            path: Path::from(path),
            user_id: "user01".to_string(),
            application_id: "app01".to_string(),
            body: Bytes::copy_from_slice(body.as_bytes()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn store_message_assigns_sequential_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::new(dir.path()).unwrap();

        for expected in 1..=4u64 {
            let mut msg = message("/chat/room1", "hi");
            let size = store.store_message(&mut msg, 0).await.unwrap();
            assert_eq!(msg.id, expected);
            assert!(msg.time > 0);
            assert_eq!(size, msg.encode().len());
        }
        assert_eq!(store.max_message_id("chat").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn partitions_share_a_log_per_first_segment() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::new(dir.path()).unwrap();

        let mut a = message("/chat/room1", "a");
        let mut b = message("/chat/room2", "b");
        let mut c = message("/news", "c");
        store.store_message(&mut a, 0).await.unwrap();
        store.store_message(&mut b, 0).await.unwrap();
        store.store_message(&mut c, 0).await.unwrap();

        // Same first segment, same sequence; different segment starts fresh.
        assert_eq!((a.id, b.id, c.id), (1, 2, 1));
        assert_eq!(store.partitions().await.unwrap(), vec!["chat", "news"]);
    }

    #[tokio::test]
    async fn cluster_messages_keep_their_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::new(dir.path()).unwrap();

        let mut foreign = message("/t/x", "from peer");
        foreign.id = 0x102;
        foreign.node_id = 2;
        foreign.time = 1_700_000_000;
        // Receiving node is 1; the message already carries node 2's id.
        store.store_message(&mut foreign, 1).await.unwrap();
        assert_eq!(foreign.id, 0x102);
        assert_eq!(foreign.node_id, 2);
        assert_eq!(store.max_message_id("t").await.unwrap(), 0x102);
    }

    #[tokio::test]
    async fn stored_message_fetches_byte_identical() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::new(dir.path()).unwrap();
        let mut msg = message("/chat/a", "hello world");
        msg.header_json = r#"{"k":"v"}"#.to_string();
        store.store_message(&mut msg, 0).await.unwrap();

        let (request, mut results) = FetchRequest::new("chat", 1, FetchDirection::Forward, 1);
        store.fetch(request).await;
        let fetched = results.messages.recv().await.unwrap();
        assert_eq!(fetched.message, msg.encode());
        let decoded = Message::decode(&fetched.message).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn fetch_of_unknown_partition_reports_an_error() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::new(dir.path()).unwrap();

        let (request, results) = FetchRequest::new("ghost", 0, FetchDirection::Forward, 10);
        store.fetch(request).await;
        let err = results.error.await.unwrap();
        assert!(matches!(err, StorageError::PartitionNotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn do_in_tx_blocks_appends() {
        use std::time::Duration;
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileMessageStore::new(dir.path()).unwrap());
        let mut msg = message("/p/x", "first");
        store.store_message(&mut msg, 0).await.unwrap();

        let store2 = Arc::clone(&store);
        let observed = Arc::new(std::sync::Mutex::new(0u64));
        let observed2 = Arc::clone(&observed);
        store
            .do_in_tx(
                "p",
                Box::new(move |max_id| {
                    Box::pin(async move {
                        *observed2.lock().unwrap() = max_id;
                        // A concurrent publisher must not get through while
                        // the transaction is open.
                        let mut racing = message("/p/y", "second");
                        let result = tokio::time::timeout(
                            Duration::from_millis(50),
                            store2.store_message(&mut racing, 0),
                        )
                        .await;
                        assert!(result.is_err(), "store should block during do_in_tx");
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();
        assert_eq!(*observed.lock().unwrap(), 1);
    }
}
