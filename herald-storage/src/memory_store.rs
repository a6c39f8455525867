//! Non-persistent message store with KV-backed sequence checkpoints.
//!
//! Messages themselves are not retained; the store's job is to keep each
//! partition's id sequence monotonic across restarts by flushing the current
//! max id into the KV store periodically. Services that only need live
//! delivery run on this backend.

use crate::kv::KvStore;
use crate::store::{FetchRequest, MessageStore, TxCallback};
use crate::{Result, StorageError};
use async_trait::async_trait;
use herald_core::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// KV schema holding one `partition → max id` entry per partition.
pub const TOPIC_SEQUENCE_SCHEMA: &str = "topic_sequence";

/// How often dirty sequences are flushed to the KV store.
const SEQUENCE_SYNC_INTERVAL: Duration = Duration::from_millis(100);

/// A [`MessageStore`] that persists sequences, not messages.
pub struct MemoryMessageStore {
    sequences: Arc<Mutex<HashMap<String, u64>>>,
    kv: Arc<dyn KvStore>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    stopped_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl MemoryMessageStore {
    /// Create the store over the given KV backend.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            sequences: Arc::new(Mutex::new(HashMap::new())),
            kv,
            stop_tx: Mutex::new(None),
            stopped_rx: Mutex::new(None),
        }
    }

    /// Start the background sequence flusher.
    pub async fn start(&self) {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (stopped_tx, stopped_rx) = mpsc::channel::<()>(1);
        *self.stop_tx.lock().await = Some(stop_tx);
        *self.stopped_rx.lock().await = Some(stopped_rx);

        let sequences = Arc::clone(&self.sequences);
        let kv = Arc::clone(&self.kv);
        tokio::spawn(async move {
            let mut last_synced: HashMap<String, u64> = HashMap::new();
            let mut should_stop = false;
            while !should_stop {
                tokio::select! {
                    _ = tokio::time::sleep(SEQUENCE_SYNC_INTERVAL) => {}
                    _ = stop_rx.recv() => should_stop = true,
                }

                let dirty: Vec<(String, u64)> = {
                    let sequences = sequences.lock().await;
                    sequences
                        .iter()
                        .filter(|(partition, seq)| last_synced.get(*partition) != Some(seq))
                        .map(|(partition, seq)| (partition.clone(), *seq))
                        .collect()
                };
                for (partition, seq) in dirty {
                    if let Err(err) = kv
                        .put(TOPIC_SEQUENCE_SCHEMA, &partition, seq.to_string().as_bytes())
                        .await
                    {
                        warn!(partition = %partition, error = %err, "sequence sync failed");
                        continue;
                    }
                    last_synced.insert(partition, seq);
                }
            }
            debug!("sequence flusher stopped");
            let _ = stopped_tx.send(()).await;
        });
        info!("started memory message store");
    }

    /// Max id for `partition`, falling back to the KV checkpoint on first
    /// reference. Caller holds the sequences lock.
    async fn max_locked(&self, sequences: &mut HashMap<String, u64>, partition: &str) -> Result<u64> {
        if let Some(seq) = sequences.get(partition) {
            return Ok(*seq);
        }
        let seq = match self.kv.get(TOPIC_SEQUENCE_SCHEMA, partition).await? {
            Some(raw) => String::from_utf8_lossy(&raw)
                .parse::<u64>()
                .map_err(|e| StorageError::Kv(format!("bad sequence checkpoint: {e}")))?,
            None => 0,
        };
        sequences.insert(partition.to_string(), seq);
        Ok(seq)
    }
}

impl std::fmt::Debug for MemoryMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMessageStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn store_message(&self, message: &mut Message, node_id: u8) -> Result<usize> {
        let partition = message.path.partition().to_string();
        let mut sequences = self.sequences.lock().await;
        let max = self.max_locked(&mut sequences, &partition).await?;
        if node_id == 0 || message.node_id == 0 {
            message.id = max + 1;
            message.time = chrono::Utc::now().timestamp();
            message.node_id = node_id;
        } else if message.id <= max {
            return Err(StorageError::InvalidSequence {
                expected: max + 1,
                got: message.id,
                partition,
            });
        }
        sequences.insert(partition, message.id);
        Ok(message.encode().len())
    }

    async fn store(&self, partition: &str, id: u64, _data: &[u8]) -> Result<()> {
        let mut sequences = self.sequences.lock().await;
        let max = self.max_locked(&mut sequences, partition).await?;
        if id <= max {
            return Err(StorageError::InvalidSequence {
                partition: partition.to_string(),
                expected: max + 1,
                got: id,
            });
        }
        sequences.insert(partition.to_string(), id);
        Ok(())
    }

    async fn fetch(&self, request: FetchRequest) {
        // Nothing is retained, so every fetch completes empty but clean.
        let _ = request.start_tx.send(0);
    }

    async fn max_message_id(&self, partition: &str) -> Result<u64> {
        let mut sequences = self.sequences.lock().await;
        self.max_locked(&mut sequences, partition).await
    }

    async fn generate_next_msg_id(&self, partition: &str, _node_id: u8) -> Result<(u64, i64)> {
        let mut sequences = self.sequences.lock().await;
        let max = self.max_locked(&mut sequences, partition).await?;
        let next = max + 1;
        sequences.insert(partition.to_string(), next);
        Ok((next, chrono::Utc::now().timestamp()))
    }

    async fn do_in_tx<'a>(&self, partition: &str, f: TxCallback<'a>) -> Result<()> {
        let mut sequences = self.sequences.lock().await;
        let max = self.max_locked(&mut sequences, partition).await?;
        f(max).await
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        let sequences = self.sequences.lock().await;
        let mut names: Vec<String> = sequences.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn check(&self) -> Result<()> {
        self.kv.check()
    }

    async fn stop(&self) -> Result<()> {
        let stop_tx = self.stop_tx.lock().await.take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(()).await;
            if let Some(mut stopped_rx) = self.stopped_rx.lock().await.take() {
                let _ = stopped_rx.recv().await;
            }
        }
        info!("stopped memory message store");
        Ok(())
    }
}
