//! The append-only message partition: a chunked data log with a positional
//! index and monotonic id allocation.
//!
//! A partition owns pairs of files per chunk, `<name>-NNNNNNNNN.msg` holding
//! length-prefixed message blobs and `<name>-NNNNNNNNN.idx` holding fixed
//! 20-byte records `(offset u64, size u32, time i64)` addressed positionally:
//! the record for id `i` lives at byte `(i - base) * 20`, where `base` is the
//! chunk's first id, embedded zero-padded in the filename. A record with
//! `size == 0` marks an id never stored in this partition (cluster peers
//! allocate in disjoint id spaces, so local logs may have holes).
//!
//! Appends are serialized under the partition's write lock; the data write
//! precedes the index write, and a torn tail is repaired at open time by
//! truncating the index to whole records and the data file back to the last
//! entry the index can vouch for. Fetches snapshot chunk metadata under the
//! read lock and release it before touching the disk or the result channel.

use crate::store::{FetchDirection, FetchRequest, FetchedMessage};
use crate::{Result, StorageError};
use bytes::Bytes;
use herald_core::Message;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Ids covered by one chunk file pair.
pub const DEFAULT_CHUNK_CAPACITY: u64 = 1 << 20;

const INDEX_ENTRY_SIZE: u64 = 20;
const BLOB_PREFIX_SIZE: u64 = 4;

/// One fixed-width index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    offset: u64,
    size: u32,
    time: i64,
}

impl IndexEntry {
    fn encode(&self) -> [u8; INDEX_ENTRY_SIZE as usize] {
        let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..20].copy_from_slice(&self.time.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; INDEX_ENTRY_SIZE as usize]) -> Self {
        Self {
            offset: u64::from_le_bytes(buf[0..8].try_into().expect("slice length")),
            size: u32::from_le_bytes(buf[8..12].try_into().expect("slice length")),
            time: i64::from_le_bytes(buf[12..20].try_into().expect("slice length")),
        }
    }

    const fn is_vacant(&self) -> bool {
        self.size == 0
    }
}

/// In-memory descriptor of one chunk: the id range it may answer for.
#[derive(Debug, Clone)]
struct ChunkInfo {
    base_id: u64,
    min_id: u64,
    /// Highest id present; `base_id - 1` while the chunk is empty.
    max_id: u64,
}

impl ChunkInfo {
    const fn is_empty(&self) -> bool {
        self.max_id < self.min_id
    }
}

/// Open handles for the chunk currently receiving appends.
#[derive(Debug)]
struct ActiveChunk {
    base_id: u64,
    msg_file: File,
    idx_file: File,
    msg_len: u64,
}

#[derive(Debug, Default)]
struct Inner {
    chunks: Vec<ChunkInfo>,
    active: Option<ActiveChunk>,
    /// Highest id durably stored, 0 when the partition is empty.
    max_stored: u64,
    /// Highest id handed out by `generate_next_msg_id`.
    max_alloc: u64,
}

/// One append-only topic partition.
#[derive(Debug)]
pub struct MessagePartition {
    name: String,
    dir: PathBuf,
    chunk_capacity: u64,
    inner: RwLock<Inner>,
}

impl MessagePartition {
    /// Open the partition stored in `dir`, repairing a torn tail if the
    /// process previously crashed mid-append.
    pub fn open(dir: impl Into<PathBuf>, name: impl Into<String>) -> Result<Self> {
        Self::open_with_capacity(dir, name, DEFAULT_CHUNK_CAPACITY)
    }

    /// Open with an explicit chunk capacity (ids per file pair).
    pub fn open_with_capacity(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
        chunk_capacity: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        let name = name.into();
        assert!(chunk_capacity > 0, "chunk capacity must be positive");

        let mut bases = scan_chunk_bases(&dir, &name)?;
        bases.sort_unstable();

        let mut chunks = Vec::with_capacity(bases.len());
        for (i, &base_id) in bases.iter().enumerate() {
            let last = i == bases.len() - 1;
            if last {
                repair_chunk_tail(&dir, &name, base_id)?;
            }
            match scan_chunk(&dir, &name, base_id)? {
                Some((min_id, max_id)) => chunks.push(ChunkInfo { base_id, min_id, max_id }),
                None if last => {
                    // A tail chunk that repair emptied out entirely.
                    chunks.push(ChunkInfo { base_id, min_id: base_id, max_id: base_id - 1 });
                }
                None => {
                    return Err(StorageError::Corrupt {
                        partition: name.clone(),
                        reason: format!("chunk {base_id} is empty but not the newest"),
                    });
                }
            }
        }

        let max_stored = chunks.iter().rev().find(|c| !c.is_empty()).map_or(0, |c| c.max_id);
        info!(
            partition = %name,
            chunks = chunks.len(),
            max_id = max_stored,
            "opened message partition"
        );

        Ok(Self {
            name,
            dir,
            chunk_capacity,
            inner: RwLock::new(Inner { chunks, active: None, max_stored, max_alloc: max_stored }),
        })
    }

    /// The partition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Highest id stored so far, 0 if the partition is empty.
    pub async fn max_message_id(&self) -> u64 {
        self.inner.read().await.max_stored
    }

    /// Allocate the next message id and stamp a timestamp.
    ///
    /// In standalone mode (`node_id == 0`) ids are the bare sequence
    /// `max + 1`; with a positive node id the sequence is shifted left one
    /// byte and tagged with the node id in the low byte, keeping per-node
    /// allocation monotonic and id spaces disjoint across peers.
    pub async fn generate_next_msg_id(&self, node_id: u8) -> (u64, i64) {
        let mut inner = self.inner.write().await;
        let time = chrono::Utc::now().timestamp();
        let id = next_id(inner.max_stored.max(inner.max_alloc), node_id);
        inner.max_alloc = id;
        (id, time)
    }

    /// Append a pre-encoded blob under `id`.
    ///
    /// Locally generated ids arrive as `max + 1`; any id strictly greater
    /// than the current max is accepted so that ids preserved from cluster
    /// peers can interleave. Ids at or below the current max are rejected.
    pub async fn store(&self, id: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().await;
        let time = chrono::Utc::now().timestamp();
        self.append_locked(&mut inner, id, data, time)
    }

    /// Assign id/time/node to a locally originated message and append it in
    /// one critical section. Returns the encoded size.
    pub async fn store_message(&self, message: &mut Message, node_id: u8) -> Result<usize> {
        let mut inner = self.inner.write().await;
        if node_id == 0 || message.node_id == 0 {
            let time = chrono::Utc::now().timestamp();
            let id = next_id(inner.max_stored.max(inner.max_alloc), node_id);
            inner.max_alloc = id;
            message.id = id;
            message.time = time;
            message.node_id = node_id;
            debug!(partition = %self.name, id, time, "assigned local message id");
        }
        let data = message.encode();
        self.append_locked(&mut inner, message.id, &data, message.time)?;
        Ok(data.len())
    }

    /// Run `f(max_message_id)` while holding the partition's write lock.
    ///
    /// Nothing can be appended to this partition until the returned future
    /// resolves; receivers use this to subscribe without racing a publisher.
    pub async fn do_in_tx<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce(u64) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let inner = self.inner.write().await;
        f(inner.max_stored).await
    }

    /// Serve a fetch request on a dedicated task.
    pub fn fetch(self: &Arc<Self>, request: FetchRequest) {
        let partition = Arc::clone(self);
        tokio::spawn(async move {
            partition.run_fetch(request).await;
        });
    }

    /// Flush and release file handles.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(active) = inner.active.take() {
            active.msg_file.sync_all()?;
            active.idx_file.sync_all()?;
        }
        debug!(partition = %self.name, "closed message partition");
        Ok(())
    }

    fn append_locked(&self, inner: &mut Inner, id: u64, data: &[u8], time: i64) -> Result<()> {
        if id <= inner.max_stored {
            return Err(StorageError::InvalidSequence {
                partition: self.name.clone(),
                expected: inner.max_stored + 1,
                got: id,
            });
        }
        if data.is_empty() {
            return Err(StorageError::Corrupt {
                partition: self.name.clone(),
                reason: "refusing to store an empty blob".to_string(),
            });
        }

        let needs_new_chunk = match inner.chunks.last() {
            None => true,
            Some(chunk) => id >= chunk.base_id + self.chunk_capacity,
        };
        if needs_new_chunk {
            self.roll_chunk(inner, id)?;
        } else if inner.active.is_none() {
            let base_id = inner.chunks.last().expect("chunk exists").base_id;
            inner.active = Some(self.open_active(base_id)?);
        }

        let active = inner.active.as_mut().expect("active chunk");
        let offset = active.msg_len;
        let size = data.len() as u32;

        // Data first, index second: a crash between the two leaves a blob the
        // index does not know about, which open-time repair truncates away.
        active.msg_file.write_all(&size.to_le_bytes())?;
        active.msg_file.write_all(data)?;
        let entry = IndexEntry { offset, size, time };
        let position = (id - active.base_id) * INDEX_ENTRY_SIZE;
        active.idx_file.write_all_at(&entry.encode(), position)?;

        active.msg_len += BLOB_PREFIX_SIZE + u64::from(size);
        let chunk = inner.chunks.last_mut().expect("chunk exists");
        if chunk.is_empty() {
            chunk.min_id = id;
        }
        chunk.max_id = id;
        inner.max_stored = id;
        inner.max_alloc = inner.max_alloc.max(id);
        Ok(())
    }

    fn roll_chunk(&self, inner: &mut Inner, base_id: u64) -> Result<()> {
        if let Some(previous) = inner.active.take() {
            previous.msg_file.sync_all()?;
            previous.idx_file.sync_all()?;
        }
        let (msg_path, idx_path) = self.chunk_paths(base_id);
        let msg_file = OpenOptions::new().create(true).append(true).open(&msg_path)?;
        let idx_file = OpenOptions::new().create(true).read(true).write(true).open(&idx_path)?;
        info!(partition = %self.name, base_id, "opened new chunk");
        inner.active = Some(ActiveChunk { base_id, msg_file, idx_file, msg_len: 0 });
        inner.chunks.push(ChunkInfo { base_id, min_id: base_id, max_id: base_id - 1 });
        Ok(())
    }

    fn open_active(&self, base_id: u64) -> Result<ActiveChunk> {
        let (msg_path, idx_path) = self.chunk_paths(base_id);
        let msg_file = OpenOptions::new().append(true).open(&msg_path)?;
        let idx_file = OpenOptions::new().read(true).write(true).open(&idx_path)?;
        let msg_len = msg_file.metadata()?.len();
        Ok(ActiveChunk { base_id, msg_file, idx_file, msg_len })
    }

    fn chunk_paths(&self, base_id: u64) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{}-{:09}.msg", self.name, base_id)),
            self.dir.join(format!("{}-{:09}.idx", self.name, base_id)),
        )
    }

    async fn run_fetch(&self, request: FetchRequest) {
        let FetchRequest { start_id, direction, count, message_tx, start_tx, error_tx, .. } =
            request;

        // Snapshot chunk metadata, then release the lock before any disk read
        // or channel send so slow consumers cannot starve writers.
        let (chunks, max_stored) = {
            let inner = self.inner.read().await;
            (inner.chunks.clone(), inner.max_stored)
        };

        let oldest = chunks.iter().find(|c| !c.is_empty()).map(|c| c.min_id);
        let bound = match (oldest, direction) {
            (None, _) => 0,
            (Some(oldest), FetchDirection::Forward) => {
                let start = start_id.max(oldest);
                if start > max_stored {
                    0
                } else {
                    count.min((max_stored - start + 1) as usize)
                }
            }
            (Some(oldest), FetchDirection::Backward) => {
                let start = if start_id == 0 { max_stored } else { start_id.min(max_stored) };
                if start < oldest {
                    0
                } else {
                    count.min((start - oldest + 1) as usize)
                }
            }
        };
        let _ = start_tx.send(bound);
        if bound == 0 {
            return;
        }

        let result = match direction {
            FetchDirection::Forward => {
                self.stream_forward(&chunks, start_id, count, &message_tx).await
            }
            FetchDirection::Backward => {
                let start = if start_id == 0 { max_stored } else { start_id };
                self.stream_backward(&chunks, start, count, &message_tx).await
            }
        };
        if let Err(err) = result {
            warn!(partition = %self.name, error = %err, "fetch failed");
            let _ = error_tx.send(err);
            // Keep the message channel from closing cleanly: hand the sender
            // to a task that outlives the consumer's error check.
            tokio::spawn(async move {
                message_tx.closed().await;
            });
        }
    }

    async fn stream_forward(
        &self,
        chunks: &[ChunkInfo],
        start_id: u64,
        count: usize,
        tx: &mpsc::Sender<FetchedMessage>,
    ) -> Result<()> {
        let mut remaining = count;
        for chunk in chunks {
            if remaining == 0 {
                break;
            }
            if chunk.is_empty() || chunk.max_id < start_id {
                continue;
            }
            let reader = self.open_chunk_reader(chunk.base_id)?;
            let first = start_id.max(chunk.min_id);
            for id in first..=chunk.max_id {
                let Some(message) = reader.read_message(self, id)? else { continue };
                if tx.send(message).await.is_err() {
                    return Ok(());
                }
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn stream_backward(
        &self,
        chunks: &[ChunkInfo],
        start_id: u64,
        count: usize,
        tx: &mpsc::Sender<FetchedMessage>,
    ) -> Result<()> {
        let mut remaining = count;
        for chunk in chunks.iter().rev() {
            if remaining == 0 {
                break;
            }
            if chunk.is_empty() || chunk.min_id > start_id {
                continue;
            }
            let reader = self.open_chunk_reader(chunk.base_id)?;
            let last = start_id.min(chunk.max_id);
            for id in (chunk.min_id..=last).rev() {
                let Some(message) = reader.read_message(self, id)? else { continue };
                if tx.send(message).await.is_err() {
                    return Ok(());
                }
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    fn open_chunk_reader(&self, base_id: u64) -> Result<ChunkReader> {
        let (msg_path, idx_path) = self.chunk_paths(base_id);
        Ok(ChunkReader {
            base_id,
            idx_file: File::open(idx_path)?,
            msg_file: File::open(msg_path)?,
            idx_len: 0,
        }
        .with_len()?)
    }
}

/// Read-only view of one chunk used by fetch tasks.
struct ChunkReader {
    base_id: u64,
    idx_file: File,
    msg_file: File,
    idx_len: u64,
}

impl ChunkReader {
    fn with_len(mut self) -> Result<Self> {
        self.idx_len = self.idx_file.metadata()?.len();
        Ok(self)
    }

    /// Read the blob for `id`, or `None` for a vacant slot.
    fn read_message(
        &self,
        partition: &MessagePartition,
        id: u64,
    ) -> Result<Option<FetchedMessage>> {
        let position = (id - self.base_id) * INDEX_ENTRY_SIZE;
        if position + INDEX_ENTRY_SIZE > self.idx_len {
            return Ok(None);
        }
        let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
        self.idx_file.read_exact_at(&mut buf, position)?;
        let entry = IndexEntry::decode(&buf);
        if entry.is_vacant() {
            return Ok(None);
        }

        let mut prefix = [0u8; BLOB_PREFIX_SIZE as usize];
        self.msg_file.read_exact_at(&mut prefix, entry.offset)?;
        let stored_size = u32::from_le_bytes(prefix);
        if stored_size != entry.size {
            return Err(StorageError::Corrupt {
                partition: partition.name.clone(),
                reason: format!(
                    "id {id}: index says {} bytes, data file says {stored_size}",
                    entry.size
                ),
            });
        }
        let mut data = vec![0u8; entry.size as usize];
        self.msg_file.read_exact_at(&mut data, entry.offset + BLOB_PREFIX_SIZE)?;
        Ok(Some(FetchedMessage { id, offset: entry.offset, message: Bytes::from(data) }))
    }
}

/// Compute the id following `current` for the given originating node.
fn next_id(current: u64, node_id: u8) -> u64 {
    if node_id == 0 {
        current + 1
    } else {
        ((current >> 8) + 1) << 8 | u64::from(node_id)
    }
}

fn scan_chunk_bases(dir: &Path, name: &str) -> Result<Vec<u64>> {
    let prefix = format!("{name}-");
    let mut bases = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else { continue };
        let Some(stem) = file_name.strip_suffix(".idx") else { continue };
        let Some(base) = stem.strip_prefix(&prefix) else { continue };
        match base.parse::<u64>() {
            Ok(base_id) => bases.push(base_id),
            Err(_) => warn!(file = file_name, "ignoring file with unparseable chunk base"),
        }
    }
    Ok(bases)
}

/// Truncate a torn tail left by a crash: the index is cut back to whole
/// records whose data fully exists, then the data file is cut back to the
/// end of the last record the index vouches for.
fn repair_chunk_tail(dir: &Path, name: &str, base_id: u64) -> Result<()> {
    let idx_path = dir.join(format!("{name}-{base_id:09}.idx"));
    let msg_path = dir.join(format!("{name}-{base_id:09}.msg"));
    let idx_file = OpenOptions::new().read(true).write(true).open(&idx_path)?;
    let msg_file = OpenOptions::new().read(true).write(true).open(&msg_path)?;

    let idx_len = idx_file.metadata()?.len();
    let msg_len = msg_file.metadata()?.len();
    let mut valid = idx_len - idx_len % INDEX_ENTRY_SIZE;

    loop {
        if valid == 0 {
            msg_file.set_len(0)?;
            break;
        }
        let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
        idx_file.read_exact_at(&mut buf, valid - INDEX_ENTRY_SIZE)?;
        let entry = IndexEntry::decode(&buf);
        if entry.is_vacant() {
            valid -= INDEX_ENTRY_SIZE;
            continue;
        }
        let end = entry.offset + BLOB_PREFIX_SIZE + u64::from(entry.size);
        if end <= msg_len {
            if end < msg_len {
                warn!(
                    partition = name,
                    base_id,
                    dropped = msg_len - end,
                    "truncating unindexed bytes from data file"
                );
                msg_file.set_len(end)?;
            }
            break;
        }
        // Index record without its full blob: drop it.
        valid -= INDEX_ENTRY_SIZE;
    }

    if valid != idx_len {
        warn!(
            partition = name,
            base_id,
            dropped = idx_len - valid,
            "truncating torn tail from index file"
        );
        idx_file.set_len(valid)?;
        idx_file.sync_all()?;
        msg_file.sync_all()?;
    }
    Ok(())
}

/// Lowest and highest ids present in a chunk, `None` if it holds nothing.
fn scan_chunk(dir: &Path, name: &str, base_id: u64) -> Result<Option<(u64, u64)>> {
    let idx_path = dir.join(format!("{name}-{base_id:09}.idx"));
    let idx_file = File::open(idx_path)?;
    let records = idx_file.metadata()?.len() / INDEX_ENTRY_SIZE;

    let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
    let mut min_id = None;
    for position in 0..records {
        idx_file.read_exact_at(&mut buf, position * INDEX_ENTRY_SIZE)?;
        if !IndexEntry::decode(&buf).is_vacant() {
            min_id = Some(base_id + position);
            break;
        }
    }
    let Some(min_id) = min_id else { return Ok(None) };

    let mut max_id = min_id;
    for position in (0..records).rev() {
        idx_file.read_exact_at(&mut buf, position * INDEX_ENTRY_SIZE)?;
        if !IndexEntry::decode(&buf).is_vacant() {
            max_id = base_id + position;
            break;
        }
    }
    Ok(Some((min_id, max_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FetchRequest;
    use tempfile::TempDir;

    fn encoded(body: &str) -> Vec<u8> {
        format!("x,,,,,0,0,\n\n{body}").into_bytes()
    }

    async fn collect(results: crate::store::FetchResults) -> Vec<u64> {
        let mut results = results;
        let mut ids = Vec::new();
        while let Some(fetched) = results.messages.recv().await {
            ids.push(fetched.id);
        }
        ids
    }

    #[tokio::test]
    async fn ids_are_sequential_in_standalone_mode() {
        let dir = TempDir::new().unwrap();
        let partition = MessagePartition::open(dir.path(), "p").unwrap();

        let mut previous = 0;
        for _ in 0..5 {
            let (id, time) = partition.generate_next_msg_id(0).await;
            assert_eq!(id, previous + 1);
            assert!(time > 0);
            partition.store(id, &encoded("m")).await.unwrap();
            previous = id;
        }
        assert_eq!(partition.max_message_id().await, 5);
    }

    #[tokio::test]
    async fn store_rejects_out_of_order_ids() {
        let dir = TempDir::new().unwrap();
        let partition = MessagePartition::open(dir.path(), "p").unwrap();
        partition.store(1, &encoded("a")).await.unwrap();
        partition.store(2, &encoded("b")).await.unwrap();

        let err = partition.store(2, &encoded("dup")).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidSequence { expected: 3, got: 2, .. }
        ));
        let err = partition.store(1, &encoded("old")).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidSequence { got: 1, .. }));
    }

    #[tokio::test]
    async fn store_accepts_interleaved_cluster_ids() {
        let dir = TempDir::new().unwrap();
        let partition = MessagePartition::open(dir.path(), "p").unwrap();

        // A foreign peer's id is strictly greater than the local max but not
        // contiguous; the positional index keeps a vacant hole in between.
        let foreign = next_id(0, 3);
        partition.store(foreign, &encoded("from node 3")).await.unwrap();
        let (local, _) = partition.generate_next_msg_id(2).await;
        assert!(local > foreign);
        assert_eq!(local & 0xff, 2);
        partition.store(local, &encoded("from node 2")).await.unwrap();

        let (request, results) = FetchRequest::new("p", 0, FetchDirection::Forward, 100);
        let partition = Arc::new(partition);
        partition.fetch(request);
        assert_eq!(collect(results).await, vec![foreign, local]);
    }

    #[tokio::test]
    async fn fetch_forward_from_zero_returns_everything() {
        let dir = TempDir::new().unwrap();
        let partition = Arc::new(MessagePartition::open(dir.path(), "p").unwrap());
        for i in 1..=5u64 {
            partition.store(i, &encoded(&format!("m{i}"))).await.unwrap();
        }

        let (request, mut results) = FetchRequest::new("p", 0, FetchDirection::Forward, 100);
        partition.fetch(request);
        assert_eq!((&mut results.start).await.unwrap(), 5);
        assert_eq!(collect(results).await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn fetch_forward_respects_start_and_count() {
        let dir = TempDir::new().unwrap();
        let partition = Arc::new(MessagePartition::open(dir.path(), "p").unwrap());
        for i in 1..=10u64 {
            partition.store(i, &encoded(&format!("m{i}"))).await.unwrap();
        }

        let (request, results) = FetchRequest::new("p", 4, FetchDirection::Forward, 3);
        partition.fetch(request);
        assert_eq!(collect(results).await, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn fetch_past_the_end_is_empty_and_clean() {
        let dir = TempDir::new().unwrap();
        let partition = Arc::new(MessagePartition::open(dir.path(), "p").unwrap());
        for i in 1..=3u64 {
            partition.store(i, &encoded("m")).await.unwrap();
        }

        let (request, mut results) = FetchRequest::new("p", 4, FetchDirection::Forward, 10);
        partition.fetch(request);
        assert_eq!((&mut results.start).await.unwrap(), 0);
        assert_eq!(collect(results).await, Vec::<u64>::new());
    }

    #[tokio::test]
    async fn fetch_backward_returns_newest_first() {
        let dir = TempDir::new().unwrap();
        let partition = Arc::new(MessagePartition::open(dir.path(), "p").unwrap());
        for i in 1..=10u64 {
            partition.store(i, &encoded("m")).await.unwrap();
        }

        // Unpinned start (0) means "from the current max".
        let (request, mut results) = FetchRequest::new("p", 0, FetchDirection::Backward, 3);
        partition.fetch(request);
        assert_eq!((&mut results.start).await.unwrap(), 3);
        assert_eq!(collect(results).await, vec![10, 9, 8]);

        let (request, results) = FetchRequest::new("p", 6, FetchDirection::Backward, 100);
        partition.fetch(request);
        assert_eq!(collect(results).await, vec![6, 5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn payloads_round_trip_byte_identical() {
        let dir = TempDir::new().unwrap();
        let partition = Arc::new(MessagePartition::open(dir.path(), "p").unwrap());
        let blob = encoded("payload with \n newline and \x00 byte");
        partition.store(1, &blob).await.unwrap();

        let (request, mut results) = FetchRequest::new("p", 1, FetchDirection::Forward, 1);
        partition.fetch(request);
        let fetched = results.messages.recv().await.unwrap();
        assert_eq!(&fetched.message[..], &blob[..]);
    }

    #[tokio::test]
    async fn chunks_roll_at_capacity_and_fetch_spans_them() {
        let dir = TempDir::new().unwrap();
        let partition =
            Arc::new(MessagePartition::open_with_capacity(dir.path(), "p", 4).unwrap());
        for i in 1..=10u64 {
            partition.store(i, &encoded(&format!("m{i}"))).await.unwrap();
        }

        let mut files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|f| f.ends_with(".idx"))
            .collect();
        files.sort();
        assert_eq!(files, vec!["p-000000001.idx", "p-000000005.idx", "p-000000009.idx"]);

        let (request, results) = FetchRequest::new("p", 0, FetchDirection::Forward, 100);
        partition.fetch(request);
        assert_eq!(collect(results).await, (1..=10).collect::<Vec<_>>());

        let (request, results) = FetchRequest::new("p", 7, FetchDirection::Backward, 100);
        partition.fetch(request);
        assert_eq!(collect(results).await, (1..=7).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn max_id_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let partition = MessagePartition::open_with_capacity(dir.path(), "p", 4).unwrap();
            for i in 1..=6u64 {
                partition.store(i, &encoded("m")).await.unwrap();
            }
            partition.close().await.unwrap();
        }
        let partition = MessagePartition::open_with_capacity(dir.path(), "p", 4).unwrap();
        assert_eq!(partition.max_message_id().await, 6);
        let (id, _) = partition.generate_next_msg_id(0).await;
        assert_eq!(id, 7);
        partition.store(id, &encoded("m7")).await.unwrap();
    }

    #[test]
    fn next_id_layout() {
        assert_eq!(next_id(0, 0), 1);
        assert_eq!(next_id(41, 0), 42);
        // Node-tagged ids keep the node in the low byte and stay monotonic.
        assert_eq!(next_id(0, 2), 0x102);
        assert_eq!(next_id(0x102, 2), 0x202);
        assert_eq!(next_id(0x202, 1), 0x301);
        assert!(next_id(5, 1) > 5);
    }

    #[test]
    fn index_entry_round_trip() {
        let entry = IndexEntry { offset: 123_456, size: 789, time: -42 };
        assert_eq!(IndexEntry::decode(&entry.encode()), entry);
        assert!(!entry.is_vacant());
        assert!(IndexEntry { offset: 0, size: 0, time: 0 }.is_vacant());
    }
}
