//! Crash-recovery behavior of the message partition: torn tails in either
//! file are repaired at open time and the partition keeps working.

use herald_storage::store::{FetchDirection, FetchRequest};
use herald_storage::MessagePartition;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const INDEX_ENTRY_SIZE: u64 = 20;

fn blob(body: &str) -> Vec<u8> {
    format!("x,,,,,0,0,\n\n{body}").into_bytes()
}

async fn fill(dir: &Path, count: u64) {
    let partition = MessagePartition::open(dir, "p").unwrap();
    for i in 1..=count {
        partition.store(i, &blob(&format!("message-{i}"))).await.unwrap();
    }
    partition.close().await.unwrap();
}

async fn surviving_ids(dir: &Path) -> Vec<u64> {
    let partition = Arc::new(MessagePartition::open(dir, "p").unwrap());
    let (request, mut results) = FetchRequest::new("p", 0, FetchDirection::Forward, 1000);
    partition.fetch(request);
    let mut ids = Vec::new();
    while let Some(fetched) = results.messages.recv().await {
        ids.push(fetched.id);
    }
    ids
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

#[tokio::test]
async fn partial_tail_index_record_is_discarded() {
    let dir = TempDir::new().unwrap();
    fill(dir.path(), 5).await;

    // Simulate a crash half-way through an index write: append 7 stray bytes.
    let idx = dir.path().join("p-000000001.idx");
    let mut file = OpenOptions::new().append(true).open(&idx).unwrap();
    file.write_all(&[0xAB; 7]).unwrap();
    drop(file);

    assert_eq!(surviving_ids(dir.path()).await, vec![1, 2, 3, 4, 5]);
    assert_eq!(file_len(&idx), 5 * INDEX_ENTRY_SIZE);
}

#[tokio::test]
async fn unindexed_data_tail_is_truncated() {
    let dir = TempDir::new().unwrap();
    fill(dir.path(), 3).await;

    // Crash after the data write but before the index write: the blob exists
    // with no index record vouching for it.
    let msg = dir.path().join("p-000000001.msg");
    let before = file_len(&msg);
    let stray = blob("never indexed");
    let mut file = OpenOptions::new().append(true).open(&msg).unwrap();
    file.write_all(&(stray.len() as u32).to_le_bytes()).unwrap();
    file.write_all(&stray).unwrap();
    drop(file);

    assert_eq!(surviving_ids(dir.path()).await, vec![1, 2, 3]);
    assert_eq!(file_len(&msg), before);
}

#[tokio::test]
async fn index_record_without_its_data_is_dropped() {
    let dir = TempDir::new().unwrap();
    fill(dir.path(), 4).await;

    // Cut the data file short so the last index record points past the end.
    let msg = dir.path().join("p-000000001.msg");
    let idx = dir.path().join("p-000000001.idx");
    let msg_file = OpenOptions::new().write(true).open(&msg).unwrap();
    msg_file.set_len(file_len(&msg) - 3).unwrap();
    drop(msg_file);

    // Id 4 is unrecoverable; the remaining three messages survive intact.
    assert_eq!(surviving_ids(dir.path()).await, vec![1, 2, 3]);
    assert_eq!(file_len(&idx), 3 * INDEX_ENTRY_SIZE);

    // And the sequence resumes where the repaired log ends.
    let partition = MessagePartition::open(dir.path(), "p").unwrap();
    assert_eq!(partition.max_message_id().await, 3);
    let (next, _) = partition.generate_next_msg_id(0).await;
    assert_eq!(next, 4);
    partition.store(next, &blob("rewritten")).await.unwrap();
    assert_eq!(partition.max_message_id().await, 4);
}

#[tokio::test]
async fn empty_truncated_log_restarts_from_one() {
    let dir = TempDir::new().unwrap();
    fill(dir.path(), 2).await;

    // Destroy every index record; repair empties the chunk completely.
    let idx = dir.path().join("p-000000001.idx");
    let msg = dir.path().join("p-000000001.msg");
    OpenOptions::new().write(true).open(&idx).unwrap().set_len(5).unwrap();
    OpenOptions::new().write(true).open(&msg).unwrap().set_len(2).unwrap();

    assert_eq!(surviving_ids(dir.path()).await, Vec::<u64>::new());

    let partition = MessagePartition::open(dir.path(), "p").unwrap();
    assert_eq!(partition.max_message_id().await, 0);
    let (next, _) = partition.generate_next_msg_id(0).await;
    assert_eq!(next, 1);
}

#[tokio::test]
async fn repair_only_touches_the_newest_chunk() {
    let dir = TempDir::new().unwrap();
    {
        let partition = MessagePartition::open_with_capacity(dir.path(), "p", 3).unwrap();
        for i in 1..=7u64 {
            partition.store(i, &blob(&format!("m{i}"))).await.unwrap();
        }
        partition.close().await.unwrap();
    }

    // Tear the tail of the newest chunk (base 7).
    let idx = dir.path().join("p-000000007.idx");
    let mut file = OpenOptions::new().append(true).open(&idx).unwrap();
    file.write_all(&[1, 2, 3]).unwrap();
    drop(file);

    let partition = Arc::new(MessagePartition::open_with_capacity(dir.path(), "p", 3).unwrap());
    assert_eq!(partition.max_message_id().await, 7);
    let (request, mut results) = FetchRequest::new("p", 0, FetchDirection::Forward, 100);
    partition.fetch(request);
    let mut ids = Vec::new();
    while let Some(fetched) = results.messages.recv().await {
        ids.push(fetched.id);
    }
    assert_eq!(ids, (1..=7).collect::<Vec<_>>());
}
