//! Receiver behavior: replay, the transactional hand-off to live delivery,
//! fetch-only mode and cancellation.

use bytes::Bytes;
use herald_broker::{Receiver, Router};
use herald_core::{Message, Path};
use herald_storage::kv::MemoryKvStore;
use herald_storage::FileMessageStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Fixture {
    router: Arc<Router>,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let kv = Arc::new(MemoryKvStore::new());
    let store = Arc::new(FileMessageStore::new(dir.path()).unwrap());
    let router = Arc::new(Router::new().with_message_store(store).with_kv_store(kv));
    router.start();
    Fixture { router, _dir: dir }
}

async fn publish(router: &Arc<Router>, path: &str, body: &str) {
    let message = Message {
        path: Path::from(path),
        user_id: "user01".to_string(),
        application_id: "publisher".to_string(),
        body: Bytes::copy_from_slice(body.as_bytes()),
        ..Default::default()
    };
    router.handle_message(message).await.unwrap();
}

/// Next outbound frame as text, within a deadline.
async fn next_frame(rx: &mut mpsc::Receiver<Bytes>) -> String {
    let bytes = timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("no frame within deadline")
        .expect("output channel closed");
    String::from_utf8_lossy(&bytes).into_owned()
}

fn frame_id(frame: &str) -> u64 {
    Message::decode(frame.as_bytes()).expect("not a message frame").id
}

#[tokio::test]
async fn replay_then_subscribe_without_gap() {
    let Fixture { router, _dir } = fixture();
    for i in 1..=5 {
        publish(&router, "/p/chat", &format!("m{i}")).await;
    }

    let (output_tx, mut output) = mpsc::channel(100);
    let (receiver, control) =
        Receiver::from_cmd("app1", "user01", "/p 3", Arc::clone(&router), output_tx).unwrap();
    receiver.start();

    assert_eq!(next_frame(&mut output).await, "#fetch-start /p 3");
    assert_eq!(frame_id(&next_frame(&mut output).await), 3);
    assert_eq!(frame_id(&next_frame(&mut output).await), 4);
    assert_eq!(frame_id(&next_frame(&mut output).await), 5);
    assert_eq!(next_frame(&mut output).await, "#fetch-end /p");
    assert_eq!(next_frame(&mut output).await, "#subscribed-to /p");

    // The subscription is live: the next publish arrives with id 6.
    publish(&router, "/p/chat", "live").await;
    let live = next_frame(&mut output).await;
    assert_eq!(frame_id(&live), 6);
    assert!(live.ends_with("live"));

    control.stop();
    assert_eq!(next_frame(&mut output).await, "#canceled /p");
}

#[tokio::test]
async fn replay_with_racing_publisher_loses_nothing() {
    let Fixture { router, _dir } = fixture();
    for i in 1..=5 {
        publish(&router, "/p/chat", &format!("m{i}")).await;
    }

    let (output_tx, mut output) = mpsc::channel(200);
    let (receiver, control) =
        Receiver::from_cmd("app1", "user01", "/p 1", Arc::clone(&router), output_tx).unwrap();
    receiver.start();

    // Publish more while the replay is in flight.
    let racing = {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            for i in 6..=20 {
                publish(&router, "/p/chat", &format!("m{i}")).await;
            }
        })
    };

    // Every id from 1 through 20 arrives exactly once, in order, regardless
    // of how fetch rounds and the live hand-off interleave.
    let mut seen = Vec::new();
    while seen.last() != Some(&20) {
        let frame = next_frame(&mut output).await;
        if frame.starts_with('#') {
            continue;
        }
        seen.push(frame_id(&frame));
    }
    racing.await.unwrap();
    assert_eq!(seen, (1..=20).collect::<Vec<u64>>());

    control.stop();
}

#[tokio::test]
async fn fetch_only_does_not_subscribe() {
    let Fixture { router, _dir } = fixture();
    for i in 1..=5 {
        publish(&router, "/p/chat", &format!("m{i}")).await;
    }

    let (output_tx, mut output) = mpsc::channel(100);
    let (receiver, _control) =
        Receiver::from_cmd("app1", "user01", "/p 2 2", Arc::clone(&router), output_tx).unwrap();
    receiver.start();

    assert_eq!(next_frame(&mut output).await, "#fetch-start /p 2");
    assert_eq!(frame_id(&next_frame(&mut output).await), 2);
    assert_eq!(frame_id(&next_frame(&mut output).await), 3);
    assert_eq!(next_frame(&mut output).await, "#fetch-end /p");

    // No subscription: later publishes produce no frames.
    publish(&router, "/p/chat", "after").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(output.try_recv().is_err());
}

#[tokio::test]
async fn negative_start_replays_the_last_n_then_subscribes() {
    let Fixture { router, _dir } = fixture();
    for i in 1..=5 {
        publish(&router, "/p/chat", &format!("m{i}")).await;
    }

    let (output_tx, mut output) = mpsc::channel(100);
    let (receiver, control) =
        Receiver::from_cmd("app1", "user01", "/p -3", Arc::clone(&router), output_tx).unwrap();
    receiver.start();

    assert_eq!(next_frame(&mut output).await, "#fetch-start /p 3");
    // Last three messages, newest first.
    assert_eq!(frame_id(&next_frame(&mut output).await), 5);
    assert_eq!(frame_id(&next_frame(&mut output).await), 4);
    assert_eq!(frame_id(&next_frame(&mut output).await), 3);
    assert_eq!(next_frame(&mut output).await, "#fetch-end /p");
    assert_eq!(next_frame(&mut output).await, "#subscribed-to /p");

    publish(&router, "/p/chat", "live").await;
    assert_eq!(frame_id(&next_frame(&mut output).await), 6);

    control.stop();
    assert_eq!(next_frame(&mut output).await, "#canceled /p");
}

#[tokio::test]
async fn pure_live_subscription_skips_replay() {
    let Fixture { router, _dir } = fixture();
    for i in 1..=3 {
        publish(&router, "/p/chat", &format!("old{i}")).await;
    }

    let (output_tx, mut output) = mpsc::channel(100);
    let (receiver, control) =
        Receiver::from_cmd("app1", "user01", "/p", Arc::clone(&router), output_tx).unwrap();
    receiver.start();

    assert_eq!(next_frame(&mut output).await, "#subscribed-to /p");
    publish(&router, "/p/chat", "fresh").await;
    let frame = next_frame(&mut output).await;
    assert_eq!(frame_id(&frame), 4);

    control.stop();
    assert_eq!(next_frame(&mut output).await, "#canceled /p");
}

#[tokio::test]
async fn replay_past_the_end_goes_straight_to_live() {
    let Fixture { router, _dir } = fixture();
    publish(&router, "/fresh", "only").await;

    let (output_tx, mut output) = mpsc::channel(100);
    let (receiver, control) =
        Receiver::from_cmd("app1", "user01", "/fresh 2", Arc::clone(&router), output_tx).unwrap();
    receiver.start();

    // The range starts past the current max: clean empty replay, then live.
    assert_eq!(next_frame(&mut output).await, "#fetch-start /fresh 0");
    assert_eq!(next_frame(&mut output).await, "#fetch-end /fresh");
    assert_eq!(next_frame(&mut output).await, "#subscribed-to /fresh");

    publish(&router, "/fresh", "second").await;
    assert_eq!(frame_id(&next_frame(&mut output).await), 2);

    control.stop();
}

#[tokio::test]
async fn fetch_of_a_missing_partition_reports_an_error_frame() {
    let Fixture { router, _dir } = fixture();

    let (output_tx, mut output) = mpsc::channel(100);
    let (receiver, _control) =
        Receiver::from_cmd("app1", "user01", "/ghost 1 5", Arc::clone(&router), output_tx)
            .unwrap();
    receiver.start();

    let frame = next_frame(&mut output).await;
    assert!(frame.starts_with("#!error-server-internal"), "got {frame:?}");
}

#[test]
fn malformed_receive_commands_are_rejected() {
    let dir = TempDir::new().unwrap();
    let kv = Arc::new(MemoryKvStore::new());
    let store = Arc::new(FileMessageStore::new(dir.path()).unwrap());
    let router = Arc::new(Router::new().with_message_store(store).with_kv_store(kv));

    let (output_tx, _output) = mpsc::channel(1);
    assert!(Receiver::from_cmd("a", "u", "nopath", Arc::clone(&router), output_tx.clone()).is_err());
    assert!(Receiver::from_cmd("a", "u", "/p abc", Arc::clone(&router), output_tx.clone()).is_err());
    assert!(Receiver::from_cmd("a", "u", "/p 1 x", Arc::clone(&router), output_tx).is_err());
}
