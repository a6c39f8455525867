//! The replay+live receiver: one state machine per `+` subscription.
//!
//! A receiver models the client command `+ /path [startId [count]]`:
//! - no id: pure live subscription
//! - `startId`: replay from that id, then subscribe
//! - `startId` and `count`: fetch only
//! - negative `startId`, no count: replay the last `|startId|` messages,
//!   then subscribe
//!
//! The hand-off from replay to live runs inside the store's `do_in_tx`
//! critical section: either no message was persisted past the last id the
//! receiver sent (subscribe happens under the partition lock), or the
//! receiver loops back to fetch the gap. Duplicates on the live path are
//! dropped by id.

use crate::route::{Route, RouteConfig};
use crate::router::Router;
use bytes::Bytes;
use herald_core::protocol::{
    ERROR_INTERNAL_SERVER, ERROR_SUBSCRIBED_TO, SUCCESS_CANCELED, SUCCESS_FETCH_END,
    SUCCESS_FETCH_START, SUCCESS_SUBSCRIBED_TO,
};
use herald_core::{Error, Message, Notification, Path, Result};
use herald_storage::{FetchDirection, FetchRequest, MessageStore, StorageError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Capacity of a receiver's route channel.
const ROUTE_CHANNEL_SIZE: usize = 10;

/// Handle owned by the transport to cancel a running receiver.
#[derive(Debug, Clone)]
pub struct ReceiverControl {
    path: Path,
    cancel_tx: mpsc::Sender<()>,
}

impl ReceiverControl {
    /// The path this receiver serves.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cancel the receiver; it unsubscribes and emits a `canceled` frame.
    pub fn stop(&self) {
        let _ = self.cancel_tx.try_send(());
    }
}

/// Phases of the replay/live machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FetchOnly,
    Fetching,
    Subscribing,
    HandOff,
    Live,
    Done,
}

/// Outcome of the transactional subscribe attempt.
enum HandOffOutcome {
    Subscribed,
    UnreadAvailable,
    Failed(String),
}

/// The per-subscription replay+live worker.
pub struct Receiver {
    path: Path,
    application_id: String,
    user_id: String,
    router: Arc<Router>,
    store: Arc<dyn MessageStore>,
    send_tx: mpsc::Sender<Bytes>,
    cancel_rx: mpsc::Receiver<()>,

    do_fetch: bool,
    do_subscription: bool,
    start_id: i64,
    /// 0 means "no explicit count".
    max_count: usize,
    last_sent_id: u64,
    should_stop: bool,

    route: Option<Arc<Route>>,
    route_rx: Option<mpsc::Receiver<Message>>,
}

impl Receiver {
    /// Build a receiver from the argument of a `+` command.
    pub fn from_cmd(
        application_id: impl Into<String>,
        user_id: impl Into<String>,
        arg: &str,
        router: Arc<Router>,
        send_tx: mpsc::Sender<Bytes>,
    ) -> Result<(Self, ReceiverControl)> {
        if !arg.starts_with('/') {
            return Err(Error::bad_request("command requires a path argument, but none given"));
        }
        let parts: Vec<&str> = arg.splitn(3, ' ').collect();
        let path = Path::from(parts[0]);

        let mut do_fetch = false;
        let mut start_id = 0i64;
        if parts.len() > 1 {
            do_fetch = true;
            start_id = parts[1].parse::<i64>().map_err(|e| {
                Error::bad_request(format!("start id has to be empty or int, but was {:?}: {e}", parts[1]))
            })?;
        }

        let mut do_subscription = true;
        let mut max_count = 0usize;
        if parts.len() > 2 {
            do_subscription = false;
            max_count = parts[2].parse::<usize>().map_err(|e| {
                Error::bad_request(format!("count has to be empty or int, but was {:?}: {e}", parts[2]))
            })?;
        }

        let store = router.message_store()?;
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        let control = ReceiverControl { path: path.clone(), cancel_tx };
        let receiver = Self {
            path,
            application_id: application_id.into(),
            user_id: user_id.into(),
            router,
            store,
            send_tx,
            cancel_rx,
            do_fetch,
            do_subscription,
            start_id,
            max_count,
            last_sent_id: 0,
            should_stop: false,
            route: None,
            route_rx: None,
        };
        Ok((receiver, control))
    }

    /// Run the machine on its own task.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut state = if self.do_fetch && !self.do_subscription {
            State::FetchOnly
        } else if self.do_fetch {
            State::Fetching
        } else {
            State::Subscribing
        };

        while state != State::Done {
            debug!(path = %self.path, ?state, last_sent_id = self.last_sent_id, "receiver state");
            state = match state {
                State::FetchOnly => {
                    if let Err(err) = self.fetch().await {
                        error!(path = %self.path, error = %err, "fetch failed");
                        self.send_error(ERROR_INTERNAL_SERVER, err.to_string()).await;
                    }
                    State::Done
                }
                State::Fetching => match self.fetch().await {
                    Err(err) => {
                        error!(path = %self.path, error = %err, "fetch failed");
                        self.send_error(ERROR_INTERNAL_SERVER, err.to_string()).await;
                        State::Done
                    }
                    Ok(()) if self.should_stop => State::Done,
                    Ok(()) => State::HandOff,
                },
                State::Subscribing => match self.subscribe().await {
                    Ok(()) => State::Live,
                    Err(err) => {
                        self.send_error(ERROR_SUBSCRIBED_TO, format!("{} {err}", self.path))
                            .await;
                        State::Done
                    }
                },
                State::HandOff => match self.subscribe_if_no_unread_messages().await {
                    HandOffOutcome::Subscribed => State::Live,
                    HandOffOutcome::UnreadAvailable => {
                        // Messages were persisted past our last id while we
                        // were replaying: close the gap before going live.
                        debug!(
                            path = %self.path,
                            last_sent_id = self.last_sent_id,
                            "unread messages available, fetching again"
                        );
                        self.start_id = self.last_sent_id as i64 + 1;
                        State::Fetching
                    }
                    HandOffOutcome::Failed(reason) => {
                        self.send_error(ERROR_INTERNAL_SERVER, reason).await;
                        State::Done
                    }
                },
                State::Live => {
                    self.receive_from_subscription().await;
                    if self.should_stop {
                        State::Done
                    } else {
                        // The router detached us as too slow for realtime
                        // listening: fetch the gap and subscribe again.
                        self.start_id = self.last_sent_id as i64 + 1;
                        State::Fetching
                    }
                }
                State::Done => State::Done,
            };
        }
        debug!(path = %self.path, "receiver finished");
    }

    /// Install a fresh route with the router. Emits `subscribed-to` on
    /// success.
    async fn subscribe(&mut self) -> Result<()> {
        let config = RouteConfig::new(self.path.clone())
            .with_channel_size(ROUTE_CHANNEL_SIZE)
            .with_param("application_id", self.application_id.clone())
            .with_param("user_id", self.user_id.clone());
        let route = Route::new(config);
        self.route_rx = route.take_messages();
        let route = self.router.subscribe(route).await?;
        self.route = Some(route);
        self.send_ok(SUCCESS_SUBSCRIBED_TO, self.path.to_string()).await;
        Ok(())
    }

    /// The transactional hand-off: under the partition lock, subscribe only
    /// if nothing was persisted past `last_sent_id`.
    async fn subscribe_if_no_unread_messages(&mut self) -> HandOffOutcome {
        let store = Arc::clone(&self.store);
        let partition = self.path.partition().to_string();
        let last_sent_id = self.last_sent_id;
        let this = &mut *self;
        let result = store
            .do_in_tx(
                &partition,
                Box::new(move |max_id| {
                    Box::pin(async move {
                        if max_id > last_sent_id {
                            return Err(StorageError::UnreadMessagesAvailable);
                        }
                        this.subscribe().await.map_err(StorageError::from)
                    })
                }),
            )
            .await;
        match result {
            Ok(()) => HandOffOutcome::Subscribed,
            Err(StorageError::UnreadMessagesAvailable) => HandOffOutcome::UnreadAvailable,
            Err(err) => HandOffOutcome::Failed(err.to_string()),
        }
    }

    /// Forward live messages until cancel or until the router closes the
    /// route channel.
    async fn receive_from_subscription(&mut self) {
        let Some(mut route_rx) = self.route_rx.take() else {
            self.should_stop = true;
            return;
        };
        loop {
            tokio::select! {
                received = route_rx.recv() => match received {
                    Some(message) => {
                        if message.id > self.last_sent_id {
                            self.last_sent_id = message.id;
                            self.send_raw(message.encode()).await;
                            if self.should_stop {
                                self.unsubscribe().await;
                                return;
                            }
                        } else {
                            debug!(id = message.id, "already sent to client, dropping");
                        }
                    }
                    None => {
                        debug!(path = %self.path, "router closed the route channel");
                        self.route = None;
                        return;
                    }
                },
                _ = self.cancel_rx.recv() => {
                    self.should_stop = true;
                    self.unsubscribe().await;
                    self.send_ok(SUCCESS_CANCELED, self.path.to_string()).await;
                    return;
                }
            }
        }
    }

    /// Replay one bounded range from the store.
    async fn fetch(&mut self) -> std::result::Result<(), StorageError> {
        let partition = self.path.partition().to_string();
        let (start_id, direction, count) = if self.start_id >= 0 {
            let count = if self.max_count == 0 { usize::MAX } else { self.max_count };
            (self.start_id as u64, FetchDirection::Forward, count)
        } else {
            let max_id = self.store.max_message_id(&partition).await?;
            let count =
                if self.max_count == 0 { self.start_id.unsigned_abs() as usize } else { self.max_count };
            (max_id, FetchDirection::Backward, count)
        };

        let (request, mut results) = FetchRequest::new(partition, start_id, direction, count);
        self.store.fetch(request).await;

        tokio::select! {
            started = &mut results.start => {
                if let Ok(n) = started {
                    self.send_ok(SUCCESS_FETCH_START, format!("{} {n}", self.path)).await;
                }
            }
            _ = self.cancel_rx.recv() => {
                self.should_stop = true;
                self.send_ok(SUCCESS_CANCELED, self.path.to_string()).await;
                return Ok(());
            }
        }

        let mut error_settled = false;
        loop {
            tokio::select! {
                received = results.messages.recv() => match received {
                    Some(fetched) => {
                        debug!(id = fetched.id, path = %self.path, "replaying message");
                        self.last_sent_id = self.last_sent_id.max(fetched.id);
                        self.send_raw(fetched.message).await;
                        if self.should_stop {
                            return Ok(());
                        }
                    }
                    None => {
                        // A producer that died with an error drops the
                        // message channel too; prefer the error.
                        if !error_settled {
                            if let Ok(err) = results.error.try_recv() {
                                return Err(err);
                            }
                        }
                        self.send_ok(SUCCESS_FETCH_END, self.path.to_string()).await;
                        return Ok(());
                    }
                },
                failure = &mut results.error, if !error_settled => {
                    error_settled = true;
                    if let Ok(err) = failure {
                        return Err(err);
                    }
                    // Sender dropped with no error: completion arrives via
                    // the message channel.
                }
                _ = self.cancel_rx.recv() => {
                    self.should_stop = true;
                    self.send_ok(SUCCESS_CANCELED, self.path.to_string()).await;
                    return Ok(());
                }
            }
        }
    }

    async fn unsubscribe(&mut self) {
        if let Some(route) = self.route.take() {
            self.router.unsubscribe(&route).await;
        }
    }

    async fn send_raw(&mut self, bytes: Bytes) {
        if self.send_tx.send(bytes).await.is_err() {
            // Transport is gone; wind the receiver down.
            self.should_stop = true;
        }
    }

    async fn send_ok(&mut self, name: &'static str, arg: String) {
        let frame = Notification::ok(name, arg).to_bytes();
        self.send_raw(frame).await;
    }

    async fn send_error(&mut self, name: &'static str, arg: String) {
        let frame = Notification::error(name, arg).to_bytes();
        self.send_raw(frame).await;
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("path", &self.path)
            .field("application_id", &self.application_id)
            .field("do_fetch", &self.do_fetch)
            .field("do_subscription", &self.do_subscription)
            .field("start_id", &self.start_id)
            .field("last_sent_id", &self.last_sent_id)
            .finish_non_exhaustive()
    }
}
