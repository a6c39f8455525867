//! The message router: single owner of the subscription table.
//!
//! All route-table mutations happen on one dispatch loop. Publishers,
//! subscribers and unsubscribers talk to the loop through bounded channels;
//! subscribe and unsubscribe block their caller until the loop acknowledges,
//! so a returned `subscribe` means the route is installed.

use crate::route::Route;
use async_trait::async_trait;
use dashmap::DashMap;
use herald_core::{Error, Message, Path, Result};
use herald_cluster::{Cluster, MessageHandler};
use herald_storage::kv::KvStore;
use herald_storage::{FetchRequest, MessageStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const HANDLE_CHANNEL_CAPACITY: usize = 500;
const SUBSCRIBE_CHANNEL_CAPACITY: usize = 10;
const UNSUBSCRIBE_CHANNEL_CAPACITY: usize = 10;
const OVERLOADED_HANDLE_CHANNEL_RATIO: f64 = 0.9;

/// Router counters, updated on the hot path with relaxed atomics.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    /// Messages accepted by `handle_message`.
    pub messages_incoming: AtomicU64,
    /// Messages fanned out by the dispatch loop.
    pub messages_routed: AtomicU64,
    /// Messages that matched no route.
    pub messages_not_matching: AtomicU64,
    /// Failed persistence attempts.
    pub message_store_errors: AtomicU64,
    /// Subscriptions installed.
    pub subscriptions: AtomicU64,
    /// Subscriptions that replaced an equal, already-installed route.
    pub duplicate_subscriptions: AtomicU64,
    /// Routes removed.
    pub unsubscriptions: AtomicU64,
    /// Unsubscribes of routes that were not installed.
    pub invalid_unsubscriptions: AtomicU64,
    /// Times `handle_c` was observed at or above 90% occupancy.
    pub overloaded_handle_channel: AtomicU64,
}

struct SubRequest {
    route: Arc<Route>,
    done: oneshot::Sender<()>,
}

struct LoopChannels {
    handle_rx: mpsc::Receiver<Message>,
    subscribe_rx: mpsc::Receiver<SubRequest>,
    unsubscribe_rx: mpsc::Receiver<SubRequest>,
    stop_rx: mpsc::Receiver<()>,
}

/// The central pub/sub router.
pub struct Router {
    routes: RwLock<HashMap<Path, Vec<Arc<Route>>>>,
    handle_tx: mpsc::Sender<Message>,
    subscribe_tx: mpsc::Sender<SubRequest>,
    unsubscribe_tx: mpsc::Sender<SubRequest>,
    stop_tx: mpsc::Sender<()>,
    stopping: AtomicBool,

    message_store: Option<Arc<dyn MessageStore>>,
    kv_store: Option<Arc<dyn KvStore>>,
    cluster: Option<Arc<Cluster>>,

    /// Serializes the persist-then-enqueue step per partition so fan-out
    /// order equals id order within a partition.
    publish_locks: DashMap<String, Arc<Mutex<()>>>,

    metrics: RouterMetrics,
    loop_channels: parking_lot::Mutex<Option<LoopChannels>>,
    loop_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Create a router; attach its services, then call [`Router::start`].
    pub fn new() -> Self {
        let (handle_tx, handle_rx) = mpsc::channel(HANDLE_CHANNEL_CAPACITY);
        let (subscribe_tx, subscribe_rx) = mpsc::channel(SUBSCRIBE_CHANNEL_CAPACITY);
        let (unsubscribe_tx, unsubscribe_rx) = mpsc::channel(UNSUBSCRIBE_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Self {
            routes: RwLock::new(HashMap::new()),
            handle_tx,
            subscribe_tx,
            unsubscribe_tx,
            stop_tx,
            stopping: AtomicBool::new(false),
            message_store: None,
            kv_store: None,
            cluster: None,
            publish_locks: DashMap::new(),
            metrics: RouterMetrics::default(),
            loop_channels: parking_lot::Mutex::new(Some(LoopChannels {
                handle_rx,
                subscribe_rx,
                unsubscribe_rx,
                stop_rx,
            })),
            loop_handle: parking_lot::Mutex::new(None),
        }
    }

    /// Attach the message store (mandatory).
    pub fn with_message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    /// Attach the KV store (mandatory).
    pub fn with_kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv_store = Some(kv);
        self
    }

    /// Attach the optional cluster.
    pub fn with_cluster(mut self, cluster: Arc<Cluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Start the dispatch loop.
    ///
    /// # Panics
    /// Panics if the message store or KV store was not provided; a missing
    /// mandatory service is a wiring bug that must not surface at the first
    /// request instead.
    pub fn start(self: &Arc<Self>) {
        assert!(
            self.message_store.is_some() && self.kv_store.is_some(),
            "router: mandatory services not set: message_store={}, kv_store={}",
            self.message_store.is_some(),
            self.kv_store.is_some(),
        );
        let channels = self
            .loop_channels
            .lock()
            .take()
            .expect("router started twice");
        info!("starting router");
        let router = Arc::clone(self);
        let handle = tokio::spawn(async move {
            router.dispatch_loop(channels).await;
        });
        *self.loop_handle.lock() = Some(handle);
    }

    /// Stop the router: reject new publishes, drain pending work, close
    /// every route exactly once.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping router");
        let _ = self.stop_tx.send(()).await;
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Whether shutdown has begun.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// The attached message store.
    pub fn message_store(&self) -> Result<Arc<dyn MessageStore>> {
        self.message_store
            .clone()
            .ok_or_else(|| Error::ServiceNotProvided { service: "message store".to_string() })
    }

    /// The attached KV store.
    pub fn kv_store(&self) -> Result<Arc<dyn KvStore>> {
        self.kv_store
            .clone()
            .ok_or_else(|| Error::ServiceNotProvided { service: "kv store".to_string() })
    }

    /// The attached cluster, if clustering is enabled.
    pub fn cluster(&self) -> Option<Arc<Cluster>> {
        self.cluster.clone()
    }

    /// Router counters.
    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// Persist a message and queue it for fan-out.
    ///
    /// Locally originated messages get their id and time stamped by the
    /// store; in cluster mode the message is also rebroadcast to peers after
    /// successful persistence.
    pub async fn handle_message(&self, message: Message) -> Result<()> {
        let mut message = message;
        debug!(
            path = %message.path,
            user_id = %message.user_id,
            message_id = %message.message_id,
            "handle message"
        );
        self.metrics.messages_incoming.fetch_add(1, Ordering::Relaxed);
        if self.is_stopping() {
            return Err(Error::stopping("Router"));
        }

        let node_id = self.cluster.as_ref().map_or(0, |cluster| cluster.node_id());
        let store = self.message_store()?;

        // Store and enqueue under a per-partition lock: fan-out order must
        // equal id order within a partition even with concurrent publishers.
        let lock = self
            .publish_locks
            .entry(message.path.partition().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        if let Err(err) = store.store_message(&mut message, node_id).await {
            error!(error = %err, "error storing message");
            self.metrics.message_store_errors.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Store { reason: err.to_string() });
        }

        self.warn_if_overloaded();
        if self.handle_tx.send(message.clone()).await.is_err() {
            return Err(Error::stopping("Router"));
        }
        drop(guard);

        if let Some(cluster) = &self.cluster {
            if message.node_id == cluster.node_id() {
                let cluster = Arc::clone(cluster);
                tokio::spawn(async move {
                    if let Err(err) = cluster.broadcast_message(&message).await {
                        warn!(error = %err, "cluster broadcast failed");
                    }
                });
            }
        }
        Ok(())
    }

    /// Serve a fetch request through the attached store.
    pub async fn fetch(&self, request: FetchRequest) -> Result<()> {
        if self.is_stopping() {
            return Err(Error::stopping("Router"));
        }
        self.message_store()?.fetch(request).await;
        Ok(())
    }

    /// Install a route. Returns once the dispatch loop has acknowledged, so
    /// every later matching publish reaches the route (or closes it).
    pub async fn subscribe(&self, route: Arc<Route>) -> Result<Arc<Route>> {
        debug!(route = %route, "subscribe");
        if self.is_stopping() {
            return Err(Error::stopping("Router"));
        }
        let (done, done_rx) = oneshot::channel();
        self.subscribe_tx
            .send(SubRequest { route: Arc::clone(&route), done })
            .await
            .map_err(|_| Error::stopping("Router"))?;
        done_rx.await.map_err(|_| Error::stopping("Router"))?;
        Ok(route)
    }

    /// Remove a route. Unknown routes are a counted no-op.
    pub async fn unsubscribe(&self, route: &Arc<Route>) {
        debug!(route = %route, "unsubscribe");
        let (done, done_rx) = oneshot::channel();
        if self
            .unsubscribe_tx
            .send(SubRequest { route: Arc::clone(route), done })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    /// Subscription parameters of every route installed exactly at `path`,
    /// as JSON.
    pub fn subscribers(&self, path: &Path) -> Result<Vec<u8>> {
        let routes = self.routes.read();
        let params: Vec<_> = routes
            .get(path)
            .map(|routes| routes.iter().map(|route| route.config().route_params.clone()).collect())
            .unwrap_or_default();
        Ok(serde_json::to_vec(&params)?)
    }

    /// Aggregated health of the router's collaborators.
    pub fn check(&self) -> Result<()> {
        let store = self.message_store()?;
        let kv = self.kv_store()?;
        if let Err(err) = store.check() {
            error!(error = %err, "message store check failed");
            return Err(Error::HealthCheck { reason: err.to_string() });
        }
        if let Err(err) = kv.check() {
            error!(error = %err, "kv store check failed");
            return Err(Error::HealthCheck { reason: err.to_string() });
        }
        if let Some(cluster) = &self.cluster {
            if let Err(err) = cluster.check() {
                error!(error = %err, "cluster check failed");
                return Err(Error::HealthCheck { reason: err.to_string() });
            }
        }
        Ok(())
    }

    async fn dispatch_loop(&self, mut channels: LoopChannels) {
        loop {
            if self.is_stopping() {
                self.drain(&mut channels).await;
                self.close_routes();
                info!("router stopped");
                return;
            }
            tokio::select! {
                Some(message) = channels.handle_rx.recv() => {
                    self.fan_out(&message).await;
                    // Keep the loop fair towards subscribe/unsubscribe under
                    // publish pressure.
                    tokio::task::yield_now().await;
                }
                Some(request) = channels.subscribe_rx.recv() => {
                    self.install_route(request.route);
                    let _ = request.done.send(());
                }
                Some(request) = channels.unsubscribe_rx.recv() => {
                    self.remove_route(&request.route);
                    let _ = request.done.send(());
                }
                Some(()) = channels.stop_rx.recv() => {
                    self.stopping.store(true, Ordering::Release);
                }
            }
        }
    }

    /// Work off everything already queued; new publishes are rejected by the
    /// stopping flag, so this terminates.
    async fn drain(&self, channels: &mut LoopChannels) {
        loop {
            let mut progressed = false;
            while let Ok(request) = channels.subscribe_rx.try_recv() {
                self.install_route(request.route);
                let _ = request.done.send(());
                progressed = true;
            }
            while let Ok(request) = channels.unsubscribe_rx.try_recv() {
                self.remove_route(&request.route);
                let _ = request.done.send(());
                progressed = true;
            }
            while let Ok(message) = channels.handle_rx.try_recv() {
                self.fan_out(&message).await;
                progressed = true;
            }
            if !progressed {
                return;
            }
        }
    }

    async fn fan_out(&self, message: &Message) {
        self.metrics.messages_routed.fetch_add(1, Ordering::Relaxed);

        // Snapshot matching routes, then deliver without holding the lock:
        // delivery may park on a full channel for the timeout window.
        let matching: Vec<Arc<Route>> = {
            let routes = self.routes.read();
            routes
                .iter()
                .filter(|(path, _)| message.path.matches_route(path))
                .flat_map(|(_, routes)| routes.iter().cloned())
                .collect()
        };
        if matching.is_empty() {
            debug!(path = %message.path, "no route matched");
            self.metrics.messages_not_matching.fetch_add(1, Ordering::Relaxed);
            return;
        }
        for route in matching {
            if let Err(Error::InvalidRoute) = route.deliver(message, false).await {
                self.remove_route(&route);
            }
        }
    }

    fn install_route(&self, route: Arc<Route>) {
        debug!(route = %route, "installing route");
        let mut routes = self.routes.write();
        let slice = routes.entry(route.path().clone()).or_default();
        let replaced = remove_if_matching(slice, &route);
        slice.push(route);
        if let Some(previous) = replaced {
            previous.close();
            self.metrics.duplicate_subscriptions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.subscriptions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn remove_route(&self, route: &Arc<Route>) {
        let mut routes = self.routes.write();
        let Some(slice) = routes.get_mut(route.path()) else {
            self.metrics.invalid_unsubscriptions.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match remove_if_matching(slice, route) {
            Some(removed) => {
                removed.close();
                self.metrics.unsubscriptions.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.metrics.invalid_unsubscriptions.fetch_add(1, Ordering::Relaxed);
            }
        }
        if slice.is_empty() {
            routes.remove(route.path());
        }
    }

    fn close_routes(&self) {
        let mut routes = self.routes.write();
        for (_, slice) in routes.drain() {
            for route in slice {
                debug!(route = %route, "closing route");
                route.close();
                self.metrics.unsubscriptions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn warn_if_overloaded(&self) {
        let max = self.handle_tx.max_capacity();
        let used = max - self.handle_tx.capacity();
        if used as f64 / max as f64 > OVERLOADED_HANDLE_CHANNEL_RATIO {
            warn!(used, max, "handle channel is almost full");
            self.metrics.overloaded_handle_channel.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("stopping", &self.is_stopping())
            .field("paths", &self.routes.read().len())
            .finish_non_exhaustive()
    }
}

/// Inbound cluster messages go through the regular publish path; the store
/// recognizes the foreign node id and preserves the origin's message id.
#[async_trait]
impl MessageHandler for Router {
    async fn handle_message(&self, message: Message) -> Result<()> {
        Router::handle_message(self, message).await
    }
}

/// Remove the first route equal to `route` (per the routes' matcher) from
/// the slice, returning it.
fn remove_if_matching(slice: &mut Vec<Arc<Route>>, route: &Arc<Route>) -> Option<Arc<Route>> {
    let position = slice.iter().position(|installed| installed.equal(route))?;
    Some(slice.remove(position))
}
