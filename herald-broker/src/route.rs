//! Routes: installed subscriptions and their delivery contract.

use herald_core::{Error, Message, Path, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Default capacity of a route's delivery channel.
pub const DEFAULT_CHANNEL_SIZE: usize = 10;

/// Default grace period for delivery to a full channel before the route is
/// dropped as a slow consumer.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_millis(5);

/// Subscription parameters, e.g. `application_id` and `user_id`.
pub type RouteParams = BTreeMap<String, String>;

/// Decides whether two route configurations denote the same subscription.
///
/// Connectors supply their own matcher (say, "same path and application id")
/// without the router knowing anything about those keys.
pub type Matcher = Arc<dyn Fn(&RouteConfig, &RouteConfig) -> bool + Send + Sync>;

/// Configuration of a subscription.
#[derive(Clone)]
pub struct RouteConfig {
    /// The subscribed topic path.
    pub path: Path,
    /// Subscription parameters.
    pub route_params: RouteParams,
    /// Delivery channel capacity.
    pub channel_size: usize,
    /// Grace period for delivery to a full channel.
    pub timeout: Duration,
    /// Optional equality matcher; full parameter equality when absent.
    pub matcher: Option<Matcher>,
}

impl RouteConfig {
    /// A config for `path` with default capacity and timeout.
    pub fn new(path: impl Into<Path>) -> Self {
        Self {
            path: path.into(),
            route_params: RouteParams::new(),
            channel_size: DEFAULT_CHANNEL_SIZE,
            timeout: DEFAULT_DELIVERY_TIMEOUT,
            matcher: None,
        }
    }

    /// Add one subscription parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.route_params.insert(key.into(), value.into());
        self
    }

    /// Override the delivery channel capacity.
    pub fn with_channel_size(mut self, channel_size: usize) -> Self {
        self.channel_size = channel_size;
        self
    }

    /// Override the delivery timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Install an equality matcher.
    pub fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matcher = Some(matcher);
        self
    }
}

impl fmt::Debug for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteConfig")
            .field("path", &self.path)
            .field("route_params", &self.route_params)
            .field("channel_size", &self.channel_size)
            .field("timeout", &self.timeout)
            .field("matcher", &self.matcher.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// A matcher comparing the path plus the listed parameter keys only.
pub fn key_matcher(keys: &[&str]) -> Matcher {
    let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    Arc::new(move |a: &RouteConfig, b: &RouteConfig| {
        a.path == b.path
            && keys.iter().all(|key| a.route_params.get(key) == b.route_params.get(key))
    })
}

/// An installed subscription: config, bounded delivery channel, lifecycle.
///
/// The channel is closed exactly once, either by the router at removal or by
/// `deliver` when the consumer falls behind; every later delivery attempt
/// reports [`Error::InvalidRoute`].
pub struct Route {
    config: RouteConfig,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    receiver: Mutex<Option<mpsc::Receiver<Message>>>,
    invalid: AtomicBool,
}

impl Route {
    /// Create a route; the consumer claims the channel with
    /// [`Route::take_messages`].
    pub fn new(config: RouteConfig) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.channel_size.max(1));
        Arc::new(Self {
            config,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            invalid: AtomicBool::new(false),
        })
    }

    /// The route's configuration.
    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    /// The subscribed path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Claim the consuming end of the delivery channel. Returns `None` on a
    /// second call.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<Message>> {
        self.receiver.lock().take()
    }

    /// Whether the route has been detached.
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Deliver a message to the route's channel.
    ///
    /// A message whose filters do not select this route is skipped silently.
    /// With `blocking` false the call waits at most the configured timeout on
    /// a full channel; on expiry the route is closed and
    /// [`Error::InvalidRoute`] returned, detaching the slow consumer instead
    /// of stalling the router.
    pub async fn deliver(&self, message: &Message, blocking: bool) -> Result<()> {
        if self.is_invalid() {
            return Err(Error::InvalidRoute);
        }
        if !self.filters_match(message) {
            debug!(route = %self, id = message.id, "message filtered out");
            return Ok(());
        }
        let Some(sender) = self.sender.lock().clone() else {
            return Err(Error::InvalidRoute);
        };

        match sender.try_send(message.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Err(Error::InvalidRoute)
            }
            Err(mpsc::error::TrySendError::Full(queued)) => {
                if blocking {
                    sender.send(queued).await.map_err(|_| {
                        self.close();
                        Error::InvalidRoute
                    })
                } else {
                    match tokio::time::timeout(self.config.timeout, sender.send(queued)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(_)) | Err(_) => {
                            debug!(route = %self, "slow consumer, closing route");
                            self.close();
                            Err(Error::InvalidRoute)
                        }
                    }
                }
            }
        }
    }

    /// Close the delivery channel. Idempotent.
    pub fn close(&self) {
        self.invalid.store(true, Ordering::Release);
        if self.sender.lock().take().is_some() {
            debug!(route = %self, "closed route");
        }
    }

    /// Whether two routes denote the same subscription, per the configured
    /// matcher or full parameter equality.
    pub fn equal(&self, other: &Route) -> bool {
        let matcher = self.config.matcher.as_ref().or(other.config.matcher.as_ref());
        match matcher {
            Some(matcher) => matcher(&self.config, &other.config),
            None => {
                self.config.path == other.config.path
                    && self.config.route_params == other.config.route_params
            }
        }
    }

    /// Whether every filter key carried by the message has the same value in
    /// this route's parameters. Messages without filters always pass.
    fn filters_match(&self, message: &Message) -> bool {
        match &message.filters {
            None => true,
            Some(filters) => filters
                .iter()
                .all(|(key, value)| self.config.route_params.get(key) == Some(value)),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.config.path, self.config.route_params)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("config", &self.config)
            .field("invalid", &self.is_invalid())
            .finish()
    }
}
