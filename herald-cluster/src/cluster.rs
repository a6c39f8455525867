//! The cluster component: listener, join, probing and rebroadcast.

use crate::membership::Membership;
use crate::messages::{
    read_frame, write_frame, ClusterMessage, MessageKind, NodeAnnouncement,
};
use crate::{ClusterError, Result};
use async_trait::async_trait;
use herald_core::{ClusterConfig, Message};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Where the cluster hands inbound broker messages.
///
/// The router implements this; keeping it a trait here avoids a dependency
/// cycle between the cluster and the broker crates.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Store and fan out a message received from a peer. The message keeps
    /// the id and node id stamped by its origin.
    async fn handle_message(&self, message: Message) -> herald_core::Result<()>;
}

/// A node's local view of the Herald cluster.
pub struct Cluster {
    config: ClusterConfig,
    membership: Arc<Membership>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    shutdown: broadcast::Sender<()>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    /// Create the cluster component from a validated configuration.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let membership = Arc::new(Membership::new(config.node_id));
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            config,
            membership,
            handler: RwLock::new(None),
            shutdown,
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> u8 {
        self.config.node_id
    }

    /// The membership table.
    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    /// The address the listener actually bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Install the component that inbound broker messages are handed to.
    /// Must happen before [`Cluster::start`].
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Bind the cluster listener and start the liveness prober.
    pub async fn start(&self) -> Result<()> {
        let handler =
            self.handler.read().clone().ok_or(ClusterError::HandlerMissing)?;

        let listener = TcpListener::bind(self.config.bind).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        info!(node_id = self.config.node_id, addr = %local_addr, "cluster listener started");

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.membership),
            handler,
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(probe_loop(
            Arc::clone(&self.membership),
            self.config.node_id,
            self.shutdown.subscribe(),
        )));
        Ok(())
    }

    /// Contact the configured remotes and exchange membership.
    ///
    /// Fails if not a single remote could be reached; a node that cannot see
    /// any peer must not pretend to be clustered.
    pub async fn join(&self) -> Result<usize> {
        let listen = self
            .local_addr()
            .expect("cluster join requires a started listener");
        let announcement = NodeAnnouncement { node_id: self.config.node_id, listen };
        let body = bincode::serialize(&announcement)
            .map_err(|e| ClusterError::Codec(e.to_string()))?;

        let mut contacted = 0;
        for &remote in &self.config.remotes {
            match self.join_remote(remote, &body).await {
                Ok(()) => contacted += 1,
                Err(err) => {
                    warn!(%remote, error = %err, "could not contact remote while joining");
                }
            }
        }
        if contacted == 0 {
            error!(remotes = ?self.config.remotes, "joining the cluster failed");
            return Err(ClusterError::JoinFailed);
        }
        info!(contacted, known_peers = self.membership.len(), "joined cluster");
        Ok(contacted)
    }

    async fn join_remote(&self, remote: SocketAddr, announcement_body: &[u8]) -> Result<()> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(remote))
            .await
            .map_err(|_| {
                ClusterError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })??;
        let join = ClusterMessage::new(
            self.config.node_id,
            MessageKind::Join,
            announcement_body.to_vec(),
        );
        write_frame(&mut stream, &join).await?;

        let reply = timeout(CONNECT_TIMEOUT, read_frame(&mut stream)).await.map_err(|_| {
            ClusterError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "join reply timed out",
            ))
        })??;
        self.membership.upsert(reply.node_id, remote);
        if reply.kind == MessageKind::Members {
            let snapshot: Vec<(u8, SocketAddr)> = bincode::deserialize(&reply.body)
                .map_err(|e| ClusterError::Codec(e.to_string()))?;
            self.membership.merge(&snapshot);
        }
        Ok(())
    }

    /// Send a locally persisted message to every currently-alive peer.
    ///
    /// Failures are logged and not retried; the message stays durable locally
    /// and readable through replay.
    pub async fn broadcast_message(&self, message: &Message) -> Result<()> {
        let envelope = ClusterMessage::new(
            self.config.node_id,
            MessageKind::Broker,
            message.encode().to_vec(),
        );
        let frame = envelope.encode()?;

        for peer in self.membership.alive_peers() {
            let frame = frame.clone();
            let membership = Arc::clone(&self.membership);
            tokio::spawn(async move {
                debug!(to = peer.node_id, "sending cluster message to peer");
                if let Err(err) = send_raw(peer.addr, &frame).await {
                    warn!(to = peer.node_id, error = %err, "cluster send failed");
                    membership.mark_unreachable(peer.node_id);
                }
            });
        }
        Ok(())
    }

    /// Health check: unhealthy above the configured degraded-peer threshold.
    pub fn check(&self) -> Result<()> {
        let score = self.membership.health_score();
        if score > self.config.health_score_threshold {
            return Err(ClusterError::Unhealthy {
                score,
                threshold: self.config.health_score_threshold,
            });
        }
        Ok(())
    }

    /// Stop the listener and prober.
    pub async fn stop(&self) {
        info!(node_id = self.config.node_id, "stopping cluster");
        let _ = self.shutdown.send(());
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.config.node_id)
            .field("peers", &self.membership.len())
            .finish_non_exhaustive()
    }
}

async fn send_raw(addr: SocketAddr, frame: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await.map_err(|_| {
        ClusterError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))
    })??;
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    membership: Arc<Membership>,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "cluster connection accepted");
                        tokio::spawn(handle_connection(
                            stream,
                            Arc::clone(&membership),
                            Arc::clone(&handler),
                        ));
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    membership: Arc<Membership>,
    handler: Arc<dyn MessageHandler>,
) {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            // EOF and torn frames both just end the connection.
            Err(_) => return,
        };
        match frame.kind {
            MessageKind::Join => {
                let announcement: NodeAnnouncement = match bincode::deserialize(&frame.body) {
                    Ok(announcement) => announcement,
                    Err(err) => {
                        warn!(from = frame.node_id, error = %err, "bad join announcement");
                        return;
                    }
                };
                membership.upsert(announcement.node_id, announcement.listen);
                let snapshot = membership.snapshot_excluding(announcement.node_id);
                let body = match bincode::serialize(&snapshot) {
                    Ok(body) => body,
                    Err(err) => {
                        error!(error = %err, "could not encode membership snapshot");
                        return;
                    }
                };
                let reply =
                    ClusterMessage::new(membership.own_id(), MessageKind::Members, body);
                if write_frame(&mut stream, &reply).await.is_err() {
                    return;
                }
            }
            MessageKind::Members => {
                if let Ok(snapshot) =
                    bincode::deserialize::<Vec<(u8, SocketAddr)>>(&frame.body)
                {
                    membership.merge(&snapshot);
                }
            }
            MessageKind::Ping => {
                membership.mark_alive(frame.node_id);
                let pong =
                    ClusterMessage::new(membership.own_id(), MessageKind::Pong, vec![]);
                if write_frame(&mut stream, &pong).await.is_err() {
                    return;
                }
            }
            MessageKind::Pong => membership.mark_alive(frame.node_id),
            MessageKind::Broker => {
                membership.mark_alive(frame.node_id);
                match Message::decode(&frame.body) {
                    Ok(message) => {
                        debug!(
                            from = frame.node_id,
                            id = message.id,
                            path = %message.path,
                            "received cluster message"
                        );
                        if let Err(err) = handler.handle_message(message).await {
                            error!(from = frame.node_id, error = %err, "handling cluster message failed");
                        }
                    }
                    Err(err) => {
                        error!(from = frame.node_id, error = %err, "undecodable cluster message");
                    }
                }
            }
        }
    }
}

async fn probe_loop(membership: Arc<Membership>, own_id: u8, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            _ = shutdown.recv() => return,
        }
        for peer in membership.all_peers() {
            let membership = Arc::clone(&membership);
            tokio::spawn(async move {
                match probe(peer.addr, own_id).await {
                    Ok(()) => membership.mark_alive(peer.node_id),
                    Err(err) => {
                        debug!(node_id = peer.node_id, error = %err, "probe failed");
                        membership.mark_unreachable(peer.node_id);
                    }
                }
            });
        }
    }
}

async fn probe(addr: SocketAddr, own_id: u8) -> Result<()> {
    let mut stream = timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await.map_err(|_| {
        ClusterError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))
    })??;
    let ping = ClusterMessage::new(own_id, MessageKind::Ping, vec![]);
    write_frame(&mut stream, &ping).await?;
    let reply = timeout(PROBE_TIMEOUT, read_frame(&mut stream)).await.map_err(|_| {
        ClusterError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "pong timed out"))
    })??;
    match reply.kind {
        MessageKind::Pong => Ok(()),
        other => Err(ClusterError::Codec(format!("expected pong, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use herald_core::Path;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingHandler {
        seen: AsyncMutex<Vec<Message>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle_message(&self, message: Message) -> herald_core::Result<()> {
            self.seen.lock().await.push(message);
            Ok(())
        }
    }

    fn config(node_id: u8, remotes: Vec<SocketAddr>) -> ClusterConfig {
        ClusterConfig {
            node_id,
            bind: "127.0.0.1:0".parse().unwrap(),
            remotes,
            health_score_threshold: 5,
        }
    }

    async fn started(node_id: u8, remotes: Vec<SocketAddr>) -> (Arc<Cluster>, Arc<RecordingHandler>) {
        let cluster = Arc::new(Cluster::new(config(node_id, remotes)).unwrap());
        let handler = Arc::new(RecordingHandler::default());
        cluster.set_handler(handler.clone());
        cluster.start().await.unwrap();
        (cluster, handler)
    }

    #[tokio::test]
    async fn start_requires_a_handler() {
        let cluster =
            Cluster::new(config(1, vec!["127.0.0.1:1".parse().unwrap()])).unwrap();
        assert!(matches!(cluster.start().await, Err(ClusterError::HandlerMissing)));
    }

    #[tokio::test]
    async fn join_fails_with_no_reachable_remote() {
        let (cluster, _) = started(1, vec!["127.0.0.1:1".parse().unwrap()]).await;
        assert!(matches!(cluster.join().await, Err(ClusterError::JoinFailed)));
        cluster.stop().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_the_other_node() {
        // Node 2 comes up first; node 1 joins it, which teaches node 2 about
        // node 1's listener. A publish broadcast on node 2 must then land in
        // node 1's handler with node 2's id space intact.
        let (node2, _handler2) = started(2, vec!["127.0.0.1:1".parse().unwrap()]).await;
        let node2_addr = node2.local_addr().unwrap();

        let (node1, handler1) = started(1, vec![node2_addr]).await;
        assert_eq!(node1.join().await.unwrap(), 1);
        assert_eq!(node2.membership().len(), 1);

        let message = Message {
            id: 0x102,
            node_id: 2,
            time: 1_700_000_000,
            path: Path::from("/t/x"),
            body: Bytes::from_static(b"hello from node 2"),
            ..Default::default()
        };
        node2.broadcast_message(&message).await.unwrap();

        let mut received = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let seen = handler1.seen.lock().await;
            if let Some(first) = seen.first() {
                received = Some(first.clone());
                break;
            }
        }
        let received = received.expect("broadcast message never arrived");
        assert_eq!(received, message);
        assert_eq!(received.node_id, 2);
        assert_eq!(received.id & 0xff, 2);

        node1.stop().await;
        node2.stop().await;
    }

    #[tokio::test]
    async fn check_reflects_degraded_peers() {
        let (cluster, _) = started(1, vec!["127.0.0.1:1".parse().unwrap()]).await;
        assert!(cluster.check().is_ok());
        for id in 10..=16 {
            cluster.membership().upsert(id, "127.0.0.1:1".parse().unwrap());
            cluster.membership().mark_unreachable(id);
        }
        assert!(matches!(cluster.check(), Err(ClusterError::Unhealthy { score: 7, .. })));
        cluster.stop().await;
    }
}
