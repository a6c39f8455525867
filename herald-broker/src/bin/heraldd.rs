//! `heraldd`, the Herald broker server.
//!
//! Wires the configured stores, the router, the optional cluster and the
//! WebSocket listener together, then runs until SIGINT/SIGTERM.

use anyhow::{bail, Context};
use clap::Parser;
use herald_broker::{Router, WsServer};
use herald_cluster::Cluster;
use herald_core::{ClusterConfig, HeraldConfig, StorageConfig, StoreBackend};
use herald_storage::kv::{KvStore, MemoryKvStore, SledKvStore, KV_STORE_FILENAME};
use herald_storage::{FileMessageStore, MemoryMessageStore, MessageStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "heraldd", about = "Herald pub/sub message broker", version)]
struct Args {
    /// WebSocket listen address.
    #[arg(long, env = "HERALD_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Base directory for message logs and the file-backed KV store.
    #[arg(long, env = "HERALD_STORAGE_PATH", default_value = "/var/lib/herald")]
    storage_path: PathBuf,

    /// Message store backend: "file" or "memory".
    #[arg(long, env = "HERALD_MS", default_value = "file")]
    ms: String,

    /// KV store backend: "file" or "memory".
    #[arg(long, env = "HERALD_KVS", default_value = "file")]
    kvs: String,

    /// Cluster node id (strictly positive); enables cluster mode.
    #[arg(long, env = "HERALD_NODE_ID")]
    node_id: Option<u8>,

    /// Cluster bind address.
    #[arg(long, env = "HERALD_NODE_PORT", default_value = "0.0.0.0:10000")]
    cluster_bind: SocketAddr,

    /// Remote cluster peers; repeatable.
    #[arg(long = "remote", env = "HERALD_REMOTES", value_delimiter = ',')]
    remotes: Vec<SocketAddr>,

    /// Cluster health score threshold.
    #[arg(long, env = "HERALD_HEALTH_THRESHOLD", default_value_t = 8)]
    health_threshold: u32,

    /// Log filter, e.g. "info" or "herald_broker=debug".
    #[arg(long, env = "HERALD_LOG", default_value = "info")]
    log: String,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(HeraldConfig, String)> {
        let cluster = match self.node_id {
            Some(node_id) => Some(ClusterConfig {
                node_id,
                bind: self.cluster_bind,
                remotes: self.remotes,
                health_score_threshold: self.health_threshold,
            }),
            None => {
                if !self.remotes.is_empty() {
                    bail!("--remote requires --node-id");
                }
                None
            }
        };
        let config = HeraldConfig {
            listen: self.listen,
            storage: StorageConfig {
                path: self.storage_path,
                message_store: self.ms.parse::<StoreBackend>()?,
                kv_store: self.kvs.parse::<StoreBackend>()?,
            },
            cluster,
        };
        config.validate()?;
        Ok((config, self.log))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, log) = Args::parse().into_config()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(log).context("invalid log filter")?)
        .init();
    info!(?config, "starting heraldd");

    let kv: Arc<dyn KvStore> = match config.storage.kv_store {
        StoreBackend::File => Arc::new(
            SledKvStore::open(config.storage.path.join(KV_STORE_FILENAME))
                .context("opening kv store")?,
        ),
        StoreBackend::Memory => Arc::new(MemoryKvStore::new()),
    };

    let store: Arc<dyn MessageStore> = match config.storage.message_store {
        StoreBackend::File => Arc::new(
            FileMessageStore::new(&config.storage.path).context("opening message store")?,
        ),
        StoreBackend::Memory => {
            let store = MemoryMessageStore::new(Arc::clone(&kv));
            store.start().await;
            Arc::new(store)
        }
    };

    let cluster = match &config.cluster {
        Some(cluster_config) => Some(Arc::new(
            Cluster::new(cluster_config.clone()).context("creating cluster")?,
        )),
        None => None,
    };

    let mut router = Router::new()
        .with_message_store(Arc::clone(&store))
        .with_kv_store(Arc::clone(&kv));
    if let Some(cluster) = &cluster {
        router = router.with_cluster(Arc::clone(cluster));
    }
    let router = Arc::new(router);
    router.start();

    if let Some(cluster) = &cluster {
        let handler: Arc<dyn herald_cluster::MessageHandler> = Arc::clone(&router) as Arc<dyn herald_cluster::MessageHandler>;
        cluster.set_handler(handler);
        cluster.start().await.context("starting cluster")?;
        cluster.join().await.context("joining cluster")?;
    }

    let ws_server = WsServer::new(config.listen, Arc::clone(&router));
    let bound = ws_server.start().await.context("starting websocket server")?;
    info!(addr = %bound, "heraldd is up");

    if let Err(err) = router.check() {
        error!(error = %err, "initial health check failed");
    }

    wait_for_shutdown_signal().await;
    info!("shutting down");

    ws_server.stop();
    if let Some(cluster) = &cluster {
        cluster.stop().await;
    }
    if let Err(err) = router.stop().await {
        error!(error = %err, "error stopping router");
    }
    if let Err(err) = store.stop().await {
        error!(error = %err, "error stopping message store");
    }
    info!("bye");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(error = %err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
