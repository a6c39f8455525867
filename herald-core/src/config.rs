//! Service configuration types.
//!
//! The `heraldd` binary maps command-line flags and environment variables
//! onto these structs; library crates only ever see the validated values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Selects a persistence backend for messages or key-value data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Filesystem-backed, durable across restarts.
    File,
    /// In-memory, sequences checkpointed through the KV store.
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(Error::Configuration {
                reason: format!("unknown backend {other:?}, expected \"file\" or \"memory\""),
            }),
        }
    }
}

/// Storage configuration for both the message store and the KV store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for partition logs and the file-backed KV store.
    pub path: PathBuf,

    /// Backend for the message store.
    pub message_store: StoreBackend,

    /// Backend for the key-value store.
    pub kv_store: StoreBackend,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/herald"),
            message_store: StoreBackend::File,
            kv_store: StoreBackend::File,
        }
    }
}

/// Cluster mode configuration; absent entirely in standalone mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node's id. Strictly positive and unique across the cluster.
    pub node_id: u8,

    /// Address the cluster listener binds to.
    pub bind: SocketAddr,

    /// Addresses of remote peers contacted at join time.
    pub remotes: Vec<SocketAddr>,

    /// Health score above which `check()` reports the node unhealthy.
    pub health_score_threshold: u32,
}

impl ClusterConfig {
    /// Validate the cluster parameters.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(Error::Configuration {
                reason: "cluster node id must be strictly positive".to_string(),
            });
        }
        if self.remotes.is_empty() {
            return Err(Error::Configuration {
                reason: "cluster mode requires at least one remote peer".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeraldConfig {
    /// Address the WebSocket listener binds to.
    pub listen: SocketAddr,

    /// Storage configuration.
    pub storage: StorageConfig,

    /// Optional cluster configuration.
    pub cluster: Option<ClusterConfig>,
}

impl Default for HeraldConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".parse().expect("valid default listen address"),
            storage: StorageConfig::default(),
            cluster: None,
        }
    }
}

impl HeraldConfig {
    /// Validate the whole configuration tree.
    pub fn validate(&self) -> Result<()> {
        if let Some(cluster) = &self.cluster {
            cluster.validate()?;
        }
        if self.storage.path.as_os_str().is_empty() {
            return Err(Error::Configuration { reason: "storage path must not be empty".to_string() });
        }
        Ok(())
    }
}
