//! File-backed KV backend over sled.

use super::KvStore;
use crate::{Result, StorageError};
use async_trait::async_trait;
use std::path::Path;
use tracing::info;

/// Default database directory name under the storage path.
pub const KV_STORE_FILENAME: &str = "kv-store.db";

/// A persistent [`KvStore`] keeping one sled tree per schema.
pub struct SledKvStore {
    db: sled::Db,
}

impl SledKvStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| StorageError::Kv(e.to_string()))?;
        info!(path = %path.display(), "opened kv store");
        Ok(Self { db })
    }

    fn tree(&self, schema: &str) -> Result<sled::Tree> {
        self.db.open_tree(schema).map_err(|e| StorageError::Kv(e.to_string()))
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(|e| StorageError::Kv(e.to_string()))?;
        Ok(())
    }
}

impl std::fmt::Debug for SledKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledKvStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl KvStore for SledKvStore {
    async fn put(&self, schema: &str, key: &str, value: &[u8]) -> Result<()> {
        self.tree(schema)?
            .insert(key.as_bytes(), value)
            .map_err(|e| StorageError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, schema: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .tree(schema)?
            .get(key.as_bytes())
            .map_err(|e| StorageError::Kv(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    async fn delete(&self, schema: &str, key: &str) -> Result<()> {
        self.tree(schema)?
            .remove(key.as_bytes())
            .map_err(|e| StorageError::Kv(e.to_string()))?;
        Ok(())
    }

    fn check(&self) -> Result<()> {
        self.db.size_on_disk().map_err(|e| StorageError::Kv(e.to_string()))?;
        Ok(())
    }
}
