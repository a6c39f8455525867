//! In-memory KV backend.

use super::KvStore;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;

/// A non-persistent [`KvStore`] over a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<(String, String), Vec<u8>>,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries across all schemas.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, schema: &str, key: &str, value: &[u8]) -> Result<()> {
        self.entries.insert((schema.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    async fn get(&self, schema: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .get(&(schema.to_string(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn delete(&self, schema: &str, key: &str) -> Result<()> {
        self.entries.remove(&(schema.to_string(), key.to_string()));
        Ok(())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }
}
