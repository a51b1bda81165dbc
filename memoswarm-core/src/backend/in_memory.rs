//! An in-memory [`StorageBackend`].
//!
//! Clones share the same underlying map, so a client [`Runtime`] and any
//! number of emulated workers can swarm through one instance.
//!
//! [`Runtime`]: crate::runtime::Runtime
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::StorageBackend;

#[derive(Clone, Debug, Default)]
pub struct InMemoryBackend {
    entries: Arc<DashMap<String, Bytes>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys across all namespaces.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        self.entries.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn iterate_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_entries() {
        let backend = InMemoryBackend::new();
        let clone = backend.clone();
        backend.put("values/k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(
            clone.get("values/k").await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
        assert_eq!(clone.len(), 1);
    }

    #[tokio::test]
    async fn iterate_keys_filters_by_prefix() {
        let backend = InMemoryBackend::new();
        for key in ["requests/a", "requests/b", "values/a"] {
            backend.put(key, Bytes::new()).await.unwrap();
        }
        let mut keys = backend.iterate_keys("requests/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["requests/a", "requests/b"]);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let backend = InMemoryBackend::new();
        backend.put("nodes/n", Bytes::new()).await.unwrap();
        backend.remove("nodes/n").await.unwrap();
        backend.remove("nodes/n").await.unwrap();
        assert!(!backend.contains("nodes/n").await.unwrap());
        assert!(backend.is_empty());
    }
}
