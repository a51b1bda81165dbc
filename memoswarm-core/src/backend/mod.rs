//! Storage backends.
//!
//! Every piece of shared state (values, results, pending requests, outcome
//! records, node heartbeats) lives in a namespaced key-value mapping. The
//! mapping is the only synchronization point between processes, so the
//! contract is deliberately small:
//!
//! - [`get`](StorageBackend::get) and [`contains`](StorageBackend::contains)
//!   never observe a partially written value.
//! - [`put`](StorageBackend::put) overwrites. All writers of a given key
//!   write identical bytes, so concurrent puts are harmless.
//! - [`iterate_keys`](StorageBackend::iterate_keys) returns a snapshot in no
//!   particular order.
//!
//! Two implementations are provided: [`InMemoryBackend`] for tests and
//! single-process emulation, and [`FsBackend`] for swarming across processes
//! that share a directory. [`DynamicBackend`] selects one from a [`Config`].
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{self, Config};

mod fs;
mod in_memory;

pub use fs::FsBackend;
pub use in_memory::InMemoryBackend;

/// Key namespaces of the persisted layout.
pub mod namespace {
    /// Content-addressed values, including execution results.
    pub const VALUES: &str = "values";
    /// Pending execution requests, keyed by result address.
    pub const REQUESTS: &str = "requests";
    /// Terminal outcomes of requests that did not complete.
    pub const OUTCOMES: &str = "outcomes";
    /// Advisory compute node liveness records.
    pub const NODES: &str = "nodes";
}

/// A namespaced key-value mapping shared by every client and worker.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Fetches the bytes stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stores `bytes` under `key`, replacing any previous value.
    async fn put(&self, key: &str, bytes: Bytes) -> Result<()>;

    async fn contains(&self, key: &str) -> Result<bool>;

    /// Lists every key starting with `prefix`.
    async fn iterate_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Deletes `key` if present. Only used for best-effort cleanup of
    /// processed requests.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// A [`StorageBackend`] that dynamically delegates to the configured
/// implementation.
#[derive(Clone, Debug)]
pub enum DynamicBackend {
    InMemory(InMemoryBackend),
    Fs(FsBackend),
}

#[async_trait]
impl StorageBackend for DynamicBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self {
            Self::InMemory(backend) => backend.get(key).await,
            Self::Fs(backend) => backend.get(key).await,
        }
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        match self {
            Self::InMemory(backend) => backend.put(key, bytes).await,
            Self::Fs(backend) => backend.put(key, bytes).await,
        }
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        match self {
            Self::InMemory(backend) => backend.contains(key).await,
            Self::Fs(backend) => backend.contains(key).await,
        }
    }

    async fn iterate_keys(&self, prefix: &str) -> Result<Vec<String>> {
        match self {
            Self::InMemory(backend) => backend.iterate_keys(prefix).await,
            Self::Fs(backend) => backend.iterate_keys(prefix).await,
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match self {
            Self::InMemory(backend) => backend.remove(key).await,
            Self::Fs(backend) => backend.remove(key).await,
        }
    }
}

impl DynamicBackend {
    pub async fn from_config(config: &Config) -> Result<Self> {
        match config.backend {
            config::Backend::InMemory => Ok(Self::InMemory(InMemoryBackend::new())),
            config::Backend::Fs => {
                let root = config
                    .storage_root
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("storage_root is required for the fs backend"))?;
                Ok(Self::Fs(FsBackend::open(root).await?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_backend_requires_a_root() {
        let config = Config {
            backend: config::Backend::Fs,
            ..Default::default()
        };
        assert!(DynamicBackend::from_config(&config).await.is_err());
    }

    #[tokio::test]
    async fn defaults_to_in_memory() {
        let backend = DynamicBackend::from_config(&Config::default()).await.unwrap();
        assert!(matches!(backend, DynamicBackend::InMemory(_)));
        backend.put("values/a", Bytes::from_static(b"1")).await.unwrap();
        assert!(backend.contains("values/a").await.unwrap());
    }
}
