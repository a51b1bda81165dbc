//! The content store.
//!
//! Values are written once under their [`ContentAddress`] and never updated
//! or deleted. Storing content that already exists only costs an existence
//! check, so every writer may store freely without coordinating.
use std::sync::Arc;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{instrument, trace};

use crate::{
    address::{address_of, ContentAddress},
    backend::{namespace, StorageBackend},
    error::{Error, Result, RetryStrategy},
    value::{self, canonical, Value},
};

/// Put-if-absent storage of canonical values over a [`StorageBackend`].
///
/// Every backend call is retried according to the configured
/// [`RetryStrategy`] before surfacing as [`Error::Storage`].
#[derive(Clone)]
pub struct ContentStore {
    backend: Arc<dyn StorageBackend>,
    retry: RetryStrategy,
}

impl ContentStore {
    pub fn new(backend: Arc<dyn StorageBackend>, retry: RetryStrategy) -> Self {
        Self { backend, retry }
    }

    /// Stores a value, returning its address. Idempotent.
    #[instrument(skip_all, level = "debug")]
    pub async fn store(&self, value: &Value) -> Result<ContentAddress> {
        let address = address_of(value);
        self.put_if_absent(&address, || Bytes::from(canonical::encode(value)))
            .await?;
        Ok(address)
    }

    /// Stores any serializable value, returning its address.
    pub async fn store_typed<T: Serialize + ?Sized>(&self, value: &T) -> Result<ContentAddress> {
        self.store(&value::to_value(value)?).await
    }

    /// Loads the value at `address`, failing with [`Error::NotFound`] if
    /// nothing is stored there.
    #[instrument(skip(self), level = "debug")]
    pub async fn load(&self, address: &ContentAddress) -> Result<Value> {
        self.try_load(address)
            .await?
            .ok_or_else(|| Error::NotFound(address.clone()))
    }

    pub async fn load_typed<T: DeserializeOwned>(&self, address: &ContentAddress) -> Result<T> {
        value::from_value(self.load(address).await?)
    }

    pub(crate) async fn try_load(&self, address: &ContentAddress) -> Result<Option<Value>> {
        match self.get(&address.storage_key(namespace::VALUES)).await? {
            Some(bytes) => Ok(Some(canonical::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether a value is stored at `address`. Never blocks on anything but
    /// the backend.
    pub async fn exists(&self, address: &ContentAddress) -> Result<bool> {
        self.contains(&address.storage_key(namespace::VALUES)).await
    }

    /// Writes the bytes produced by `bytes` at `address` unless something is
    /// already stored there.
    ///
    /// Used for values, whose address is derived from the bytes themselves,
    /// and for execution results, whose address is derived from the call.
    /// Either way every writer of a given address writes identical bytes.
    pub(crate) async fn put_if_absent(
        &self,
        address: &ContentAddress,
        bytes: impl FnOnce() -> Bytes,
    ) -> Result<bool> {
        let key = address.storage_key(namespace::VALUES);
        if self.contains(&key).await? {
            trace!(%address, "already stored");
            return Ok(false);
        }
        self.put(&key, bytes()).await?;
        Ok(true)
    }

    pub(crate) async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.retry
            .retry("get", || self.backend.get(key))
            .await
            .map_err(Error::Storage)
    }

    pub(crate) async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        self.retry
            .retry("put", || self.backend.put(key, bytes.clone()))
            .await
            .map_err(Error::Storage)
    }

    pub(crate) async fn contains(&self, key: &str) -> Result<bool> {
        self.retry
            .retry("contains", || self.backend.contains(key))
            .await
            .map_err(Error::Storage)
    }

    pub(crate) async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.retry
            .retry("iterate_keys", || self.backend.iterate_keys(prefix))
            .await
            .map_err(Error::Storage)
    }

    pub(crate) async fn remove(&self, key: &str) -> Result<()> {
        self.retry
            .retry("remove", || self.backend.remove(key))
            .await
            .map_err(Error::Storage)
    }
}
