//! The execution cache.
//!
//! The result of a call lives at the [`ExecutionResultAddress`] derived from
//! its [`CallSignature`], so looking a call up is a single existence check and
//! recording a result is a single put-if-absent. Two workers finishing the
//! same call write the same bytes to the same key; whichever lands second is
//! a no-op.
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::{
    address::ExecutionResultAddress,
    error::Result,
    signature::CallSignature,
    store::ContentStore,
    value::{canonical, Value},
};

#[derive(Clone)]
pub struct ExecutionCache {
    store: ContentStore,
}

impl ExecutionCache {
    pub fn new(store: ContentStore) -> Self {
        Self { store }
    }

    /// The address of the call's result if it has been computed.
    pub async fn lookup(&self, signature: &CallSignature) -> Result<Option<ExecutionResultAddress>> {
        let address = signature.result_address();
        if self.store.exists(address.as_content()).await? {
            Ok(Some(address))
        } else {
            Ok(None)
        }
    }

    /// Records the result of a call. Recording the same result again leaves
    /// the store unchanged.
    #[instrument(skip_all, fields(address), level = "debug")]
    pub async fn record(&self, signature: &CallSignature, result: &Value) -> Result<ExecutionResultAddress> {
        let address = signature.result_address();
        tracing::Span::current().record("address", tracing::field::display(&address));
        let written = self
            .store
            .put_if_absent(address.as_content(), || Bytes::from(canonical::encode(result)))
            .await?;
        debug!(written, "recorded result");
        Ok(address)
    }

    /// The stored result at `address`, if any.
    pub async fn fetch(&self, address: &ExecutionResultAddress) -> Result<Option<Value>> {
        self.store.try_load(address.as_content()).await
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        address::Digest,
        backend::InMemoryBackend,
        error::RetryStrategy,
        function::{FunctionVersion, Schema},
        signature::Kwargs,
    };

    async fn fixture() -> (InMemoryBackend, ExecutionCache, CallSignature) {
        let backend = InMemoryBackend::new();
        let store = ContentStore::new(Arc::new(backend.clone()), RetryStrategy::default());
        let version = FunctionVersion {
            name: "square".into(),
            fingerprint: Digest::of(b"square"),
        };
        let signature = CallSignature::build(
            &version,
            &Schema::new(["x"]),
            Kwargs::new().arg("x", 12),
            &store,
            64,
        )
        .await
        .unwrap();
        (backend, ExecutionCache::new(store), signature)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let (_, cache, signature) = fixture().await;
        assert_eq!(cache.lookup(&signature).await.unwrap(), None);
        let address = cache.record(&signature, &json!(144)).await.unwrap();
        assert_eq!(cache.lookup(&signature).await.unwrap(), Some(address.clone()));
        assert_eq!(cache.fetch(&address).await.unwrap(), Some(json!(144)));
    }

    #[tokio::test]
    async fn recording_twice_is_idempotent() {
        let (backend, cache, signature) = fixture().await;
        let first = cache.record(&signature, &json!(144)).await.unwrap();
        let entries = backend.len();
        let second = cache.record(&signature, &json!(144)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.len(), entries);
        assert_eq!(cache.fetch(&first).await.unwrap(), Some(json!(144)));
    }
}
