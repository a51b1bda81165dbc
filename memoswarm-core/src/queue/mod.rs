//! The storage-mediated request queue.
//!
//! Swarming a call writes an [`ExecutionRequest`] under
//! `requests/<shard>/<descriptor>/<hex>` of the call's result address. Any
//! worker that can see the storage may pick it up; there is no broker, no
//! lease and no lock. Two workers taking the same request both compute the
//! same result and write it to the same key, so the only cost of a race is
//! duplicated work.
//!
//! A request that a worker leaves aborted or failed gets an
//! [`ExecutionOutcome`] under `outcomes/` and is skipped from then on.
//! Deleting the outcome record puts the request back in play.
use std::collections::HashSet;

use bytes::Bytes;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{
    address::ExecutionResultAddress,
    backend::namespace,
    cache::ExecutionCache,
    common::now_millis,
    error::Result,
    function::FunctionVersion,
    serializer::Serializer,
    signature::CallSignature,
    store::ContentStore,
};

/// A pending request to compute one call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub function_version: FunctionVersion,
    /// Canonical bytes of the [`CallSignature`].
    pub call_signature: Bytes,
    /// Unix milliseconds.
    pub enqueue_time: u64,
}

impl ExecutionRequest {
    pub fn new(signature: &CallSignature) -> Self {
        Self {
            function_version: signature.function_version().clone(),
            call_signature: signature.canonical_bytes(),
            enqueue_time: now_millis(),
        }
    }

    pub fn signature(&self) -> Result<CallSignature> {
        CallSignature::from_canonical_bytes(&self.call_signature)
    }

    pub fn result_address(&self) -> Result<ExecutionResultAddress> {
        Ok(self.signature()?.result_address())
    }
}

/// The terminal state a worker left a request in, other than done.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeState {
    /// A validator refused the call.
    Aborted { reason: String },
    /// The function body returned an error or panicked.
    Failed { error: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub function: String,
    pub state: OutcomeState,
    pub node_id: String,
    /// Unix milliseconds.
    pub at: u64,
}

impl ExecutionOutcome {
    pub fn new(function: impl Into<String>, state: OutcomeState, node_id: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            state,
            node_id: node_id.into(),
            at: now_millis(),
        }
    }

    /// The error this outcome describes.
    pub fn to_error(&self) -> crate::Error {
        match &self.state {
            OutcomeState::Aborted { reason } => crate::Error::ValidationAbort {
                function: self.function.clone(),
                reason: reason.clone(),
            },
            OutcomeState::Failed { error } => crate::Error::ExecutionFailure {
                function: self.function.clone(),
                message: error.clone(),
            },
        }
    }
}

#[derive(Clone)]
pub struct RequestQueue {
    store: ContentStore,
    cache: ExecutionCache,
    serializer: Serializer,
}

fn request_key(address: &ExecutionResultAddress) -> String {
    address.as_content().storage_key(namespace::REQUESTS)
}

fn outcome_key(address: &ExecutionResultAddress) -> String {
    address.as_content().storage_key(namespace::OUTCOMES)
}

fn namespace_prefix(ns: &str) -> String {
    format!("{ns}/")
}

impl RequestQueue {
    pub fn new(store: ContentStore, cache: ExecutionCache, serializer: Serializer) -> Self {
        Self {
            store,
            cache,
            serializer,
        }
    }

    /// Publishes a request for `signature` unless its result already exists,
    /// returning the address the result will be stored at.
    ///
    /// Never waits on execution.
    #[instrument(skip_all, fields(function = %signature.function_version()), level = "debug")]
    pub async fn enqueue(&self, signature: &CallSignature) -> Result<ExecutionResultAddress> {
        if let Some(address) = self.cache.lookup(signature).await? {
            debug!(%address, "already computed");
            return Ok(address);
        }

        let address = signature.result_address();
        let key = request_key(&address);
        if !self.store.contains(&key).await? {
            let request = ExecutionRequest::new(signature);
            let bytes = self.serializer.to_bytes(&request)?;
            self.store.put(&key, Bytes::from(bytes)).await?;
            debug!(%address, "enqueued");
        }
        Ok(address)
    }

    /// Every pending request without an outcome record, in random order so
    /// that concurrent workers spread over the backlog.
    ///
    /// Records that cannot be read are logged and skipped.
    pub async fn poll_candidates(&self) -> Result<Vec<ExecutionRequest>> {
        let mut keys = self.store.keys(&namespace_prefix(namespace::REQUESTS)).await?;
        keys.shuffle(&mut rand::thread_rng());

        let held = self.held_back().await?;
        let mut candidates = Vec::with_capacity(keys.len());
        for key in keys {
            if held.contains(strip_namespace(&key)) {
                continue;
            }
            // Another worker may have finished and removed it in the meantime.
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            match self.serializer.from_bytes::<ExecutionRequest>(&bytes) {
                Ok(request) => candidates.push(request),
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable request"),
            }
        }
        Ok(candidates)
    }

    /// Removes the request record for `address`. Failure only costs a
    /// worker a cache hit later, so it is logged rather than returned.
    pub async fn mark_processed(&self, address: &ExecutionResultAddress) {
        if let Err(e) = self.store.remove(&request_key(address)).await {
            warn!(%address, error = %e, "failed to remove processed request");
        }
    }

    pub async fn record_outcome(
        &self,
        address: &ExecutionResultAddress,
        outcome: &ExecutionOutcome,
    ) -> Result<()> {
        let bytes = self.serializer.to_bytes(outcome)?;
        self.store.put(&outcome_key(address), Bytes::from(bytes)).await
    }

    pub async fn outcome(&self, address: &ExecutionResultAddress) -> Result<Option<ExecutionOutcome>> {
        match self.store.get(&outcome_key(address)).await? {
            Some(bytes) => Ok(Some(self.serializer.from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of requests still waiting for a worker.
    pub async fn len(&self) -> Result<usize> {
        let held = self.held_back().await?;
        let keys = self.store.keys(&namespace_prefix(namespace::REQUESTS)).await?;
        Ok(keys
            .iter()
            .filter(|key| !held.contains(strip_namespace(key)))
            .count())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Keys, without namespace, of requests that have an outcome record.
    async fn held_back(&self) -> Result<HashSet<String>> {
        let keys = self.store.keys(&namespace_prefix(namespace::OUTCOMES)).await?;
        Ok(keys
            .iter()
            .map(|key| strip_namespace(key).to_string())
            .collect())
    }
}

fn strip_namespace(key: &str) -> &str {
    key.split_once('/').map_or(key, |(_, rest)| rest)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        backend::{InMemoryBackend, StorageBackend},
        error::RetryStrategy,
        function::{tests::AddV1, version_of, Schema},
        signature::Kwargs,
    };

    struct Fixture {
        backend: InMemoryBackend,
        store: ContentStore,
        cache: ExecutionCache,
        queue: RequestQueue,
    }

    fn fixture(serializer: Serializer) -> Fixture {
        let backend = InMemoryBackend::new();
        let store = ContentStore::new(Arc::new(backend.clone()), RetryStrategy::default());
        let cache = ExecutionCache::new(store.clone());
        let queue = RequestQueue::new(store.clone(), cache.clone(), serializer);
        Fixture {
            backend,
            store,
            cache,
            queue,
        }
    }

    async fn signature(store: &ContentStore, a: i64, b: i64) -> CallSignature {
        CallSignature::build(
            &version_of(&AddV1).unwrap(),
            &Schema::new(["a", "b"]),
            Kwargs::new().arg("a", a).arg("b", b),
            store,
            64,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let f = fixture(Serializer::Postcard);
        let sig = signature(&f.store, 1, 2).await;
        let first = f.queue.enqueue(&sig).await.unwrap();
        let second = f.queue.enqueue(&sig).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, sig.result_address());
        assert_eq!(f.queue.len().await.unwrap(), 1);

        let candidates = f.queue.poll_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].signature().unwrap(), sig);
        assert_eq!(candidates[0].result_address().unwrap(), first);
    }

    #[tokio::test]
    async fn computed_calls_are_not_enqueued() {
        let f = fixture(Serializer::Postcard);
        let sig = signature(&f.store, 1, 2).await;
        f.cache.record(&sig, &json!(3)).await.unwrap();
        f.queue.enqueue(&sig).await.unwrap();
        assert!(f.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn processed_requests_leave_the_queue() {
        let f = fixture(Serializer::Cbor);
        let sig = signature(&f.store, 1, 2).await;
        let address = f.queue.enqueue(&sig).await.unwrap();
        f.queue.mark_processed(&address).await;
        assert!(f.queue.poll_candidates().await.unwrap().is_empty());
        // Removing twice is harmless.
        f.queue.mark_processed(&address).await;
    }

    #[tokio::test]
    async fn outcomes_hold_requests_back() {
        let f = fixture(Serializer::Postcard);
        let held = f.queue.enqueue(&signature(&f.store, 1, 2).await).await.unwrap();
        let open = f.queue.enqueue(&signature(&f.store, 3, 4).await).await.unwrap();

        let outcome = ExecutionOutcome::new(
            "add",
            OutcomeState::Aborted {
                reason: "no".into(),
            },
            "node",
        );
        f.queue.record_outcome(&held, &outcome).await.unwrap();

        let candidates = f.queue.poll_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].result_address().unwrap(), open);
        assert_eq!(f.queue.len().await.unwrap(), 1);
        assert_eq!(f.queue.outcome(&held).await.unwrap(), Some(outcome.clone()));
        assert!(matches!(outcome.to_error(), crate::Error::ValidationAbort { .. }));

        // Clearing the outcome puts the request back.
        f.backend
            .remove(&held.as_content().storage_key(namespace::OUTCOMES))
            .await
            .unwrap();
        assert_eq!(f.queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unreadable_requests_are_skipped() {
        let f = fixture(Serializer::Postcard);
        f.queue.enqueue(&signature(&f.store, 1, 2).await).await.unwrap();
        f.backend
            .put("requests/abc/call_add/garbage", Bytes::from_static(b"\xff\xff"))
            .await
            .unwrap();
        assert_eq!(f.queue.poll_candidates().await.unwrap().len(), 1);
    }
}
