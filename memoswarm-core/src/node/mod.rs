//! Compute node records.
//!
//! Each worker periodically writes a [`ComputeNodeRecord`] under
//! `nodes/<node_id>`. The records are advisory: nothing in the execution
//! path reads them, they only tell an operator who is out there.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    backend::namespace, common::now_millis, error::Result, serializer::Serializer,
    store::ContentStore,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeNodeRecord {
    pub node_id: String,
    pub hostname: Option<String>,
    pub pid: u32,
    /// Unix milliseconds.
    pub started_at: u64,
    /// Unix milliseconds.
    pub last_heartbeat: u64,
    /// Requests this node has taken to a terminal state.
    pub processed: u64,
}

impl ComputeNodeRecord {
    pub fn new(node_id: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            node_id: node_id.into(),
            hostname: std::env::var("HOSTNAME").ok(),
            pid: std::process::id(),
            started_at: now,
            last_heartbeat: now,
            processed: 0,
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", namespace::NODES, self.node_id)
    }

    /// Writes the record with a fresh heartbeat.
    pub(crate) async fn publish(&mut self, store: &ContentStore, serializer: Serializer) -> Result<()> {
        self.last_heartbeat = now_millis();
        let bytes = serializer.to_bytes(self)?;
        store.put(&self.key(), Bytes::from(bytes)).await
    }

    /// Every node record in storage. Unreadable records are skipped.
    pub(crate) async fn list(store: &ContentStore, serializer: Serializer) -> Result<Vec<Self>> {
        let mut nodes = Vec::new();
        for key in store.keys(&format!("{}/", namespace::NODES)).await? {
            let Some(bytes) = store.get(&key).await? else {
                continue;
            };
            match serializer.from_bytes(&bytes) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable node record"),
            }
        }
        nodes.sort_by(|a: &Self, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{backend::InMemoryBackend, error::RetryStrategy};

    #[tokio::test]
    async fn heartbeat_overwrites() {
        let store = ContentStore::new(Arc::new(InMemoryBackend::new()), RetryStrategy::default());
        let mut node = ComputeNodeRecord::new("n1");
        node.publish(&store, Serializer::Postcard).await.unwrap();
        node.processed = 7;
        node.publish(&store, Serializer::Postcard).await.unwrap();
        ComputeNodeRecord::new("n0")
            .publish(&store, Serializer::Postcard)
            .await
            .unwrap();

        let nodes = ComputeNodeRecord::list(&store, Serializer::Postcard).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].node_id, "n0");
        assert_eq!(nodes[1].processed, 7);
        assert_eq!(nodes[1].pid, std::process::id());
    }
}
