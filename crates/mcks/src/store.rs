//! Metadata store interface.
//!
//! Cluster records persist through a namespace-scoped key/value store.
//! Writes are compare-and-swap on the record's revision: two services
//! mutating the same cluster concurrently are serialized here, and the
//! loser gets [`StoreError::Conflict`] and must re-read.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::model::Cluster;

/// Store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Compare-and-swap failed: the record changed since it was read.
    #[error("Conflicting write on cluster '{namespace}.{name}' (expected revision {expected}, found {found})")]
    Conflict {
        namespace: String,
        name: String,
        expected: u64,
        found: u64,
    },

    #[error("Failed to encode cluster record: {0}")]
    Encode(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Namespace-scoped persistence of [`Cluster`] records.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load a cluster record, or `None` when it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError>;

    /// Persist a cluster record. The write succeeds only when the
    /// record's `revision` matches the stored one (zero for a record that
    /// was never persisted); on success the revision is bumped in place.
    async fn put(&self, cluster: &mut Cluster) -> Result<(), StoreError>;

    /// Delete a cluster record. Returns whether it existed.
    async fn remove(&self, namespace: &str, name: &str) -> Result<bool, StoreError>;

    /// All cluster records in a namespace.
    async fn list(&self, namespace: &str) -> Result<Vec<Cluster>, StoreError>;
}

/// In-memory [`Store`] implementation.
///
/// Records are held as JSON so that reads hand out independent copies,
/// the same way a real key/value backend would.
#[derive(Default)]
pub struct MemStore {
    records: Mutex<HashMap<(String, String), (u64, String)>>,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError> {
        let records = self.records.lock().await;
        let Some((revision, raw)) = records.get(&(namespace.to_string(), name.to_string()))
        else {
            return Ok(None);
        };
        let mut cluster: Cluster = serde_json::from_str(raw)?;
        cluster.revision = *revision;
        Ok(Some(cluster))
    }

    async fn put(&self, cluster: &mut Cluster) -> Result<(), StoreError> {
        let key = (cluster.namespace.clone(), cluster.name.clone());
        let mut records = self.records.lock().await;
        let found = records.get(&key).map_or(0, |(revision, _)| *revision);
        if found != cluster.revision {
            return Err(StoreError::Conflict {
                namespace: cluster.namespace.clone(),
                name: cluster.name.clone(),
                expected: cluster.revision,
                found,
            });
        }
        cluster.revision += 1;
        records.insert(key, (cluster.revision, serde_json::to_string(cluster)?));
        Ok(())
    }

    async fn remove(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        Ok(records
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Cluster>, StoreError> {
        let records = self.records.lock().await;
        let mut clusters = Vec::new();
        for ((ns, _), (revision, raw)) in records.iter() {
            if ns == namespace {
                let mut cluster: Cluster = serde_json::from_str(raw)?;
                cluster.revision = *revision;
                clusters.push(cluster);
            }
        }
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NetworkCni, ServiceType};

    fn cluster(name: &str) -> Cluster {
        Cluster::new("ns", name, ServiceType::Multi, NetworkCni::Canal, "1.23.13")
    }

    #[tokio::test]
    async fn test_put_bumps_revision() {
        let store = MemStore::new();
        let mut c = cluster("c1");
        store.put(&mut c).await.unwrap();
        assert_eq!(c.revision, 1);
        store.put(&mut c).await.unwrap();
        assert_eq!(c.revision, 2);
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = MemStore::new();
        let mut c = cluster("c1");
        store.put(&mut c).await.unwrap();

        let mut stale = store.get("ns", "c1").await.unwrap().unwrap();
        store.put(&mut c).await.unwrap();

        let err = store.put(&mut stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 1, found: 2, .. }));
    }

    #[tokio::test]
    async fn test_get_hands_out_copies() {
        let store = MemStore::new();
        let mut c = cluster("c1");
        store.put(&mut c).await.unwrap();

        let mut copy = store.get("ns", "c1").await.unwrap().unwrap();
        copy.cp_leader = "control-plane-1".to_string();

        let fresh = store.get("ns", "c1").await.unwrap().unwrap();
        assert!(fresh.cp_leader.is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let store = MemStore::new();
        let mut a = cluster("a");
        let mut b = cluster("b");
        store.put(&mut a).await.unwrap();
        store.put(&mut b).await.unwrap();

        let names: Vec<String> = store
            .list("ns")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(store.remove("ns", "a").await.unwrap());
        assert!(!store.remove("ns", "a").await.unwrap());
        assert!(store.list("other").await.unwrap().is_empty());
    }
}
