//! In-memory result store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::ResultStore;
use crate::batch::{BatchId, BatchSnapshot};
use crate::error::StoreError;

/// Keeps snapshots in a map. Useful for tests and for servers that only
/// need results while they are running.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    snapshots: RwLock<BTreeMap<BatchId, BatchSnapshot>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save(&self, snapshot: &BatchSnapshot) -> Result<String, StoreError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.batch_id.clone(), snapshot.clone());
        Ok(format!("memory://{}", snapshot.batch_id))
    }

    async fn load(&self, batch_id: &BatchId) -> Result<BatchSnapshot, StoreError> {
        self.snapshots
            .read()
            .await
            .get(batch_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(batch_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<BatchId>, StoreError> {
        Ok(self.snapshots.read().await.keys().cloned().collect())
    }
}
