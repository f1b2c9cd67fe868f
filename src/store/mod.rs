//! Result persistence for finished batches.
//!
//! A stored result is a [`BatchSnapshot`] and can be read back and
//! inspected without re-running the batch.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bench_fleet::store::{FileResultStore, ResultStore};
//!
//! let store = FileResultStore::new("./fleet-results");
//! let location = store.save(&state.snapshot()).await?;
//! let snapshot = store.load(state.batch_id()).await?;
//! ```

pub mod file;
pub mod memory;

use async_trait::async_trait;

use crate::batch::{BatchId, BatchSnapshot};
use crate::error::StoreError;

pub use file::FileResultStore;
pub use memory::MemoryResultStore;

/// Persists batch snapshots.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Saves a snapshot, replacing any earlier one for the same batch.
    /// Returns a human-readable location.
    async fn save(&self, snapshot: &BatchSnapshot) -> Result<String, StoreError>;

    /// Loads the snapshot saved for `batch_id`.
    async fn load(&self, batch_id: &BatchId) -> Result<BatchSnapshot, StoreError>;

    /// Ids of every stored batch, sorted.
    async fn list(&self) -> Result<Vec<BatchId>, StoreError>;
}
