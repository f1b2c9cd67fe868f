//! JSON files on local disk, one per batch.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::ResultStore;
use crate::batch::{BatchId, BatchSnapshot};
use crate::error::StoreError;

/// Stores each snapshot as `<dir>/<batch_id>.json`.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a half-written file.
#[derive(Debug, Clone)]
pub struct FileResultStore {
    base_path: PathBuf,
}

impl FileResultStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Path the snapshot for `batch_id` is stored at.
    ///
    /// Ids that could name a file outside the base directory are rejected.
    pub fn path_for(&self, batch_id: &BatchId) -> Result<PathBuf, StoreError> {
        let id = batch_id.as_str();
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\', '\0']) {
            return Err(StoreError::InvalidBatchId(id.to_string()));
        }
        Ok(self.base_path.join(format!("{}.json", id)))
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn save(&self, snapshot: &BatchSnapshot) -> Result<String, StoreError> {
        let path = self.path_for(&snapshot.batch_id)?;
        fs::create_dir_all(&self.base_path).await?;

        let tmp_path = self
            .base_path
            .join(format!(".{}.json.tmp", snapshot.batch_id));
        let data = serde_json::to_vec_pretty(snapshot)?;

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &path).await?;

        debug!(batch_id = %snapshot.batch_id, path = %path.display(), "Saved batch result");
        Ok(path.display().to_string())
    }

    async fn load(&self, batch_id: &BatchId) -> Result<BatchSnapshot, StoreError> {
        let path = self.path_for(batch_id)?;
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(batch_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn list(&self) -> Result<Vec<BatchId>, StoreError> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(BatchId::from(id));
            }
        }
        ids.sort();
        Ok(ids)
    }
}
