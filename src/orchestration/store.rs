//! JSON file persistence for finished orchestrations.
//!
//! One `<orchestrationId>.json` file per orchestration holding the
//! orchestration, its tasks and its conflicts.

use crate::core::OrchestrationId;
use crate::error::Result;
use crate::orchestration::state::OrchestrationRecord;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &OrchestrationId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Write a record, replacing any previous version atomically.
    pub async fn save(&self, record: &OrchestrationRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&record.orchestration.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "orchestration saved");
        Ok(())
    }

    pub async fn load(&self, id: &OrchestrationId) -> Result<Option<OrchestrationRecord>> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every readable record, oldest first. Unreadable files are
    /// skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<OrchestrationRecord>> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(crate::Error::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<OrchestrationRecord>(&bytes)?));
            match parsed {
                Ok(record) => records.push(record),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable record"),
            }
        }

        records.sort_by_key(|r| r.orchestration.created_at);
        Ok(records)
    }
}
