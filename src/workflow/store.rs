use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::workflow::state::WorkflowState;

/// One JSON snapshot per workflow under a state directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids are generated as UUIDs; anything else cannot name a snapshot.
    fn is_valid_id(workflow_id: &str) -> bool {
        !workflow_id.is_empty()
            && workflow_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{workflow_id}.json"))
    }

    /// Write the snapshot atomically: a reader sees the old or the new file, never a torn one.
    pub async fn save(&self, state: &WorkflowState) -> Result<()> {
        let workflow_id = state.workflow_id();
        if !Self::is_valid_id(workflow_id) {
            return Err(AppError::InvalidInput(format!(
                "Workflow id cannot be persisted: {workflow_id:?}"
            )));
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(state)?;
        let target = self.path_for(workflow_id);
        let tmp = self.dir.join(format!(".{workflow_id}.json.tmp"));

        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    pub async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>> {
        if !Self::is_valid_id(workflow_id) {
            return Ok(None);
        }
        match tokio::fs::read(self.path_for(workflow_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable snapshot. Unparseable files are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<WorkflowState>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_snapshot = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_snapshot {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(AppError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<WorkflowState>(&bytes)?));
            match parsed {
                Ok(state) => snapshots.push(state),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable snapshot"
                    )
                }
            }
        }

        snapshots.sort_by_key(|s| s.created_at());
        Ok(snapshots)
    }

    /// Snapshots of workflows that had not reached a terminal status.
    pub async fn list_running(&self) -> Result<Vec<WorkflowState>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect())
    }
}
