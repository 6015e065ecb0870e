pub mod git;
mod manager;

pub use manager::WorkspaceManager;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;
use crate::workflow::state::GeneratedArtifact;

/// Git collaborator used by the Clone and CreatePr stages.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Clone `repo_url` into a fresh workspace owned by `workflow_id`.
    async fn clone_repository(&self, workflow_id: &str, repo_url: &str) -> Result<PathBuf>;

    /// Write `artifacts` on `branch`, commit them and push the branch to origin.
    async fn publish(
        &self,
        local_path: &Path,
        branch: &str,
        artifacts: &[GeneratedArtifact],
        commit_message: &str,
    ) -> Result<()>;
}
