use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::WorkspaceConfig;
use crate::error::{AppError, Result};
use crate::platform::repo_full_name_from_url;
use crate::workflow::state::GeneratedArtifact;
use crate::workspace::{git, SourceControl};

/// Manages per-workflow clone directories.
pub struct WorkspaceManager {
    base_dir: PathBuf,
    keep_workspaces: bool,
    token: String,
}

impl WorkspaceManager {
    pub fn new(config: &WorkspaceConfig, token: &str) -> Self {
        Self {
            base_dir: config.base_dir.clone(),
            keep_workspaces: config.keep_workspaces,
            token: token.to_string(),
        }
    }

    /// Clean up an existing workspace directory and ensure its parent exists.
    async fn prepare_workspace_dir(path: &Path) -> Result<()> {
        if path.exists() {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| AppError::Workspace(format!("Failed to clean workspace: {e}")))?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Workspace(format!("Failed to create workspace dir: {e}")))?;
        }
        Ok(())
    }

    /// Remove a workflow's directory once it is finished, unless configured to keep it.
    ///
    /// Every checkout of the workflow goes, including ones left by abandoned attempts.
    pub async fn cleanup_workflow(&self, repo_url: &str, workflow_id: &str) -> Result<()> {
        if self.keep_workspaces {
            return Ok(());
        }
        let root = self.workflow_root(&repo_full_name_from_url(repo_url)?, workflow_id);
        if root.exists() {
            tokio::fs::remove_dir_all(&root)
                .await
                .map_err(|e| AppError::Workspace(format!("Failed to cleanup workspace: {e}")))?;
        }
        Ok(())
    }

    /// Directory holding every clone attempt of one workflow.
    fn workflow_root(&self, repo_full_name: &str, workflow_id: &str) -> PathBuf {
        let safe_name = repo_full_name.replace('/', "__");
        self.base_dir.join(format!("{safe_name}__{workflow_id}"))
    }

    /// A fresh checkout directory for one clone attempt.
    ///
    /// Attempts never share a directory, so a retry cannot collide with a
    /// timed-out clone that is still unwinding.
    fn attempt_path(&self, repo_full_name: &str, workflow_id: &str) -> PathBuf {
        let attempt = uuid::Uuid::new_v4().simple().to_string();
        self.workflow_root(repo_full_name, workflow_id)
            .join(format!("checkout-{}", &attempt[..8]))
    }

    /// Verify a path is within the workspace (path traversal protection).
    pub fn verify_path(workspace_root: &Path, requested_path: &Path) -> Result<PathBuf> {
        let full_path = workspace_root.join(requested_path);

        // Canonicalize to resolve .. and symlinks
        // If the file doesn't exist yet, canonicalize the parent
        let canonical = if full_path.exists() {
            full_path.canonicalize()
        } else {
            let parent = full_path
                .parent()
                .ok_or_else(|| AppError::Workspace("Invalid file path".to_string()))?;

            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::Workspace(format!("Failed to create directory: {e}")))?;
            }

            let canonical_parent = parent
                .canonicalize()
                .map_err(|e| AppError::Workspace(format!("Failed to resolve path: {e}")))?;

            let file_name = full_path
                .file_name()
                .ok_or_else(|| AppError::Workspace("Invalid file name".to_string()))?;

            Ok(canonical_parent.join(file_name))
        }
        .map_err(|e| AppError::Workspace(format!("Failed to resolve path: {e}")))?;

        let canonical_root = workspace_root
            .canonicalize()
            .map_err(|e| AppError::Workspace(format!("Failed to resolve workspace root: {e}")))?;

        if !canonical.starts_with(&canonical_root) {
            return Err(AppError::Workspace(format!(
                "Path traversal detected: {} is outside workspace",
                requested_path.display()
            )));
        }

        Ok(canonical)
    }
}

#[async_trait]
impl SourceControl for WorkspaceManager {
    async fn clone_repository(&self, workflow_id: &str, repo_url: &str) -> Result<PathBuf> {
        let repo_full_name = repo_full_name_from_url(repo_url)?;
        let checkout = self.attempt_path(&repo_full_name, workflow_id);

        Self::prepare_workspace_dir(&checkout).await?;
        git::clone(repo_url, &checkout, &self.token).await?;

        Ok(checkout)
    }

    async fn publish(
        &self,
        local_path: &Path,
        branch: &str,
        artifacts: &[GeneratedArtifact],
        commit_message: &str,
    ) -> Result<()> {
        git::checkout_or_create_branch(local_path, branch).await?;

        for artifact in artifacts {
            let target = Self::verify_path(local_path, Path::new(&artifact.path))?;
            tokio::fs::write(&target, &artifact.content)
                .await
                .map_err(|e| {
                    AppError::Workspace(format!("Failed to write {}: {e}", artifact.path))
                })?;
        }

        if git::has_changes(local_path).await? {
            git::add_all(local_path).await?;
            git::commit(local_path, commit_message).await?;
        } else {
            tracing::info!(branch = %branch, "No changes to commit");
        }

        git::push(local_path, branch, &self.token).await
    }
}
