pub mod github;
pub mod types;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use types::*;

/// Code hosting platform that receives the pull request.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Create a pull request.
    async fn create_pull_request(
        &self,
        repo_full_name: &str,
        pr: &CreatePullRequest,
    ) -> Result<PullRequest>;

    /// Find an open pull request whose head is `head_branch` in the same repository.
    async fn find_open_pull_request(
        &self,
        repo_full_name: &str,
        head_branch: &str,
    ) -> Result<Option<PullRequest>>;
}

/// Derive `owner/repo` from an HTTPS repository URL.
///
/// A trailing `.git` and trailing slashes are ignored.
pub fn repo_full_name_from_url(repo_url: &str) -> Result<String> {
    let parsed = url::Url::parse(repo_url)
        .map_err(|e| AppError::InvalidInput(format!("Invalid repository URL {repo_url}: {e}")))?;

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        [owner, repo] => {
            let repo = repo.strip_suffix(".git").unwrap_or(repo);
            if repo.is_empty() {
                return Err(AppError::InvalidInput(format!(
                    "Repository URL has an empty repository name: {repo_url}"
                )));
            }
            Ok(format!("{owner}/{repo}"))
        }
        _ => Err(AppError::InvalidInput(format!(
            "Repository URL must look like https://host/owner/repo: {repo_url}"
        ))),
    }
}
