use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use git2::{
    build::RepoBuilder, BranchType, Cred, FetchOptions, IndexAddOption, PushOptions,
    RemoteCallbacks, Repository, Signature,
};

use crate::error::{AppError, Result};

/// Validate a branch name to prevent argument injection.
/// Rejects names starting with `-` as defence in depth.
fn validate_branch_name(name: &str) -> Result<()> {
    if name.starts_with('-') {
        return Err(AppError::Git(format!(
            "Invalid branch name (starts with '-'): {name}"
        )));
    }
    if name.is_empty() || name.contains("..") || name.contains(' ') {
        return Err(AppError::Git(format!("Invalid branch name: {name:?}")));
    }
    Ok(())
}

/// Build `PushOptions` that authenticate via credential callback.
///
/// Every ref the remote refuses is appended to `rejected`; libgit2 itself
/// reports such a push as successful.
fn make_push_options<'a>(token: &'a str, rejected: &'a mut Vec<String>) -> PushOptions<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username_from_url, _allowed_types| {
        Cred::userpass_plaintext("x-access-token", token)
    });
    callbacks.push_update_reference(move |refname, status| {
        if let Some(reason) = status {
            rejected.push(format!("{refname}: {reason}"));
        }
        Ok(())
    });
    let mut opts = PushOptions::new();
    opts.remote_callbacks(callbacks);
    opts
}

/// Raises the abort flag of a blocking clone when its future is dropped.
struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Clone a repository into the target directory.
///
/// The remote URL stored in `.git/config` will be the **plain** URL
/// (no credentials). Authentication is handled via credential callback only.
///
/// If the returned future is dropped (attempt deadline, cancellation) the
/// blocking clone stops at its next transfer callback and removes `target`.
pub async fn clone(url: &str, target: &Path, token: &str) -> Result<()> {
    if !url.starts_with("https://") {
        return Err(AppError::InvalidInput(format!(
            "Expected HTTPS clone URL, got: {url}"
        )));
    }

    let url = url.to_string();
    let target = target.to_path_buf();
    let token = token.to_string();
    let abort = Arc::new(AtomicBool::new(false));
    let _guard = AbortOnDrop(Arc::clone(&abort));

    tokio::task::spawn_blocking(move || clone_blocking(&url, &target, &token, &abort))
        .await
        .map_err(|e| AppError::Git(format!("Clone task panicked: {e}")))?
}

fn clone_blocking(url: &str, target: &Path, token: &str, abort: &AtomicBool) -> Result<()> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username_from_url, _allowed_types| {
        Cred::userpass_plaintext("x-access-token", token)
    });
    // Returning false makes libgit2 stop the transfer
    callbacks.transfer_progress(|_progress| !abort.load(Ordering::SeqCst));
    let mut fetch_opts = FetchOptions::new();
    fetch_opts.remote_callbacks(callbacks);

    let result = RepoBuilder::new().fetch_options(fetch_opts).clone(url, target);

    if abort.load(Ordering::SeqCst) {
        tracing::info!(path = %target.display(), "Abandoned clone, removing its directory");
        if let Err(e) = std::fs::remove_dir_all(target) {
            tracing::warn!(
                path = %target.display(),
                error = %e,
                "Failed to remove abandoned clone"
            );
        }
        return Err(AppError::Git("Clone abandoned".to_string()));
    }
    result?;
    Ok(())
}

/// Check out `branch_name`, creating it from HEAD if it does not exist yet.
///
/// Re-running on an existing branch is a no-op checkout, so a retried
/// publish picks up where the previous attempt stopped.
pub async fn checkout_or_create_branch(dir: &Path, branch_name: &str) -> Result<()> {
    validate_branch_name(branch_name)?;

    let dir = dir.to_path_buf();
    let branch_name = branch_name.to_string();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        if repo.find_branch(&branch_name, BranchType::Local).is_err() {
            let head = repo.head()?;
            let commit = head.peel_to_commit()?;
            repo.branch(&branch_name, &commit, false)?;
        }
        let obj = repo.revparse_single(&format!("refs/heads/{branch_name}"))?;
        repo.checkout_tree(&obj, None)?;
        repo.set_head(&format!("refs/heads/{branch_name}"))?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Git(format!("Checkout task panicked: {e}")))?
}

/// Stage all changes.
pub async fn add_all(dir: &Path) -> Result<()> {
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Git(format!("Add-all task panicked: {e}")))?
}

/// Commit with a message.
pub async fn commit(dir: &Path, message: &str) -> Result<()> {
    let dir = dir.to_path_buf();
    let message = message.to_string();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let sig = Signature::now("coverbot", "coverbot@users.noreply.github.com")?;
        let mut index = repo.index()?;
        let tree_oid = index.write_tree()?;
        let tree = repo.find_tree(tree_oid)?;
        let head = repo.head()?;
        let parent = head.peel_to_commit()?;
        repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Git(format!("Commit task panicked: {e}")))?
}

/// Push the current branch to origin.
pub async fn push(dir: &Path, branch_name: &str, token: &str) -> Result<()> {
    validate_branch_name(branch_name)?;

    let dir = dir.to_path_buf();
    let branch_name = branch_name.to_string();
    let token = token.to_string();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let mut remote = repo.find_remote("origin")?;
        let refspec = format!("refs/heads/{branch_name}:refs/heads/{branch_name}");
        let mut rejected = Vec::new();
        {
            let mut push_opts = make_push_options(&token, &mut rejected);
            remote.push(&[&refspec], Some(&mut push_opts))?;
        }
        if !rejected.is_empty() {
            return Err(AppError::Git(format!(
                "Remote rejected push: {}",
                rejected.join("; ")
            )));
        }
        Ok(())
    })
    .await
    .map_err(|e| AppError::Git(format!("Push task panicked: {e}")))?
}

/// Check if there are any staged or unstaged changes.
pub async fn has_changes(dir: &Path) -> Result<bool> {
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let statuses = repo.statuses(None)?;
        Ok(!statuses.is_empty())
    })
    .await
    .map_err(|e| AppError::Git(format!("Has-changes task panicked: {e}")))?
}
