use std::sync::Arc;

use crate::queue::task::Task;
use crate::server::AppState;

/// Re-admit persisted workflows that were still running when the process stopped.
///
/// Each resumes from its `current_stage`, the first stage that had not completed.
pub async fn resume_persisted_workflows(state: &Arc<AppState>) -> usize {
    let Some(store) = state.registry.store() else {
        return 0;
    };

    tracing::info!(dir = %store.dir().display(), "Scanning for interrupted workflows...");

    let snapshots = match store.list_running().await {
        Ok(snapshots) => snapshots,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read persisted workflows on startup");
            return 0;
        }
    };

    let count = snapshots.len();
    for snapshot in snapshots {
        tracing::info!(
            workflow_id = %snapshot.workflow_id(),
            repo = %snapshot.repo_url(),
            stage = %snapshot.current_stage(),
            "Resuming interrupted workflow"
        );
        let task = Task::RunWorkflow {
            workflow_id: snapshot.workflow_id().to_string(),
            repo_url: snapshot.repo_url().to_string(),
        };
        state.registry.insert(snapshot).await;
        state.task_queue.write().await.enqueue(task);
    }

    tracing::info!(resumed = count, "Startup scan complete");
    count
}
