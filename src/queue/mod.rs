pub mod startup;
pub mod task;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::server::AppState;

use task::Task;

/// FIFO admission queue for workflows.
pub struct TaskQueue {
    pending: VecDeque<Task>,
    /// Notification channel for the processor.
    notify: Option<tokio::sync::mpsc::UnboundedSender<()>>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            notify: None,
        }
    }

    pub fn set_notifier(&mut self, tx: tokio::sync::mpsc::UnboundedSender<()>) {
        self.notify = Some(tx);
    }

    pub fn enqueue(&mut self, task: Task) {
        tracing::info!(task = %task.description(), queued = self.pending.len(), "Enqueuing task");
        self.pending.push_back(task);

        if let Some(ref tx) = self.notify {
            let _ = tx.send(());
        }
    }

    pub fn take_next(&mut self) -> Option<Task> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Run the background queue processor.
///
/// Tasks start in admission order and at most
/// `server.max_concurrent_workflows` run at once.
pub async fn run_queue_processor(state: Arc<AppState>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();

    {
        let mut queue = state.task_queue.write().await;
        queue.set_notifier(tx);
        // Anything enqueued before the notifier existed
        if !queue.is_empty() {
            if let Some(ref tx) = queue.notify {
                let _ = tx.send(());
            }
        }
    }

    let slots = Arc::new(Semaphore::new(state.config.server.max_concurrent_workflows));
    tracing::info!(
        max_concurrent = state.config.server.max_concurrent_workflows,
        "Queue processor started"
    );

    while rx.recv().await.is_some() {
        loop {
            // Take a slot first so the head of the queue is the next to start
            let permit = match Arc::clone(&slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let task = {
                let mut queue = state.task_queue.write().await;
                queue.take_next()
            };
            let Some(task) = task else {
                break;
            };

            let task_state = Arc::clone(&state);
            tokio::spawn(async move {
                let _permit = permit;
                run_task(&task_state, task).await;
            });
        }
    }
}

/// Execute one task to completion.
pub async fn run_task(state: &AppState, task: Task) {
    match &task {
        Task::RunWorkflow { workflow_id, .. } => {
            let Some((snapshot, cancel)) = state.registry.begin(workflow_id).await else {
                tracing::info!(task = %task.description(), "Skipping task for finished workflow");
                return;
            };

            tracing::info!(task = %task.description(), "Processing task");
            let finished = state.orchestrator.run(snapshot, cancel).await;

            if let Err(e) = state
                .workspace
                .cleanup_workflow(finished.repo_url(), workflow_id)
                .await
            {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    error = %e,
                    "Failed to remove workspace"
                );
            }

            tracing::info!(
                task = %task.description(),
                status = %finished.status(),
                "Task completed"
            );
        }
    }
}
