use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::StageError;
use crate::workflow::orchestrator::StateObserver;
use crate::workflow::state::{WorkflowState, WorkflowSummary};
use crate::workflow::store::SnapshotStore;

struct Entry {
    snapshot: WorkflowState,
    cancel: CancellationToken,
    started: bool,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The workflow will stop before its next stage.
    Requested,
    /// The workflow was still queued and is now finalised as cancelled.
    CancelledQueued,
    NotFound,
    AlreadyTerminal,
}

/// Finished workflows kept in memory when there is no snapshot store.
pub const DEFAULT_RETAINED_FINISHED: usize = 1000;

/// Latest snapshot and cancellation handle of workflows known to this process.
///
/// Registered as the orchestrator's observer, so it is also the single place
/// snapshots are written to the optional [`SnapshotStore`]. Finished
/// workflows leave memory once their snapshot is on disk and are read back
/// from the store on demand; without a store only the most recently
/// finished ones are retained.
pub struct WorkflowRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    store: Option<SnapshotStore>,
    retain_finished: usize,
}

impl WorkflowRegistry {
    pub fn new(store: Option<SnapshotStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
            retain_finished: DEFAULT_RETAINED_FINISHED,
        }
    }

    /// Keep at most `limit` finished workflows in memory when running without a store.
    pub fn with_retention(mut self, limit: usize) -> Self {
        self.retain_finished = limit;
        self
    }

    pub fn store(&self) -> Option<&SnapshotStore> {
        self.store.as_ref()
    }

    /// Admit a workflow that has not started yet.
    pub async fn insert(&self, state: WorkflowState) {
        self.persist(&state).await;
        let mut entries = self.entries.write().await;
        entries.insert(
            state.workflow_id().to_string(),
            Entry {
                snapshot: state,
                cancel: CancellationToken::new(),
                started: false,
            },
        );
    }

    /// Mark a queued workflow as started and hand out what the orchestrator needs.
    ///
    /// Returns `None` when the workflow is unknown or was finalised while queued.
    pub async fn begin(&self, workflow_id: &str) -> Option<(WorkflowState, CancellationToken)> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(workflow_id)?;
        if entry.snapshot.is_terminal() {
            return None;
        }
        entry.started = true;
        Some((entry.snapshot.clone(), entry.cancel.clone()))
    }

    /// Latest snapshot from memory, or from the store for finished workflows.
    pub async fn get(&self, workflow_id: &str) -> Option<WorkflowState> {
        let live = {
            let entries = self.entries.read().await;
            entries.get(workflow_id).map(|e| e.snapshot.clone())
        };
        if live.is_some() {
            return live;
        }

        let store = self.store.as_ref()?;
        match store.load(workflow_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(workflow_id = %workflow_id, error = %e, "Failed to load snapshot");
                None
            }
        }
    }

    /// Summaries ordered by creation time, including persisted workflows.
    pub async fn list(&self) -> Vec<WorkflowSummary> {
        let mut by_id: HashMap<String, WorkflowSummary> = HashMap::new();
        if let Some(store) = &self.store {
            match store.load_all().await {
                Ok(snapshots) => {
                    for snapshot in snapshots {
                        by_id.insert(snapshot.workflow_id().to_string(), snapshot.summary());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to list persisted snapshots"),
            }
        }
        {
            let entries = self.entries.read().await;
            for (id, entry) in entries.iter() {
                by_id.insert(id.clone(), entry.snapshot.summary());
            }
        }

        let mut summaries: Vec<_> = by_id.into_values().collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        summaries
    }

    /// Ids of workflows that have not reached a terminal status.
    pub async fn in_flight(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(_, e)| !e.snapshot.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn cancel(&self, workflow_id: &str) -> CancelOutcome {
        let finalised = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(workflow_id) else {
                drop(entries);
                return match self.get(workflow_id).await {
                    Some(snapshot) if snapshot.is_terminal() => CancelOutcome::AlreadyTerminal,
                    _ => CancelOutcome::NotFound,
                };
            };
            if entry.snapshot.is_terminal() {
                return CancelOutcome::AlreadyTerminal;
            }
            entry.cancel.cancel();
            if entry.started {
                None
            } else {
                let stage = entry.snapshot.current_stage();
                entry.snapshot.fail(stage, &StageError::cancelled());
                Some(entry.snapshot.clone())
            }
        };

        tracing::info!(
            workflow_id = %workflow_id,
            queued = finalised.is_some(),
            "Cancellation requested"
        );
        match finalised {
            Some(snapshot) => {
                let persisted = self.persist(&snapshot).await;
                self.retire(workflow_id, persisted).await;
                CancelOutcome::CancelledQueued
            }
            None => CancelOutcome::Requested,
        }
    }

    /// Request cancellation of every non-terminal workflow.
    pub async fn cancel_all(&self) -> usize {
        let ids = self.in_flight().await;
        for id in &ids {
            self.cancel(id).await;
        }
        ids.len()
    }

    /// Write `snapshot` to the store. Returns whether it is now on disk.
    async fn persist(&self, snapshot: &WorkflowState) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.save(snapshot).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    workflow_id = %snapshot.workflow_id(),
                    error = %e,
                    "Failed to persist workflow snapshot"
                );
                false
            }
        }
    }

    /// Drop a finished workflow from memory once it is persisted, otherwise
    /// trim the finished entries down to the retention limit.
    async fn retire(&self, workflow_id: &str, persisted: bool) {
        let mut entries = self.entries.write().await;
        if persisted {
            entries.remove(workflow_id);
            return;
        }

        let mut finished: Vec<_> = entries
            .iter()
            .filter(|(_, e)| e.snapshot.is_terminal())
            .map(|(id, e)| (e.snapshot.updated_at(), id.clone()))
            .collect();
        if finished.len() <= self.retain_finished {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.retain_finished;
        for (_, id) in finished.into_iter().take(excess) {
            entries.remove(&id);
        }
    }
}

#[async_trait]
impl StateObserver for WorkflowRegistry {
    async fn on_transition(&self, snapshot: &WorkflowState) {
        {
            let mut entries = self.entries.write().await;
            match entries.get_mut(snapshot.workflow_id()) {
                Some(entry) => {
                    // A queued cancellation already finalised this record
                    if entry.snapshot.is_terminal() && !snapshot.is_terminal() {
                        return;
                    }
                    entry.snapshot = snapshot.clone();
                }
                None => {
                    entries.insert(
                        snapshot.workflow_id().to_string(),
                        Entry {
                            snapshot: snapshot.clone(),
                            cancel: CancellationToken::new(),
                            started: true,
                        },
                    );
                }
            }
        }
        let persisted = self.persist(snapshot).await;
        if snapshot.is_terminal() {
            self.retire(snapshot.workflow_id(), persisted).await;
        }
    }
}
