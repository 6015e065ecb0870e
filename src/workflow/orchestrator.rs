use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::Agents;
use crate::error::StageError;
use crate::workflow::policy::{self, Transition};
use crate::workflow::retry::{RetryPolicy, RetrySupervisor};
use crate::workflow::state::WorkflowState;

/// Receives an immutable snapshot after every transition.
#[async_trait]
pub trait StateObserver: Send + Sync {
    async fn on_transition(&self, snapshot: &WorkflowState);
}

/// Drives one workflow from its current stage to a terminal status.
pub struct Orchestrator {
    agents: Agents,
    supervisor: RetrySupervisor,
    observer: Option<Arc<dyn StateObserver>>,
}

impl Orchestrator {
    pub fn new(agents: Agents, retry: RetryPolicy) -> Self {
        Self {
            agents,
            supervisor: RetrySupervisor::new(retry),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run until the workflow reaches a terminal status.
    ///
    /// At the top of each iteration the workflow is running and
    /// `current_stage` names the handler to invoke next, so a persisted
    /// running snapshot can be passed back in to resume it.
    pub async fn run(&self, mut state: WorkflowState, cancel: CancellationToken) -> WorkflowState {
        if state.is_terminal() {
            tracing::debug!(
                workflow_id = %state.workflow_id(),
                status = %state.status(),
                "Workflow already terminal"
            );
            return state;
        }

        tracing::info!(
            workflow_id = %state.workflow_id(),
            repo = %state.repo_url(),
            stage = %state.current_stage(),
            resumed = !state.history().is_empty(),
            "Workflow started"
        );
        self.notify(&state).await;

        while !state.is_terminal() {
            let stage = state.current_stage();

            if cancel.is_cancelled() {
                tracing::info!(
                    workflow_id = %state.workflow_id(),
                    stage = %stage,
                    "Cancellation requested before stage start"
                );
                state.fail(stage, &StageError::cancelled());
                self.notify(&state).await;
                break;
            }

            let handler = self.agents.handler(stage);
            match self.supervisor.run(handler, &mut state, &cancel).await {
                Ok(()) => match policy::next(stage, &state) {
                    Ok(Transition::Advance(next)) => {
                        tracing::info!(
                            workflow_id = %state.workflow_id(),
                            from = %stage,
                            to = %next,
                            "Stage transition"
                        );
                        state.advance(next);
                    }
                    Ok(Transition::Terminal(status)) => state.finish(status),
                    Err(e) => state.fail(stage, &e),
                },
                Err(e) => state.fail(stage, &e),
            }

            self.notify(&state).await;
        }

        match state.failure() {
            Some(failure) => tracing::warn!(
                workflow_id = %state.workflow_id(),
                stage = %failure.stage,
                kind = %failure.kind,
                error = %failure.message,
                "Workflow failed"
            ),
            None => tracing::info!(
                workflow_id = %state.workflow_id(),
                status = %state.status(),
                pr = ?state.pr_reference,
                "Workflow finished"
            ),
        }

        state
    }

    async fn notify(&self, state: &WorkflowState) {
        if let Some(observer) = &self.observer {
            observer.on_transition(state).await;
        }
    }
}
