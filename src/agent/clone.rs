use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::StageHandler;
use crate::error::StageError;
use crate::workflow::state::{validate_repo_url, Stage, WorkflowState};
use crate::workspace::SourceControl;

/// Clones the target repository into a fresh workspace.
pub struct CloneAgent {
    scm: Arc<dyn SourceControl>,
}

impl CloneAgent {
    pub fn new(scm: Arc<dyn SourceControl>) -> Self {
        Self { scm }
    }
}

#[async_trait]
impl StageHandler for CloneAgent {
    fn stage(&self) -> Stage {
        Stage::Clone
    }

    async fn execute(&self, mut state: WorkflowState) -> Result<WorkflowState, StageError> {
        validate_repo_url(state.repo_url())?;

        let path = self
            .scm
            .clone_repository(state.workflow_id(), state.repo_url())
            .await?;

        tracing::info!(
            workflow_id = %state.workflow_id(),
            path = %path.display(),
            "Repository cloned"
        );

        state.local_path = Some(path);
        Ok(state)
    }
}
