use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::{require_workspace, StageHandler};
use crate::error::StageError;
use crate::llm::TestWriter;
use crate::workflow::state::{Stage, WorkflowState};

/// Asks the language model for tests covering the selected locations.
pub struct GenerateTestsAgent {
    writer: Arc<dyn TestWriter>,
}

impl GenerateTestsAgent {
    pub fn new(writer: Arc<dyn TestWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl StageHandler for GenerateTestsAgent {
    fn stage(&self) -> Stage {
        Stage::GenerateTests
    }

    async fn execute(&self, mut state: WorkflowState) -> Result<WorkflowState, StageError> {
        if state.uncovered_targets.is_empty() {
            return Err(StageError::precondition("No code locations to generate tests for"));
        }
        let workspace = require_workspace(&state)?;

        let artifacts = self
            .writer
            .generate_tests(&workspace, &state.uncovered_targets)
            .await?;

        if artifacts.is_empty() {
            return Err(StageError::permanent("Language model produced no test files"));
        }

        tracing::info!(
            workflow_id = %state.workflow_id(),
            files = artifacts.len(),
            "Tests generated"
        );

        state.generated_artifacts = artifacts;
        Ok(state)
    }
}
