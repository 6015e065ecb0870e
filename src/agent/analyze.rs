use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::{require_workspace, StageHandler};
use crate::analysis::Analyzer;
use crate::error::StageError;
use crate::workflow::state::{Stage, WorkflowState};

/// Selects the code locations tests will be generated for.
pub struct AnalyzeAgent {
    analyzer: Arc<dyn Analyzer>,
}

impl AnalyzeAgent {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self { analyzer }
    }
}

#[async_trait]
impl StageHandler for AnalyzeAgent {
    fn stage(&self) -> Stage {
        Stage::Analyze
    }

    async fn execute(&self, mut state: WorkflowState) -> Result<WorkflowState, StageError> {
        let workspace = require_workspace(&state)?;

        let targets = self
            .analyzer
            .find_uncovered(&workspace, &state.uncovered_files)
            .await?;

        if targets.is_empty() {
            return Err(StageError::permanent(
                "No uncovered code locations are eligible for test generation",
            ));
        }

        tracing::info!(
            workflow_id = %state.workflow_id(),
            targets = targets.len(),
            "Test targets selected"
        );

        state.uncovered_targets = targets;
        Ok(state)
    }
}
