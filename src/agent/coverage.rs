use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::StageHandler;
use crate::error::StageError;
use crate::quality::QualityServer;
use crate::workflow::state::{Stage, WorkflowState};

/// Reads the project's coverage from the quality server.
pub struct FetchCoverageAgent {
    quality: Arc<dyn QualityServer>,
}

impl FetchCoverageAgent {
    pub fn new(quality: Arc<dyn QualityServer>) -> Self {
        Self { quality }
    }
}

#[async_trait]
impl StageHandler for FetchCoverageAgent {
    fn stage(&self) -> Stage {
        Stage::FetchCoverage
    }

    async fn execute(&self, mut state: WorkflowState) -> Result<WorkflowState, StageError> {
        let project_key = state.sonar_project_key().trim().to_string();
        if project_key.is_empty() {
            return Err(StageError::precondition("Quality project key is empty"));
        }

        let report = self.quality.fetch_coverage(&project_key).await?;

        if !report.coverage.is_finite() || !(0.0..=100.0).contains(&report.coverage) {
            return Err(StageError::permanent(format!(
                "Quality server reported coverage outside 0-100: {}",
                report.coverage
            )));
        }

        tracing::info!(
            workflow_id = %state.workflow_id(),
            project = %project_key,
            coverage = report.coverage,
            threshold = state.coverage_threshold(),
            uncovered_files = report.uncovered_files.len(),
            "Coverage fetched"
        );

        state.coverage_value = Some(report.coverage);
        state.coverage_metrics = report.metrics;
        state.uncovered_files = report.uncovered_files;
        Ok(state)
    }
}
