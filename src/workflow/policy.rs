//! Transition policy: which stage runs after a successful one.
//!
//! ```text
//! Clone -> FetchCoverage -> decision -+-> Analyze -> GenerateTests -> CreatePr -> succeeded
//!                                     +-> skipped_threshold_met
//! ```

use crate::error::StageError;
use crate::workflow::state::{Stage, WorkflowState, WorkflowStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance(Stage),
    Terminal(WorkflowStatus),
}

/// Compute the transition after `stage` completed successfully.
///
/// Pure: reads only `stage`, `coverage_value` and `coverage_threshold`.
pub fn next(stage: Stage, state: &WorkflowState) -> Result<Transition, StageError> {
    match stage {
        Stage::Clone => Ok(Transition::Advance(Stage::FetchCoverage)),
        Stage::FetchCoverage => decide(state),
        Stage::Analyze => Ok(Transition::Advance(Stage::GenerateTests)),
        Stage::GenerateTests => Ok(Transition::Advance(Stage::CreatePr)),
        Stage::CreatePr => Ok(Transition::Terminal(WorkflowStatus::Succeeded)),
    }
}

/// Coverage equal to the threshold counts as met.
fn decide(state: &WorkflowState) -> Result<Transition, StageError> {
    let coverage = state.coverage_value.ok_or_else(|| {
        StageError::precondition("coverage_value is missing at the threshold decision")
    })?;

    if coverage < state.coverage_threshold() {
        Ok(Transition::Advance(Stage::Analyze))
    } else {
        Ok(Transition::Terminal(WorkflowStatus::SkippedThresholdMet))
    }
}
