use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, ErrorKind, Result, StageError};

/// One step of the fixed workflow graph, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Clone,
    FetchCoverage,
    Analyze,
    GenerateTests,
    CreatePr,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Clone,
        Stage::FetchCoverage,
        Stage::Analyze,
        Stage::GenerateTests,
        Stage::CreatePr,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Clone => "clone",
            Stage::FetchCoverage => "fetch_coverage",
            Stage::Analyze => "analyze",
            Stage::GenerateTests => "generate_tests",
            Stage::CreatePr => "create_pr",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Succeeded,
    Failed,
    SkippedThresholdMet,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        self != WorkflowStatus::Running
    }

    /// Process exit code reported by the CLI for this status.
    pub fn exit_code(self) -> u8 {
        match self {
            WorkflowStatus::Succeeded | WorkflowStatus::SkippedThresholdMet => 0,
            WorkflowStatus::Failed | WorkflowStatus::Running => 1,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::SkippedThresholdMet => "skipped_threshold_met",
        };
        f.write_str(name)
    }
}

/// Inputs supplied by whoever starts a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub repo_url: String,
    pub sonar_project_key: String,
    #[serde(default = "default_coverage_threshold")]
    pub coverage_threshold: f64,
}

pub const DEFAULT_COVERAGE_THRESHOLD: f64 = 90.0;

fn default_coverage_threshold() -> f64 {
    DEFAULT_COVERAGE_THRESHOLD
}

impl WorkflowRequest {
    pub fn validate(&self) -> Result<()> {
        validate_repo_url(&self.repo_url)?;
        if self.sonar_project_key.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "sonar_project_key must not be empty".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.coverage_threshold) {
            return Err(AppError::InvalidInput(format!(
                "coverage_threshold must be between 0 and 100, got {}",
                self.coverage_threshold
            )));
        }
        Ok(())
    }
}

/// Check that a repository URL is an HTTPS URL with a path.
pub fn validate_repo_url(repo_url: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(repo_url)
        .map_err(|e| AppError::InvalidInput(format!("Invalid repository URL {repo_url:?}: {e}")))?;
    if parsed.scheme() != "https" {
        return Err(AppError::InvalidInput(format!(
            "Expected HTTPS repository URL, got: {repo_url}"
        )));
    }
    if parsed.host_str().is_none() || parsed.path().trim_matches('/').is_empty() {
        return Err(AppError::InvalidInput(format!(
            "Repository URL has no host or path: {repo_url}"
        )));
    }
    Ok(parsed)
}

/// A file the quality server reports as not fully covered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncoveredFile {
    pub path: String,
    pub coverage: f64,
    pub uncovered_lines: u64,
    pub language: String,
}

/// A code location selected for test generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeLocation {
    /// Path relative to the repository root.
    pub file_path: String,
    pub language: String,
    pub coverage: f64,
    pub uncovered_lines: u64,
}

/// A generated test file, relative to the repository root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
}

/// History record of one stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: Stage,
    /// 1-based attempt number within the stage.
    pub attempt: u32,
    pub status: OutcomeStatus,
    pub error: Option<StageError>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Why a workflow ended in `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

/// Compact listing entry for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub repo_url: String,
    pub status: WorkflowStatus,
    pub current_stage: Stage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The record threaded through every stage of one workflow.
///
/// Inputs, `current_stage`, `status`, `history` and `failure` are owned by the
/// orchestrator and only change through crate-internal methods. Stage handlers
/// write the public output fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    workflow_id: String,
    repo_url: String,
    sonar_project_key: String,
    coverage_threshold: f64,

    current_stage: Stage,
    status: WorkflowStatus,
    history: Vec<StageOutcome>,
    failure: Option<FailureDetail>,

    /// Set by Clone.
    pub local_path: Option<PathBuf>,
    /// Set by FetchCoverage.
    pub coverage_value: Option<f64>,
    /// Set by FetchCoverage: every numeric project measure, keyed by metric name.
    #[serde(default)]
    pub coverage_metrics: BTreeMap<String, f64>,
    /// Set by FetchCoverage.
    pub uncovered_files: Vec<UncoveredFile>,
    /// Set by Analyze.
    pub uncovered_targets: Vec<CodeLocation>,
    /// Set by GenerateTests.
    pub generated_artifacts: Vec<GeneratedArtifact>,
    /// Set by CreatePr.
    pub branch_name: Option<String>,
    /// Set by CreatePr.
    pub pr_reference: Option<String>,

    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(request: WorkflowRequest) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), request)
    }

    pub fn with_id(workflow_id: String, request: WorkflowRequest) -> Self {
        let now = Utc::now();
        Self {
            workflow_id,
            repo_url: request.repo_url,
            sonar_project_key: request.sonar_project_key,
            coverage_threshold: request.coverage_threshold,
            current_stage: Stage::Clone,
            status: WorkflowStatus::Running,
            history: Vec::new(),
            failure: None,
            local_path: None,
            coverage_value: None,
            coverage_metrics: BTreeMap::new(),
            uncovered_files: Vec::new(),
            uncovered_targets: Vec::new(),
            generated_artifacts: Vec::new(),
            branch_name: None,
            pr_reference: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn repo_url(&self) -> &str {
        &self.repo_url
    }

    pub fn sonar_project_key(&self) -> &str {
        &self.sonar_project_key
    }

    pub fn coverage_threshold(&self) -> f64 {
        self.coverage_threshold
    }

    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn history(&self) -> &[StageOutcome] {
        &self.history
    }

    pub fn failure(&self) -> Option<&FailureDetail> {
        self.failure.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of attempts recorded for `stage`.
    pub fn attempts_for(&self, stage: Stage) -> u32 {
        self.history.iter().filter(|o| o.stage == stage).count() as u32
    }

    /// Stages that completed successfully, in order.
    pub fn completed_stages(&self) -> Vec<Stage> {
        self.history
            .iter()
            .filter(|o| o.status == OutcomeStatus::Succeeded)
            .map(|o| o.stage)
            .collect()
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            workflow_id: self.workflow_id.clone(),
            repo_url: self.repo_url.clone(),
            status: self.status,
            current_stage: self.current_stage,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Copy the fields `stage` owns from `updated` into `self`.
    ///
    /// Anything else a handler changed is discarded.
    pub(crate) fn absorb(&mut self, stage: Stage, updated: WorkflowState) {
        match stage {
            Stage::Clone => self.local_path = updated.local_path,
            Stage::FetchCoverage => {
                self.coverage_value = updated.coverage_value;
                self.coverage_metrics = updated.coverage_metrics;
                self.uncovered_files = updated.uncovered_files;
            }
            Stage::Analyze => self.uncovered_targets = updated.uncovered_targets,
            Stage::GenerateTests => self.generated_artifacts = updated.generated_artifacts,
            Stage::CreatePr => {
                self.branch_name = updated.branch_name;
                self.pr_reference = updated.pr_reference;
            }
        }
        self.touch();
    }

    pub(crate) fn record(&mut self, outcome: StageOutcome) {
        self.history.push(outcome);
        self.touch();
    }

    pub(crate) fn advance(&mut self, next: Stage) {
        if self.is_terminal() {
            tracing::warn!(
                workflow_id = %self.workflow_id,
                "Ignoring advance on terminal workflow"
            );
            return;
        }
        debug_assert!(next > self.current_stage, "stages only move forward");
        self.current_stage = next;
        self.touch();
    }

    pub(crate) fn finish(&mut self, status: WorkflowStatus) {
        if self.is_terminal() {
            tracing::warn!(workflow_id = %self.workflow_id, "Ignoring finish on terminal workflow");
            return;
        }
        self.status = status;
        self.touch();
    }

    pub(crate) fn fail(&mut self, stage: Stage, error: &StageError) {
        if self.is_terminal() {
            tracing::warn!(
                workflow_id = %self.workflow_id,
                "Ignoring failure on terminal workflow"
            );
            return;
        }
        self.failure = Some(FailureDetail {
            stage,
            kind: error.kind,
            message: error.message.clone(),
            attempts: self.attempts_for(stage),
        });
        self.status = WorkflowStatus::Failed;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
