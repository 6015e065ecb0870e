pub mod analyze;
pub mod clone;
pub mod coverage;
pub mod generate;
pub mod pull_request;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::analysis::FileAnalyzer;
use crate::config::AppConfig;
use crate::error::{Result, StageError};
use crate::llm::{completion_client, LlmTestWriter};
use crate::platform::github::GitHubPlatform;
use crate::quality::sonar::SonarClient;
use crate::workflow::state::{Stage, WorkflowState};
use crate::workspace::WorkspaceManager;

/// Capability every stage handler implements.
///
/// A handler receives the current state, writes only the fields its stage
/// owns and returns the updated state. It never changes `current_stage`;
/// the orchestrator does that. Every failure is classified into an
/// [`crate::error::ErrorKind`] before it is returned.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn execute(
        &self,
        state: WorkflowState,
    ) -> std::result::Result<WorkflowState, StageError>;
}

/// Dispatch table from [`Stage`] to its handler.
pub struct Agents {
    clone: Arc<dyn StageHandler>,
    fetch_coverage: Arc<dyn StageHandler>,
    analyze: Arc<dyn StageHandler>,
    generate_tests: Arc<dyn StageHandler>,
    create_pr: Arc<dyn StageHandler>,
}

impl Agents {
    /// # Panics
    ///
    /// Panics if a handler reports a different stage than the slot it fills.
    pub fn new(
        clone: Arc<dyn StageHandler>,
        fetch_coverage: Arc<dyn StageHandler>,
        analyze: Arc<dyn StageHandler>,
        generate_tests: Arc<dyn StageHandler>,
        create_pr: Arc<dyn StageHandler>,
    ) -> Self {
        for (expected, handler) in [
            (Stage::Clone, &clone),
            (Stage::FetchCoverage, &fetch_coverage),
            (Stage::Analyze, &analyze),
            (Stage::GenerateTests, &generate_tests),
            (Stage::CreatePr, &create_pr),
        ] {
            assert_eq!(handler.stage(), expected, "handler registered for wrong stage");
        }

        Self {
            clone,
            fetch_coverage,
            analyze,
            generate_tests,
            create_pr,
        }
    }

    /// Build the handlers backed by the live git, SonarQube, LLM and GitHub adapters.
    pub fn live(config: &AppConfig) -> Result<Self> {
        let workspace = Arc::new(WorkspaceManager::new(&config.workspace, config.github_token()));
        let quality = Arc::new(SonarClient::new(&config.sonar)?);
        let analyzer = Arc::new(FileAnalyzer::new(&config.analysis)?);
        let llm = completion_client(&config.llm)?;
        let writer = Arc::new(LlmTestWriter::new(llm, &config.test_generation));
        let platform = Arc::new(GitHubPlatform::new(&config.github)?);

        Ok(Self::new(
            Arc::new(clone::CloneAgent::new(workspace.clone())),
            Arc::new(coverage::FetchCoverageAgent::new(quality)),
            Arc::new(analyze::AnalyzeAgent::new(analyzer)),
            Arc::new(generate::GenerateTestsAgent::new(writer)),
            Arc::new(pull_request::CreatePrAgent::new(
                workspace,
                platform,
                &config.github.base_branch,
                &config.github.branch_prefix,
            )),
        ))
    }

    pub fn handler(&self, stage: Stage) -> &dyn StageHandler {
        match stage {
            Stage::Clone => self.clone.as_ref(),
            Stage::FetchCoverage => self.fetch_coverage.as_ref(),
            Stage::Analyze => self.analyze.as_ref(),
            Stage::GenerateTests => self.generate_tests.as_ref(),
            Stage::CreatePr => self.create_pr.as_ref(),
        }
    }
}

/// Resolve the workspace a stage needs, or fail the precondition.
pub(crate) fn require_workspace(
    state: &WorkflowState,
) -> std::result::Result<PathBuf, StageError> {
    let path = state
        .local_path
        .clone()
        .ok_or_else(|| StageError::precondition("Repository has not been cloned"))?;
    if !path.is_dir() {
        return Err(StageError::precondition(format!(
            "Workspace {} no longer exists",
            path.display()
        )));
    }
    Ok(path)
}
