use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::{require_workspace, StageHandler};
use crate::error::StageError;
use crate::platform::types::{CreatePullRequest, PullRequest};
use crate::platform::{repo_full_name_from_url, Platform};
use crate::workflow::state::{Stage, WorkflowState};
use crate::workspace::SourceControl;

const COMMIT_MESSAGE: &str = "Add generated unit tests to improve code coverage";

/// Commits the generated tests on a branch and opens a pull request.
pub struct CreatePrAgent {
    scm: Arc<dyn SourceControl>,
    platform: Arc<dyn Platform>,
    base_branch: String,
    branch_prefix: String,
}

impl CreatePrAgent {
    pub fn new(
        scm: Arc<dyn SourceControl>,
        platform: Arc<dyn Platform>,
        base_branch: &str,
        branch_prefix: &str,
    ) -> Self {
        Self {
            scm,
            platform,
            base_branch: base_branch.to_string(),
            branch_prefix: branch_prefix.to_string(),
        }
    }

    /// Reuse the open pull request for `request.head_branch` or create one.
    ///
    /// A retried or resumed attempt may find the pull request an earlier
    /// attempt created after its response was lost.
    async fn open_pull_request(
        &self,
        repo_full_name: &str,
        request: &CreatePullRequest,
    ) -> crate::error::Result<PullRequest> {
        if let Some(existing) = self
            .platform
            .find_open_pull_request(repo_full_name, &request.head_branch)
            .await?
        {
            tracing::info!(
                repo = %repo_full_name,
                branch = %request.head_branch,
                number = existing.number,
                "Reusing existing pull request"
            );
            return Ok(existing);
        }

        match self.platform.create_pull_request(repo_full_name, request).await {
            Ok(pr) => Ok(pr),
            Err(create_err) => {
                // 422 when a pull request for this head appeared in the meantime
                match self
                    .platform
                    .find_open_pull_request(repo_full_name, &request.head_branch)
                    .await
                {
                    Ok(Some(existing)) => Ok(existing),
                    _ => Err(create_err),
                }
            }
        }
    }

    fn branch_for(&self, workflow_id: &str) -> String {
        let short: String = workflow_id.chars().take(8).collect();
        format!("{}/{short}", self.branch_prefix)
    }
}

#[async_trait]
impl StageHandler for CreatePrAgent {
    fn stage(&self) -> Stage {
        Stage::CreatePr
    }

    async fn execute(&self, mut state: WorkflowState) -> Result<WorkflowState, StageError> {
        if state.generated_artifacts.is_empty() {
            return Err(StageError::precondition("No generated tests to publish"));
        }
        let workspace = require_workspace(&state)?;
        let repo_full_name = repo_full_name_from_url(state.repo_url())?;
        let branch = self.branch_for(state.workflow_id());

        self.scm
            .publish(&workspace, &branch, &state.generated_artifacts, COMMIT_MESSAGE)
            .await?;

        let request = CreatePullRequest {
            title: format!("Improve code coverage for {repo_full_name}"),
            body: pull_request_body(&state),
            head_branch: branch.clone(),
            base_branch: self.base_branch.clone(),
        };
        let pr = self.open_pull_request(&repo_full_name, &request).await?;

        let reference = pr.html_url.unwrap_or_else(|| format!("#{}", pr.number));

        tracing::info!(
            workflow_id = %state.workflow_id(),
            repo = %repo_full_name,
            branch = %branch,
            pr = %reference,
            "Pull request created"
        );

        state.branch_name = Some(branch);
        state.pr_reference = Some(reference);
        Ok(state)
    }
}

fn pull_request_body(state: &WorkflowState) -> String {
    let mut lines = vec![
        "## Automated code coverage improvement".to_string(),
        String::new(),
        "This pull request adds generated unit tests for code the quality server \
         reports as uncovered."
            .to_string(),
        String::new(),
    ];

    if let Some(coverage) = state.coverage_value {
        lines.push("### Coverage".to_string());
        lines.push(format!("- **Before**: {coverage:.1}%"));
        lines.push(format!("- **Threshold**: {:.1}%", state.coverage_threshold()));
        for (metric, value) in &state.coverage_metrics {
            if metric != "coverage" {
                let value = format_metric(metric, *value);
                lines.push(format!("- {}: {value}", metric_label(metric)));
            }
        }
        lines.push(String::new());
    }

    lines.push(format!(
        "### Generated test files ({})",
        state.generated_artifacts.len()
    ));
    for artifact in &state.generated_artifacts {
        lines.push(format!("- `{}`", artifact.path));
    }
    lines.push(String::new());
    lines.push("Please review the generated tests before merging.".to_string());
    lines.push(String::new());
    lines.push("---".to_string());
    lines.push(format!("*Generated by coverbot (workflow `{}`)*", state.workflow_id()));

    lines.join("\n")
}

fn metric_label(metric: &str) -> String {
    let mut label = metric.replace('_', " ");
    if let Some(first) = label.get(..1) {
        label.replace_range(..1, &first.to_uppercase());
    }
    label
}

fn format_metric(metric: &str, value: f64) -> String {
    if metric.ends_with("coverage") {
        format!("{value:.1}%")
    } else {
        format!("{value:.0}")
    }
}
