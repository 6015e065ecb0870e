/// Tasks that can be enqueued for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Drive a registered workflow from its current stage to a terminal status.
    RunWorkflow {
        workflow_id: String,
        repo_url: String,
    },
}

impl Task {
    pub fn workflow_id(&self) -> &str {
        match self {
            Task::RunWorkflow { workflow_id, .. } => workflow_id,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Task::RunWorkflow {
                workflow_id,
                repo_url,
            } => format!("Run workflow {workflow_id} for {repo_url}"),
        }
    }
}
