use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent::Agents;
use crate::config::AppConfig;
use crate::error::Result;
use crate::queue::task::Task;
use crate::queue::TaskQueue;
use crate::workflow::orchestrator::Orchestrator;
use crate::workflow::registry::{CancelOutcome, WorkflowRegistry};
use crate::workflow::retry::RetryPolicy;
use crate::workflow::state::{WorkflowRequest, WorkflowState, WorkflowStatus, WorkflowSummary};
use crate::workflow::store::SnapshotStore;
use crate::workspace::WorkspaceManager;

pub struct AppState {
    pub config: AppConfig,
    pub registry: Arc<WorkflowRegistry>,
    pub orchestrator: Orchestrator,
    pub workspace: WorkspaceManager,
    pub task_queue: RwLock<TaskQueue>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self> {
        let agents = Agents::live(&config)?;
        Ok(Self::with_agents(config, agents))
    }

    /// Build the service around an explicit set of stage handlers.
    pub fn with_agents(config: AppConfig, agents: Agents) -> Self {
        let store = config.persistence.state_dir.clone().map(SnapshotStore::new);
        let registry = Arc::new(WorkflowRegistry::new(store));
        let orchestrator = Orchestrator::new(agents, RetryPolicy::from(&config.retry))
            .with_observer(registry.clone());
        let workspace = WorkspaceManager::new(&config.workspace, config.github_token());

        Self {
            config,
            registry,
            orchestrator,
            workspace,
            task_queue: RwLock::new(TaskQueue::new()),
        }
    }

    /// Validate a request, register the workflow and queue it.
    pub async fn submit(&self, request: WorkflowRequest) -> Result<WorkflowState> {
        request.validate()?;
        let workflow = WorkflowState::new(request);
        let task = Task::RunWorkflow {
            workflow_id: workflow.workflow_id().to_string(),
            repo_url: workflow.repo_url().to_string(),
        };

        self.registry.insert(workflow.clone()).await;
        self.task_queue.write().await.enqueue(task);
        Ok(workflow)
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route("/api/workflows/:id", get(get_workflow))
        .route("/api/workflows/:id/cancel", post(cancel_workflow))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http());

    let router = if state.config.server.enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    router.with_state(state)
}

type ApiResult<T> = std::result::Result<T, (StatusCode, String)>;

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowAccepted {
    pub workflow_id: String,
    pub status: WorkflowStatus,
}

pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WorkflowRequest>,
) -> ApiResult<(StatusCode, Json<WorkflowAccepted>)> {
    let workflow = state.submit(request).await.map_err(|e| {
        tracing::warn!(error = %e, "Rejected workflow request");
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WorkflowAccepted {
            workflow_id: workflow.workflow_id().to_string(),
            status: workflow.status(),
        }),
    ))
}

pub async fn list_workflows(State(state): State<Arc<AppState>>) -> Json<Vec<WorkflowSummary>> {
    Json(state.registry.list().await)
}

pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowState>> {
    state
        .registry
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown workflow {id}")))
}

pub async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<WorkflowAccepted>)> {
    match state.registry.cancel(&id).await {
        CancelOutcome::Requested | CancelOutcome::CancelledQueued => {
            let status = state
                .registry
                .get(&id)
                .await
                .map(|s| s.status())
                .unwrap_or(WorkflowStatus::Running);
            Ok((
                StatusCode::ACCEPTED,
                Json(WorkflowAccepted {
                    workflow_id: id,
                    status,
                }),
            ))
        }
        CancelOutcome::NotFound => Err((StatusCode::NOT_FOUND, format!("Unknown workflow {id}"))),
        CancelOutcome::AlreadyTerminal => Err((
            StatusCode::CONFLICT,
            format!("Workflow {id} has already finished"),
        )),
    }
}

async fn health_check() -> &'static str {
    "ok"
}
