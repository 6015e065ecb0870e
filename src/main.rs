use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use coverbot::config::AppConfig;
use coverbot::error::AppError;
use coverbot::server::{create_router, AppState};
use coverbot::shutdown::{graceful_shutdown, wait_for_shutdown};
use coverbot::workflow::state::{WorkflowRequest, WorkflowState, DEFAULT_COVERAGE_THRESHOLD};
use coverbot::workflow::store::SnapshotStore;

const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(name = "coverbot", about = "Raise code coverage with generated tests")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one workflow in the foreground and exit with its outcome
    Run {
        #[arg(long)]
        repo_url: String,
        #[arg(long)]
        project_key: String,
        #[arg(long, default_value_t = DEFAULT_COVERAGE_THRESHOLD)]
        threshold: f64,
        /// Print the final snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve the HTTP API
    Serve,
    /// Print a persisted workflow snapshot
    Status { workflow_id: String },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match cli.command {
        Command::Run {
            repo_url,
            project_key,
            threshold,
            json,
        } => {
            let request = WorkflowRequest {
                repo_url,
                sonar_project_key: project_key,
                coverage_threshold: threshold,
            };
            run(config, request, json).await
        }
        Command::Serve => match serve(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "Server exited with an error");
                ExitCode::FAILURE
            }
        },
        Command::Status { workflow_id } => status(&config, &workflow_id).await,
    }
}

async fn run(config: AppConfig, request: WorkflowRequest, json: bool) -> ExitCode {
    let state = match AppState::new(config) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let workflow = match state.submit(request).await {
        Ok(workflow) => workflow,
        Err(e @ AppError::InvalidInput(_)) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_USAGE);
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let workflow_id = workflow.workflow_id().to_string();

    let cancel_state = Arc::clone(&state);
    let cancel_id = workflow_id.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, cancelling workflow...");
            cancel_state.registry.cancel(&cancel_id).await;
        }
    });

    let task = state.task_queue.write().await.take_next();
    if let Some(task) = task {
        coverbot::queue::run_task(&state, task).await;
    }
    ctrl_c.abort();

    match state.registry.get(&workflow_id).await {
        Some(finished) => {
            print_outcome(&finished, json);
            ExitCode::from(finished.status().exit_code())
        }
        None => ExitCode::FAILURE,
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        "Starting coverbot server"
    );

    let state = Arc::new(AppState::new(config.clone())?);

    // Start the task queue processor
    let queue_state = Arc::clone(&state);
    tokio::spawn(async move {
        coverbot::queue::run_queue_processor(queue_state).await;
    });

    // Re-admit workflows interrupted by a previous shutdown
    coverbot::queue::startup::resume_persisted_workflows(&state).await;

    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(format!(
        "{}:{}",
        config.server.host, config.server.port
    ))
    .await?;

    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    graceful_shutdown(&state).await;

    Ok(())
}

async fn status(config: &AppConfig, workflow_id: &str) -> ExitCode {
    let Some(dir) = &config.persistence.state_dir else {
        eprintln!("persistence.state_dir is not configured");
        return ExitCode::from(EXIT_USAGE);
    };

    match SnapshotStore::new(dir).load(workflow_id).await {
        Ok(Some(snapshot)) => {
            print_outcome(&snapshot, true);
            ExitCode::SUCCESS
        }
        Ok(None) => {
            eprintln!("No workflow {workflow_id} in {}", dir.display());
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn print_outcome(snapshot: &WorkflowState, json: bool) {
    if json {
        match serde_json::to_string_pretty(snapshot) {
            Ok(out) => println!("{out}"),
            Err(e) => eprintln!("Failed to serialize snapshot: {e}"),
        }
        return;
    }

    println!("workflow {}: {}", snapshot.workflow_id(), snapshot.status());
    if let Some(coverage) = snapshot.coverage_value {
        println!(
            "coverage {coverage:.1}% (threshold {:.1}%)",
            snapshot.coverage_threshold()
        );
    }
    if let Some(pr) = &snapshot.pr_reference {
        println!("pull request {pr}");
    }
    if let Some(failure) = snapshot.failure() {
        println!(
            "failed at {} ({} after {} attempt(s)): {}",
            failure.stage, failure.kind, failure.attempts, failure.message
        );
    }
}
