//! End-to-end workflow runs with the real stage handlers over in-memory collaborators.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use coverbot::agent::analyze::AnalyzeAgent;
use coverbot::agent::clone::CloneAgent;
use coverbot::agent::coverage::FetchCoverageAgent;
use coverbot::agent::generate::GenerateTestsAgent;
use coverbot::agent::pull_request::CreatePrAgent;
use coverbot::agent::Agents;
use coverbot::analysis::FileAnalyzer;
use coverbot::config::AnalysisConfig;
use coverbot::error::{AppError, ErrorKind, Result};
use coverbot::llm::TestWriter;
use coverbot::platform::types::{CreatePullRequest, PullRequest};
use coverbot::platform::Platform;
use coverbot::quality::{CoverageReport, QualityServer};
use coverbot::workflow::orchestrator::{Orchestrator, StateObserver};
use coverbot::workflow::retry::RetryPolicy;
use coverbot::workflow::state::{
    CodeLocation, GeneratedArtifact, OutcomeStatus, Stage, UncoveredFile, WorkflowRequest,
    WorkflowState, WorkflowStatus,
};
use coverbot::workspace::SourceControl;

/// Creates a small Python project instead of cloning.
struct FakeScm {
    root: PathBuf,
    clones: Mutex<u32>,
    published: Mutex<Vec<(String, Vec<GeneratedArtifact>)>>,
}

#[async_trait]
impl SourceControl for FakeScm {
    async fn clone_repository(&self, workflow_id: &str, _repo_url: &str) -> Result<PathBuf> {
        *self.clones.lock().unwrap() += 1;
        let dir = self.root.join(workflow_id);
        std::fs::create_dir_all(dir.join("src"))?;
        std::fs::write(dir.join("src/parser.py"), "def parse(s):\n    return s.split()\n")?;
        std::fs::write(dir.join("src/cli.py"), "def main():\n    pass\n")?;
        Ok(dir)
    }

    async fn publish(
        &self,
        _local_path: &Path,
        branch: &str,
        artifacts: &[GeneratedArtifact],
        _commit_message: &str,
    ) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((branch.to_string(), artifacts.to_vec()));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Reply {
    Coverage(f64),
    Unavailable,
    RateLimited,
    NotFound,
}

/// Replies from a script, repeating the last entry once exhausted.
struct FakeQuality {
    script: Mutex<VecDeque<Reply>>,
    calls: Mutex<u32>,
    cancel_on_call: Option<CancellationToken>,
}

impl FakeQuality {
    fn new(script: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(0),
            cancel_on_call: None,
        }
    }
}

#[async_trait]
impl QualityServer for FakeQuality {
    async fn fetch_coverage(&self, _project_key: &str) -> Result<CoverageReport> {
        *self.calls.lock().unwrap() += 1;
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        let reply = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().copied()
            }
        };
        let coverage = match reply.unwrap_or(Reply::Coverage(0.0)) {
            Reply::Coverage(value) => value,
            Reply::Unavailable => return Err(AppError::Unavailable("sonar down".to_string())),
            Reply::RateLimited => return Err(AppError::RateLimited("slow down".to_string())),
            Reply::NotFound => return Err(AppError::NotFound("no such project".to_string())),
        };
        Ok(CoverageReport {
            coverage,
            metrics: BTreeMap::from([
                ("coverage".to_string(), coverage),
                ("branch_coverage".to_string(), coverage - 10.0),
            ]),
            uncovered_files: vec![
                UncoveredFile {
                    path: "src/cli.py".to_string(),
                    coverage: 50.0,
                    uncovered_lines: 1,
                    language: "python".to_string(),
                },
                UncoveredFile {
                    path: "src/parser.py".to_string(),
                    coverage: 0.0,
                    uncovered_lines: 2,
                    language: "python".to_string(),
                },
                UncoveredFile {
                    path: "src/removed.py".to_string(),
                    coverage: 0.0,
                    uncovered_lines: 40,
                    language: "python".to_string(),
                },
            ],
        })
    }
}

struct FakeWriter;

#[async_trait]
impl TestWriter for FakeWriter {
    async fn generate_tests(
        &self,
        _local_path: &Path,
        locations: &[CodeLocation],
    ) -> Result<Vec<GeneratedArtifact>> {
        Ok(locations
            .iter()
            .map(|l| GeneratedArtifact {
                path: format!("tests/test_{}", l.file_path.trim_start_matches("src/")),
                content: "def test_it():\n    assert True\n".to_string(),
            })
            .collect())
    }
}

struct FakePlatform {
    requests: Mutex<Vec<(String, CreatePullRequest)>>,
}

#[async_trait]
impl Platform for FakePlatform {
    async fn create_pull_request(
        &self,
        repo_full_name: &str,
        pr: &CreatePullRequest,
    ) -> Result<PullRequest> {
        self.requests
            .lock()
            .unwrap()
            .push((repo_full_name.to_string(), pr.clone()));
        Ok(PullRequest {
            number: 7,
            title: pr.title.clone(),
            html_url: Some(format!("https://github.com/{repo_full_name}/pull/7")),
            head_branch: pr.head_branch.clone(),
            base_branch: pr.base_branch.clone(),
        })
    }

    async fn find_open_pull_request(
        &self,
        _repo_full_name: &str,
        _head_branch: &str,
    ) -> Result<Option<PullRequest>> {
        Ok(None)
    }
}

#[derive(Default)]
struct Recorder {
    snapshots: Mutex<Vec<WorkflowState>>,
}

#[async_trait]
impl StateObserver for Recorder {
    async fn on_transition(&self, snapshot: &WorkflowState) {
        self.snapshots.lock().unwrap().push(snapshot.clone());
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    scm: Arc<FakeScm>,
    quality: Arc<FakeQuality>,
    platform: Arc<FakePlatform>,
    recorder: Arc<Recorder>,
    orchestrator: Orchestrator,
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        multiplier: 2.0,
        max_delay: Duration::from_millis(20),
        attempt_timeout: Duration::from_secs(30),
    }
}

fn fixture(quality: FakeQuality) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let scm = Arc::new(FakeScm {
        root: tmp.path().to_path_buf(),
        clones: Mutex::new(0),
        published: Mutex::new(Vec::new()),
    });
    let quality = Arc::new(quality);
    let platform = Arc::new(FakePlatform {
        requests: Mutex::new(Vec::new()),
    });
    let recorder = Arc::new(Recorder::default());
    let analyzer = Arc::new(FileAnalyzer::new(&AnalysisConfig::default()).unwrap());

    let agents = Agents::new(
        Arc::new(CloneAgent::new(scm.clone())),
        Arc::new(FetchCoverageAgent::new(quality.clone())),
        Arc::new(AnalyzeAgent::new(analyzer)),
        Arc::new(GenerateTestsAgent::new(Arc::new(FakeWriter))),
        Arc::new(CreatePrAgent::new(
            scm.clone(),
            platform.clone(),
            "main",
            "coverage-improvement",
        )),
    );
    let orchestrator = Orchestrator::new(agents, fast_retry()).with_observer(recorder.clone());

    Fixture {
        _tmp: tmp,
        scm,
        quality,
        platform,
        recorder,
        orchestrator,
    }
}

fn request(threshold: f64) -> WorkflowState {
    WorkflowState::new(WorkflowRequest {
        repo_url: "https://github.com/acme/widgets".to_string(),
        sonar_project_key: "acme_widgets".to_string(),
        coverage_threshold: threshold,
    })
}

fn stages(state: &WorkflowState) -> Vec<(Stage, u32, OutcomeStatus)> {
    state
        .history()
        .iter()
        .map(|o| (o.stage, o.attempt, o.status))
        .collect()
}

#[tokio::test]
async fn coverage_above_threshold_skips_generation() {
    let fx = fixture(FakeQuality::new(vec![Reply::Coverage(95.0)]));

    let finished = fx
        .orchestrator
        .run(request(90.0), CancellationToken::new())
        .await;

    assert_eq!(finished.status(), WorkflowStatus::SkippedThresholdMet);
    assert_eq!(finished.coverage_value, Some(95.0));
    assert_eq!(
        stages(&finished),
        vec![
            (Stage::Clone, 1, OutcomeStatus::Succeeded),
            (Stage::FetchCoverage, 1, OutcomeStatus::Succeeded),
        ]
    );
    assert!(finished.generated_artifacts.is_empty());
    assert!(finished.pr_reference.is_none());
    assert!(fx.scm.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn coverage_equal_to_threshold_counts_as_met() {
    let fx = fixture(FakeQuality::new(vec![Reply::Coverage(90.0)]));
    let finished = fx
        .orchestrator
        .run(request(90.0), CancellationToken::new())
        .await;
    assert_eq!(finished.status(), WorkflowStatus::SkippedThresholdMet);
}

#[tokio::test]
async fn low_coverage_runs_every_stage_and_opens_pr() {
    let fx = fixture(FakeQuality::new(vec![Reply::Coverage(42.0)]));
    let state = request(90.0);
    let short_id: String = state.workflow_id().chars().take(8).collect();

    let finished = fx.orchestrator.run(state, CancellationToken::new()).await;

    assert_eq!(finished.status(), WorkflowStatus::Succeeded);
    assert_eq!(
        finished.completed_stages(),
        vec![
            Stage::Clone,
            Stage::FetchCoverage,
            Stage::Analyze,
            Stage::GenerateTests,
            Stage::CreatePr,
        ]
    );
    assert!(finished.failure().is_none());
    assert_eq!(
        finished.pr_reference.as_deref(),
        Some("https://github.com/acme/widgets/pull/7")
    );

    // Missing files are dropped and the rest ranked by uncovered lines
    let targets: Vec<_> = finished
        .uncovered_targets
        .iter()
        .map(|t| t.file_path.as_str())
        .collect();
    assert_eq!(targets, vec!["src/parser.py", "src/cli.py"]);

    let published = fx.scm.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, format!("coverage-improvement/{short_id}"));
    assert_eq!(published[0].1, finished.generated_artifacts);

    let requests = fx.platform.requests.lock().unwrap();
    assert_eq!(requests[0].0, "acme/widgets");
    assert_eq!(requests[0].1.title, "Improve code coverage for acme/widgets");
    assert_eq!(requests[0].1.base_branch, "main");
}

#[tokio::test]
async fn transient_failures_are_retried_within_bound() {
    let fx = fixture(FakeQuality::new(vec![
        Reply::Unavailable,
        Reply::RateLimited,
        Reply::Coverage(95.0),
    ]));

    let finished = fx
        .orchestrator
        .run(request(90.0), CancellationToken::new())
        .await;

    assert_eq!(finished.status(), WorkflowStatus::SkippedThresholdMet);
    assert_eq!(finished.attempts_for(Stage::FetchCoverage), 3);
    assert_eq!(*fx.quality.calls.lock().unwrap(), 3);
    let fetch: Vec<_> = finished
        .history()
        .iter()
        .filter(|o| o.stage == Stage::FetchCoverage)
        .map(|o| (o.attempt, o.status, o.error.as_ref().map(|e| e.kind)))
        .collect();
    assert_eq!(
        fetch,
        vec![
            (1, OutcomeStatus::Failed, Some(ErrorKind::Transient)),
            (2, OutcomeStatus::Failed, Some(ErrorKind::Transient)),
            (3, OutcomeStatus::Succeeded, None),
        ]
    );
}

#[tokio::test]
async fn exhausted_retries_fail_the_workflow() {
    let fx = fixture(FakeQuality::new(vec![Reply::Unavailable]));

    let finished = fx
        .orchestrator
        .run(request(90.0), CancellationToken::new())
        .await;

    assert_eq!(finished.status(), WorkflowStatus::Failed);
    assert_eq!(*fx.quality.calls.lock().unwrap(), 3);
    let failure = finished.failure().unwrap();
    assert_eq!(failure.stage, Stage::FetchCoverage);
    assert_eq!(failure.kind, ErrorKind::Transient);
    assert_eq!(failure.attempts, 3);
    assert!(finished.generated_artifacts.is_empty());
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let fx = fixture(FakeQuality::new(vec![Reply::NotFound]));

    let finished = fx
        .orchestrator
        .run(request(90.0), CancellationToken::new())
        .await;

    assert_eq!(finished.status(), WorkflowStatus::Failed);
    assert_eq!(*fx.quality.calls.lock().unwrap(), 1);
    let failure = finished.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Permanent);
    assert_eq!(failure.attempts, 1);
}

#[tokio::test]
async fn cancellation_stops_before_next_stage() {
    let cancel = CancellationToken::new();
    let mut quality = FakeQuality::new(vec![Reply::Coverage(10.0)]);
    quality.cancel_on_call = Some(cancel.clone());
    let fx = fixture(quality);

    let finished = fx.orchestrator.run(request(90.0), cancel).await;

    assert_eq!(finished.status(), WorkflowStatus::Failed);
    let failure = finished.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert_eq!(failure.stage, Stage::Analyze);
    assert_eq!(failure.attempts, 0);
    // The stage that was in flight completed; the next one never started
    assert_eq!(
        finished.completed_stages(),
        vec![Stage::Clone, Stage::FetchCoverage]
    );
    assert_eq!(finished.attempts_for(Stage::Analyze), 0);
}

#[tokio::test]
async fn snapshots_are_published_and_resumable() {
    let fx = fixture(FakeQuality::new(vec![Reply::Coverage(42.0)]));
    let finished = fx
        .orchestrator
        .run(request(90.0), CancellationToken::new())
        .await;
    assert_eq!(finished.status(), WorkflowStatus::Succeeded);

    let snapshots = fx.recorder.snapshots.lock().unwrap().clone();
    // Initial snapshot plus one per stage
    assert_eq!(snapshots.len(), 6);
    assert_eq!(snapshots.last().unwrap(), &finished);

    // Resume a fresh run from the snapshot taken right before Analyze
    let mid = snapshots
        .iter()
        .find(|s| s.current_stage() == Stage::Analyze)
        .unwrap()
        .clone();
    let resumed_fx = fixture(FakeQuality::new(vec![Reply::Coverage(0.0)]));
    let resumed = resumed_fx
        .orchestrator
        .run(mid.clone(), CancellationToken::new())
        .await;

    assert_eq!(resumed.status(), WorkflowStatus::Succeeded);
    assert_eq!(*resumed_fx.scm.clones.lock().unwrap(), 0);
    assert_eq!(*resumed_fx.quality.calls.lock().unwrap(), 0);
    assert_eq!(resumed.coverage_value, Some(42.0));
    assert_eq!(&resumed.history()[..mid.history().len()], mid.history());
    assert_eq!(resumed.completed_stages().len(), 5);
}

#[tokio::test]
async fn terminal_state_is_returned_unchanged() {
    let fx = fixture(FakeQuality::new(vec![Reply::Coverage(95.0)]));
    let finished = fx
        .orchestrator
        .run(request(90.0), CancellationToken::new())
        .await;

    let again = fx
        .orchestrator
        .run(finished.clone(), CancellationToken::new())
        .await;
    assert_eq!(again, finished);
    assert_eq!(*fx.scm.clones.lock().unwrap(), 1);
}
