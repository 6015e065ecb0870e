use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::agent::StageHandler;
use crate::config::RetryConfig;
use crate::error::StageError;
use crate::workflow::state::{OutcomeStatus, StageOutcome, WorkflowState};

/// Attempt bound, backoff curve and per-attempt deadline for one stage.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given 1-based failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Runs a stage handler with bounded retries, backoff and a deadline per attempt.
pub struct RetrySupervisor {
    policy: RetryPolicy,
}

impl RetrySupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Invoke `handler` for `state.current_stage()` until it succeeds, fails
    /// with a non-transient error, runs out of attempts, or is cancelled while
    /// backing off.
    ///
    /// Every attempt is appended to the history. On success the handler's
    /// owned fields are written back into `state`.
    pub async fn run(
        &self,
        handler: &dyn StageHandler,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let stage = state.current_stage();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started_at = Utc::now();
            let clock = Instant::now();

            tracing::info!(
                workflow_id = %state.workflow_id(),
                stage = %stage,
                attempt,
                "Stage attempt started"
            );

            let deadline = self.policy.attempt_timeout;
            let execution = handler.execute(state.clone());
            let result = match tokio::time::timeout(deadline, execution).await {
                Ok(result) => result,
                Err(_) => Err(StageError::transient(format!(
                    "Attempt exceeded deadline of {}s",
                    deadline.as_secs_f64()
                ))),
            };

            let elapsed_ms = clock.elapsed().as_millis() as u64;

            let error = match result {
                Ok(updated) => {
                    state.record(StageOutcome {
                        stage,
                        attempt,
                        status: OutcomeStatus::Succeeded,
                        error: None,
                        started_at,
                        elapsed_ms,
                    });
                    state.absorb(stage, updated);
                    tracing::info!(
                        workflow_id = %state.workflow_id(),
                        stage = %stage,
                        attempt,
                        elapsed_ms,
                        "Stage attempt succeeded"
                    );
                    return Ok(());
                }
                Err(error) => error,
            };

            state.record(StageOutcome {
                stage,
                attempt,
                status: OutcomeStatus::Failed,
                error: Some(error.clone()),
                started_at,
                elapsed_ms,
            });

            if !error.is_retryable() {
                tracing::warn!(
                    workflow_id = %state.workflow_id(),
                    stage = %stage,
                    attempt,
                    kind = %error.kind,
                    error = %error.message,
                    "Stage failed without retry"
                );
                return Err(error);
            }

            if attempt >= self.policy.max_attempts {
                tracing::error!(
                    workflow_id = %state.workflow_id(),
                    stage = %stage,
                    attempts = attempt,
                    error = %error.message,
                    "Stage retries exhausted"
                );
                return Err(error);
            }

            let delay = self.policy.delay_after(attempt);
            tracing::warn!(
                workflow_id = %state.workflow_id(),
                stage = %stage,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error.message,
                "Transient stage failure, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(
                        workflow_id = %state.workflow_id(),
                        stage = %stage,
                        "Cancelled while waiting to retry"
                    );
                    return Err(StageError::cancelled());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::ErrorKind;
    use crate::workflow::state::{Stage, WorkflowRequest};

    /// Replays a fixed script of results, then repeats the last one.
    struct ScriptedHandler {
        script: Mutex<VecDeque<Result<(), StageError>>>,
        last: Result<(), StageError>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl ScriptedHandler {
        fn new(script: Vec<Result<(), StageError>>) -> Self {
            let last = script.last().cloned().unwrap_or(Ok(()));
            Self {
                script: Mutex::new(script.into()),
                last,
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(vec![Ok(())])
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageHandler for ScriptedHandler {
        fn stage(&self) -> Stage {
            Stage::Clone
        }

        async fn execute(&self, mut state: WorkflowState) -> Result<WorkflowState, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.last.clone());
            next.map(|()| {
                state.local_path = Some("/tmp/checkout".into());
                state
            })
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn state() -> WorkflowState {
        WorkflowState::new(WorkflowRequest {
            repo_url: "https://github.com/acme/widgets".to_string(),
            sonar_project_key: "acme".to_string(),
            coverage_threshold: 80.0,
        })
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(60),
        };
        let delays: Vec<u64> = (1..=7).map(|a| policy.delay_after(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_default_policy_matches_config_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let handler = ScriptedHandler::new(vec![Ok(())]);
        let supervisor = RetrySupervisor::new(policy(3));
        let mut state = state();

        let result = supervisor
            .run(&handler, &mut state, &CancellationToken::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(handler.calls(), 1);
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.history()[0].status, OutcomeStatus::Succeeded);
        assert!(state.local_path.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_transient_runs_max_attempts() {
        let handler = ScriptedHandler::new(vec![Err(StageError::transient("503"))]);
        let supervisor = RetrySupervisor::new(policy(4));
        let mut state = state();

        let err = supervisor
            .run(&handler, &mut state, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Transient);
        assert_eq!(handler.calls(), 4);
        let attempts: Vec<u32> = state.history().iter().map(|o| o.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4]);
        assert!(state
            .history()
            .iter()
            .all(|o| o.status == OutcomeStatus::Failed));
        assert_eq!(state.history()[3].error.as_ref().unwrap().message, "503");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let handler = ScriptedHandler::new(vec![
            Err(StageError::transient("rate limited")),
            Ok(()),
        ]);
        let supervisor = RetrySupervisor::new(policy(3));
        let mut state = state();

        supervisor
            .run(&handler, &mut state, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(handler.calls(), 2);
        assert_eq!(state.history().len(), 2);
        assert_eq!(state.history()[0].status, OutcomeStatus::Failed);
        assert_eq!(state.history()[1].status, OutcomeStatus::Succeeded);
        assert_eq!(state.history()[1].attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_is_not_retried() {
        let handler = ScriptedHandler::new(vec![Err(StageError::permanent("401"))]);
        let supervisor = RetrySupervisor::new(policy(5));
        let mut state = state();

        let err = supervisor
            .run(&handler, &mut state, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Permanent);
        assert_eq!(handler.calls(), 1);
        assert_eq!(state.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_precondition_is_not_retried() {
        let handler = ScriptedHandler::new(vec![Err(StageError::precondition("no path"))]);
        let supervisor = RetrySupervisor::new(policy(5));
        let mut state = state();

        let err = supervisor
            .run(&handler, &mut state, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Precondition);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_overrun_is_transient() {
        let handler = ScriptedHandler::slow(Duration::from_secs(60));
        let supervisor = RetrySupervisor::new(RetryPolicy {
            attempt_timeout: Duration::from_secs(1),
            ..policy(2)
        });
        let mut state = state();

        let err = supervisor
            .run(&handler, &mut state, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Transient);
        assert!(err.message.contains("deadline"));
        assert_eq!(handler.calls(), 2);
        assert!(state.local_path.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff_stops_retries() {
        let handler = ScriptedHandler::new(vec![Err(StageError::transient("busy"))]);
        let supervisor = RetrySupervisor::new(policy(5));
        let mut state = state();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = supervisor.run(&handler, &mut state, &cancel).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(handler.calls(), 1);
        assert_eq!(state.history().len(), 1);
    }
}
