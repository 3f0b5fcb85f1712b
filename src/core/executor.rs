//! Step execution for approved plans.
//!
//! Runs the steps of a `running` plan strictly in order. Each step is
//! marked current, moved to running, handed to a [`StepRunner`] under the
//! step timeout, and finally marked completed or failed with its duration.
//! The first failed step ends the run with `EXECUTION_FAILURE`; later steps
//! are never started.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{error, info, instrument, warn};

use crate::adapters::{StepError, StepOutput, StepRunner};
use crate::domain::{DeploymentPlanAction, DeploymentPlanState, DeploymentStep, StepStatus};

use super::store::Dispatcher;

/// Retry policy for failed steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Runs approved plans step by step
#[derive(Debug, Clone)]
pub struct StepExecutor {
    step_timeout: Duration,
    retry: RetryPolicy,
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), RetryPolicy::default())
    }
}

impl StepExecutor {
    pub fn new(step_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            step_timeout,
            retry,
        }
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute the plan currently running in the store behind `dispatcher`.
    ///
    /// Returns the state after the last dispatched action. Does nothing if
    /// no plan is running. Every action is dispatched within the epoch of
    /// the plan this run started with, so once that plan is reset or
    /// replaced the run stops without touching the new plan.
    #[instrument(skip_all, fields(runner = runner.name()))]
    pub async fn run(
        &self,
        runner: &dyn StepRunner,
        dispatcher: &Dispatcher,
    ) -> Result<DeploymentPlanState> {
        let (epoch, state) = dispatcher.current().await?;
        let plan = match &state {
            DeploymentPlanState::Running { plan, .. } => plan.clone(),
            other => {
                warn!(status = %other.status(), "No plan is running");
                return Ok(state);
            }
        };

        info!(steps = plan.steps.len(), epoch, "Executing plan");

        for (index, step) in plan.steps.iter().enumerate() {
            let action = plan
                .analysis
                .actions
                .get(index)
                .map(String::as_str)
                .unwrap_or(step.id.as_str());

            let marked = advance(
                dispatcher,
                epoch,
                DeploymentPlanAction::SetCurrentStep { step_index: index },
            )
            .await?;
            let running = match marked {
                Some(_) => {
                    advance(
                        dispatcher,
                        epoch,
                        DeploymentPlanAction::update_step(index, StepStatus::Running, None),
                    )
                    .await?
                }
                None => None,
            };
            if running.is_none() {
                return Ok(stopped(dispatcher, step));
            }

            info!(step = %step.id, %action, "Step started");
            let started = Instant::now();
            let result = self.run_step(runner, step, action).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(_) => {
                    info!(step = %step.id, duration_ms, "Step completed");
                    let recorded = advance(
                        dispatcher,
                        epoch,
                        DeploymentPlanAction::update_step(
                            index,
                            StepStatus::Completed,
                            Some(duration_ms),
                        ),
                    )
                    .await?;
                    if recorded.is_none() {
                        return Ok(stopped(dispatcher, step));
                    }
                }
                Err(e) => {
                    error!(step = %step.id, duration_ms, error = %e, "Step failed");
                    let recorded = advance(
                        dispatcher,
                        epoch,
                        DeploymentPlanAction::update_step(
                            index,
                            StepStatus::Failed,
                            Some(duration_ms),
                        ),
                    )
                    .await?;
                    if recorded.is_none() {
                        return Ok(stopped(dispatcher, step));
                    }

                    let failed = dispatcher
                        .apply_in(
                            epoch,
                            DeploymentPlanAction::ExecutionFailure {
                                error: e.to_string(),
                            },
                        )
                        .await?;
                    return Ok(failed.unwrap_or_else(|| dispatcher.snapshot()));
                }
            }
        }

        match dispatcher
            .apply_in(epoch, DeploymentPlanAction::CompleteExecution)
            .await?
        {
            Some(state) => {
                info!("Plan completed");
                Ok(state)
            }
            None => {
                info!("Execution stopped before completion");
                Ok(dispatcher.snapshot())
            }
        }
    }

    /// Run one step with timeout and retry
    async fn run_step(
        &self,
        runner: &dyn StepRunner,
        step: &DeploymentStep,
        action: &str,
    ) -> Result<StepOutput, StepError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let result = match timeout(self.step_timeout, runner.run(step, action)).await {
                Ok(result) => result,
                Err(_) => Err(StepError::Timeout {
                    step: step.id.clone(),
                    seconds: self.step_timeout.as_secs(),
                }),
            };

            match result {
                Ok(output) => return Ok(output),
                Err(e) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        step = %step.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Dispatch within `epoch`, yielding the new state only while the plan is
/// still running
async fn advance(
    dispatcher: &Dispatcher,
    epoch: u64,
    action: DeploymentPlanAction,
) -> Result<Option<DeploymentPlanState>> {
    Ok(dispatcher
        .apply_in(epoch, action)
        .await?
        .filter(DeploymentPlanState::is_running))
}

fn stopped(dispatcher: &Dispatcher, step: &DeploymentStep) -> DeploymentPlanState {
    let current = dispatcher.snapshot();
    info!(step = %step.id, status = %current.status(), "Execution stopped");
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{PlanRequest, ScriptedProvider, ScriptedRunner, StepScript};
    use crate::core::generator::PlanGenerator;
    use crate::core::policy::PolicyGate;
    use crate::core::safety::SafetySettings;
    use crate::core::store::{spawn, PlanStore};
    use crate::domain::{Analysis, PlanStatus};

    async fn running(actions: &[&str]) -> Dispatcher {
        let (dispatcher, _handle) = spawn(PlanStore::new(), None);
        let actions: Vec<String> = actions.iter().map(|a| a.to_string()).collect();
        let explanations = actions.join(" then ");
        let provider = ScriptedProvider::succeeding(
            vec![],
            Analysis::new("gpt", actions, 0.95).with_explanations(explanations),
        );

        PlanGenerator::from_settings(&SafetySettings::default(), PolicyGate::default())
            .run(&provider, &PlanRequest::new("change"), &dispatcher)
            .await
            .unwrap();
        dispatcher
            .apply(DeploymentPlanAction::ApproveAndExecute)
            .await
            .unwrap();
        dispatcher
    }

    fn no_delay_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    #[test]
    fn test_retry_delay() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(5000)); // capped
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!RetryPolicy::default().should_retry(1));
    }

    #[tokio::test]
    async fn test_all_steps_complete() {
        let dispatcher = running(&["build", "deploy"]).await;
        let runner = ScriptedRunner::default();

        let state = StepExecutor::default()
            .run(&runner, &dispatcher)
            .await
            .unwrap();

        assert_eq!(state.status(), PlanStatus::Completed);
        assert_eq!(state.current_step_index(), Some(1));
        assert!(state
            .steps()
            .iter()
            .all(|s| s.status == StepStatus::Completed && s.duration.is_some()));
        assert_eq!(runner.calls(), vec!["build", "deploy"]);
    }

    #[tokio::test]
    async fn test_first_failure_stops_execution() {
        let dispatcher = running(&["build", "migrate", "deploy"]).await;
        let runner = ScriptedRunner::default().with_script(
            "migrate",
            StepScript {
                fail: Some("lock timeout".to_string()),
                ..Default::default()
            },
        );

        let state = StepExecutor::default()
            .run(&runner, &dispatcher)
            .await
            .unwrap();

        assert_eq!(state.status(), PlanStatus::ExecutionFailed);
        assert_eq!(state.current_step_index(), Some(1));
        assert_eq!(state.error(), Some("Step 'step-2' failed: lock timeout"));

        let steps = state.steps();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[1].status, StepStatus::Failed);
        assert!(steps[1].duration.is_some());
        assert_eq!(steps[2].status, StepStatus::Pending);
        assert_eq!(runner.calls(), vec!["build", "migrate"]);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let dispatcher = running(&["deploy"]).await;
        let runner = ScriptedRunner::default().with_script(
            "deploy",
            StepScript {
                transient_failures: 2,
                ..Default::default()
            },
        );

        let state = StepExecutor::new(Duration::from_secs(5), no_delay_retry(3))
            .run(&runner, &dispatcher)
            .await
            .unwrap();

        assert_eq!(state.status(), PlanStatus::Completed);
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_step_timeout_fails_execution() {
        let dispatcher = running(&["deploy"]).await;
        let runner = ScriptedRunner::default().with_script(
            "deploy",
            StepScript {
                delay_ms: 5_000,
                ..Default::default()
            },
        );

        let state = StepExecutor::new(Duration::from_millis(50), RetryPolicy::default())
            .run(&runner, &dispatcher)
            .await
            .unwrap();

        assert_eq!(state.status(), PlanStatus::ExecutionFailed);
        assert!(state.error().unwrap().contains("timed out"));
        assert_eq!(state.steps()[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_nothing_to_execute_when_not_running() {
        let (dispatcher, _handle) = spawn(PlanStore::new(), None);
        let runner = ScriptedRunner::default();

        let state = StepExecutor::default()
            .run(&runner, &dispatcher)
            .await
            .unwrap();

        assert_eq!(state.status(), PlanStatus::Idle);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reset_mid_step_stops_without_touching_new_plan() {
        let dispatcher = running(&["build", "deploy"]).await;
        let runner = ScriptedRunner::default().with_script(
            "build",
            StepScript {
                delay_ms: 200,
                ..Default::default()
            },
        );

        let executing = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { StepExecutor::default().run(&runner, &dispatcher).await })
        };

        let mut rx = dispatcher.subscribe();
        rx.wait_for(|s| s.steps().first().map(|s| s.status) == Some(StepStatus::Running))
            .await
            .unwrap();

        // Replace the plan while the first step is still in flight
        dispatcher.apply(DeploymentPlanAction::Reset).await.unwrap();
        let replacement = ScriptedProvider::succeeding(
            vec![],
            Analysis::new("gpt", vec!["rollback".to_string()], 0.95).with_explanations("rollback"),
        );
        PlanGenerator::from_settings(&SafetySettings::default(), PolicyGate::default())
            .run(&replacement, &PlanRequest::new("undo"), &dispatcher)
            .await
            .unwrap();
        dispatcher
            .apply(DeploymentPlanAction::ApproveAndExecute)
            .await
            .unwrap();

        let returned = executing.await.unwrap().unwrap();

        assert_eq!(returned.status(), PlanStatus::Running);
        let steps = dispatcher.snapshot().steps().to_vec();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Pending);
    }
}
