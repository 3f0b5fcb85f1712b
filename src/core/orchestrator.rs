//! Session orchestrator.
//!
//! Owns one plan store task and coordinates generation, approval and
//! execution against it. Generation and execution run as tokio tasks that
//! only talk to the store by dispatching actions; `reset` aborts whichever
//! task is in flight before clearing the state.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{AnalysisProvider, PlanRequest, StepRunner};
use crate::config::ResolvedConfig;
use crate::domain::{DeploymentPlanAction, DeploymentPlanState};

use super::executor::{RetryPolicy, StepExecutor};
use super::generator::PlanGenerator;
use super::journal::Journal;
use super::reducer::reduce;
use super::policy::{PolicyConfig, PolicyGate};
use super::safety::SafetySettings;
use super::store::{spawn, Dispatcher, PlanStore};

/// Everything the orchestrator needs to evaluate and run plans
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub safety: SafetySettings,
    pub policy: PolicyConfig,
    pub step_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            safety: SafetySettings::default(),
            policy: PolicyConfig::default(),
            step_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            safety: config.safety.clone(),
            policy: config.policy.clone(),
            step_timeout: config.execution.step_timeout(),
            retry: config.execution.retry.clone(),
        }
    }
}

/// Main plan orchestrator
pub struct Orchestrator {
    session_id: Uuid,
    dispatcher: Dispatcher,
    store_task: JoinHandle<PlanStore>,
    generator: Arc<PlanGenerator>,
    executor: Arc<StepExecutor>,

    /// Generation or execution task currently running, with its ticket
    in_flight: Mutex<Option<(u64, AbortHandle)>>,
    tickets: AtomicU64,
}

impl Orchestrator {
    /// Create an orchestrator without a journal
    pub fn new(settings: OrchestratorSettings) -> Self {
        Self::build(settings, Uuid::new_v4(), None)
    }

    /// Create an orchestrator that journals every action to `journal`
    pub fn with_journal(settings: OrchestratorSettings, journal: Journal) -> Self {
        Self::build(settings, journal.session_id(), Some(journal))
    }

    /// Start a new journaled session under the configured home
    pub async fn open(settings: OrchestratorSettings) -> Result<Self> {
        let journal = Journal::open(Uuid::new_v4())
            .await
            .context("Failed to open session journal")?;
        Ok(Self::with_journal(settings, journal))
    }

    /// Reopen a journaled session, rebuilding its state from the journal.
    ///
    /// New actions continue the journal's sequence, so a plan left
    /// `awaiting_approval` by an earlier run can be approved and executed.
    pub async fn resume(settings: OrchestratorSettings, journal: Journal) -> Result<Self> {
        let entries = journal
            .replay()
            .await
            .with_context(|| format!("Failed to replay session {}", journal.session_id()))?;
        let sequence = entries.last().map(|e| e.sequence).unwrap_or(0);
        let state = entries
            .into_iter()
            .map(|entry| entry.action)
            .fold(DeploymentPlanState::Idle, reduce);

        info!(session_id = %journal.session_id(), sequence, status = %state.status(), "Session resumed");

        let store = PlanStore::from_state(state, sequence);
        Ok(Self::build_with(settings, journal.session_id(), store, Some(journal)))
    }

    fn build(settings: OrchestratorSettings, session_id: Uuid, journal: Option<Journal>) -> Self {
        info!(%session_id, "Session started");
        Self::build_with(settings, session_id, PlanStore::new(), journal)
    }

    fn build_with(
        settings: OrchestratorSettings,
        session_id: Uuid,
        store: PlanStore,
        journal: Option<Journal>,
    ) -> Self {
        let (dispatcher, store_task) = spawn(store, journal);
        let generator = PlanGenerator::from_settings(&settings.safety, PolicyGate::new(settings.policy));
        let executor = StepExecutor::new(settings.step_timeout, settings.retry);

        Self {
            session_id,
            dispatcher,
            store_task,
            generator: Arc::new(generator),
            executor: Arc::new(executor),
            in_flight: Mutex::new(None),
            tickets: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Handle for dispatching actions directly (e.g. from a UI)
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Read-only snapshot of the current state
    pub fn snapshot(&self) -> DeploymentPlanState {
        self.dispatcher.snapshot()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<DeploymentPlanState> {
        self.dispatcher.subscribe()
    }

    /// Generate a plan and run it through the safety and policy gate.
    ///
    /// Returns the state once generation has finished (normally
    /// `awaiting_approval` or `failed`), or the current state if the
    /// generation was cancelled by [`Orchestrator::reset`].
    #[instrument(skip_all, fields(session_id = %self.session_id))]
    pub async fn generate(
        &self,
        provider: Arc<dyn AnalysisProvider>,
        request: PlanRequest,
    ) -> Result<DeploymentPlanState> {
        let generator = Arc::clone(&self.generator);
        let dispatcher = self.dispatcher.clone();

        self.supervise(async move { generator.run(provider.as_ref(), &request, &dispatcher).await })
            .await
    }

    /// Approve the plan awaiting approval and move it to running
    pub async fn approve(&self) -> Result<DeploymentPlanState> {
        let state = self
            .dispatcher
            .apply(DeploymentPlanAction::ApproveAndExecute)
            .await?;
        if !state.is_running() {
            warn!(status = %state.status(), "Nothing to approve");
        }
        Ok(state)
    }

    /// Execute the running plan step by step
    #[instrument(skip_all, fields(session_id = %self.session_id))]
    pub async fn execute(&self, runner: Arc<dyn StepRunner>) -> Result<DeploymentPlanState> {
        let executor = Arc::clone(&self.executor);
        let dispatcher = self.dispatcher.clone();

        self.supervise(async move { executor.run(runner.as_ref(), &dispatcher).await })
            .await
    }

    /// Generate, gate and, if approved, execute a plan.
    ///
    /// `approve` grants human approval up front. Without it the plan only
    /// proceeds when the policy auto-approves it: `auto_approve` is enabled
    /// and no rule asked for review. Auto-approval is still dispatched as an
    /// explicit `APPROVE_AND_EXECUTE` so it shows up in the journal.
    pub async fn run(
        &self,
        provider: Arc<dyn AnalysisProvider>,
        runner: Arc<dyn StepRunner>,
        request: PlanRequest,
        approve: bool,
    ) -> Result<DeploymentPlanState> {
        let state = self.generate(provider, request).await?;

        let requires_approval = match &state {
            DeploymentPlanState::AwaitingApproval {
                requires_approval, ..
            } => *requires_approval,
            _ => return Ok(state),
        };

        let auto_approve = self.generator.gate().config().auto_approve;
        if !approve && (requires_approval || !auto_approve) {
            info!(requires_approval, "Plan awaiting approval");
            return Ok(state);
        }

        if !approve {
            info!("Plan auto-approved by policy");
        }

        let state = self.approve().await?;
        if !state.is_running() {
            return Ok(state);
        }

        self.execute(runner).await
    }

    /// Cancel any in-flight generation or execution and return to idle
    pub async fn reset(&self) -> Result<DeploymentPlanState> {
        if let Some((_, task)) = self.take_in_flight(None) {
            info!("Cancelling in-flight task");
            task.abort();
        }

        Ok(self.dispatcher.apply(DeploymentPlanAction::Reset).await?)
    }

    /// Stop the session, returning the final state
    pub async fn shutdown(self) -> Result<DeploymentPlanState> {
        let Self {
            dispatcher,
            store_task,
            in_flight,
            ..
        } = self;

        if let Ok(mut guard) = in_flight.lock() {
            if let Some((_, task)) = guard.take() {
                task.abort();
            }
        }
        drop(dispatcher);

        let store = store_task.await.context("Plan store task failed")?;
        Ok(store.into_state())
    }

    /// Run `task` as the in-flight task and wait for it.
    ///
    /// Only one generation or execution runs at a time; a second one is
    /// refused while the first is still in flight.
    async fn supervise<F>(&self, task: F) -> Result<DeploymentPlanState>
    where
        F: Future<Output = Result<DeploymentPlanState>> + Send + 'static,
    {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let handle = {
            let mut guard = self
                .in_flight
                .lock()
                .map_err(|_| anyhow!("In-flight task registry is poisoned"))?;
            if guard.as_ref().is_some_and(|(_, task)| !task.is_finished()) {
                anyhow::bail!("A generation or execution is already in progress");
            }

            let handle = tokio::spawn(task);
            *guard = Some((ticket, handle.abort_handle()));
            handle
        };

        let outcome = handle.await;
        self.take_in_flight(Some(ticket));

        match outcome {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => {
                info!("Task cancelled");
                Ok(self.dispatcher.snapshot())
            }
            Err(e) => Err(anyhow!("Orchestrator task panicked: {}", e)),
        }
    }

    /// Take the in-flight task; with a ticket, only if it is that task
    fn take_in_flight(&self, ticket: Option<u64>) -> Option<(u64, AbortHandle)> {
        let mut guard = self.in_flight.lock().ok()?;
        match (ticket, guard.as_ref()) {
            (Some(ticket), Some((current, _))) if *current != ticket => None,
            _ => guard.take(),
        }
    }
}
