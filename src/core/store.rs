//! Single-writer plan store.
//!
//! `PlanStore` owns the canonical state and applies actions through the
//! reducer. When spawned, it runs as one tokio task fed by an unbounded
//! channel: collaborators hold a cloneable [`Dispatcher`], actions are
//! applied strictly in the order they are received, and every new state is
//! published on a `watch` channel for observers.
//!
//! Each plan lives in one epoch. The epoch advances whenever a
//! `GENERATE_PLAN_START` or `RESET` is applied, so a task that captured the
//! epoch of the plan it works on can dispatch with [`Dispatcher::apply_in`]
//! and have its actions dropped once that plan is gone.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use crate::domain::{DeploymentPlanAction, DeploymentPlanState, JournalEntry, PlanStatus};

use super::journal::{plan_digest, Journal};
use super::reducer::transition;

/// Record of one dispatched action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// Position in dispatch order (starting at 1)
    pub sequence: u64,

    /// False when the reducer ignored the action
    pub applied: bool,

    pub status_after: PlanStatus,
}

/// Owns the plan state. All mutation goes through [`PlanStore::dispatch`].
#[derive(Debug, Clone, Default)]
pub struct PlanStore {
    state: DeploymentPlanState,
    sequence: u64,
    epoch: u64,
}

impl PlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a state rebuilt elsewhere (e.g. from a journal) after
    /// `sequence` actions
    pub fn from_state(state: DeploymentPlanState, sequence: u64) -> Self {
        Self {
            state,
            sequence,
            epoch: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> &DeploymentPlanState {
        &self.state
    }

    /// Number of actions dispatched so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Epoch of the current plan
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Apply one action
    pub fn dispatch(&mut self, action: DeploymentPlanAction) -> Applied {
        let name = action.name();
        let from = self.state.status();
        let opens_epoch = matches!(
            action,
            DeploymentPlanAction::GeneratePlanStart | DeploymentPlanAction::Reset
        );

        let outcome = transition(std::mem::take(&mut self.state), action);
        self.state = outcome.state;
        self.sequence += 1;
        if outcome.applied && opens_epoch {
            self.epoch += 1;
        }

        let status_after = self.state.status();
        if outcome.applied {
            debug!(action = name, %from, to = %status_after, "Action applied");
        } else {
            debug!(action = name, status = %from, "Action ignored");
        }

        Applied {
            sequence: self.sequence,
            applied: outcome.applied,
            status_after,
        }
    }

    /// Consume the store, returning the final state
    pub fn into_state(self) -> DeploymentPlanState {
        self.state
    }

    fn ack(&self, dispatched: bool) -> Ack {
        Ack {
            epoch: self.epoch,
            state: self.state.clone(),
            dispatched,
        }
    }
}

/// Errors from talking to a spawned store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Plan store is no longer running")]
    StoreClosed,

    /// The journal rejected an action. The action was not applied and the
    /// store refuses every later action.
    #[error("Failed to journal action #{sequence}: {reason}")]
    Journal { sequence: u64, reason: String },
}

enum Request {
    Dispatch {
        action: DeploymentPlanAction,
        /// Only dispatch while the store is still in this epoch
        epoch: Option<u64>,
    },
    Read,
}

struct Ack {
    epoch: u64,
    state: DeploymentPlanState,
    dispatched: bool,
}

struct Command {
    request: Request,
    ack: Option<oneshot::Sender<Result<Ack, DispatchError>>>,
}

/// Cloneable handle for dispatching actions to a spawned store
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<DeploymentPlanState>,
}

impl Dispatcher {
    /// Queue an action without waiting for it to be applied
    pub fn dispatch(&self, action: DeploymentPlanAction) -> Result<(), DispatchError> {
        self.tx
            .send(Command {
                request: Request::Dispatch {
                    action,
                    epoch: None,
                },
                ack: None,
            })
            .map_err(|_| DispatchError::StoreClosed)
    }

    /// Queue an action and wait until it has been applied, returning the
    /// resulting state
    pub async fn apply(
        &self,
        action: DeploymentPlanAction,
    ) -> Result<DeploymentPlanState, DispatchError> {
        Ok(self.apply_tracked(action).await?.1)
    }

    /// Like [`Dispatcher::apply`], also returning the epoch after the action
    pub async fn apply_tracked(
        &self,
        action: DeploymentPlanAction,
    ) -> Result<(u64, DeploymentPlanState), DispatchError> {
        let ack = self
            .request(Request::Dispatch {
                action,
                epoch: None,
            })
            .await?;
        Ok((ack.epoch, ack.state))
    }

    /// Apply an action only if the store is still in `epoch`.
    ///
    /// Returns `None` without dispatching (or journaling) anything once the
    /// plan of that epoch has been reset or replaced.
    pub async fn apply_in(
        &self,
        epoch: u64,
        action: DeploymentPlanAction,
    ) -> Result<Option<DeploymentPlanState>, DispatchError> {
        let ack = self
            .request(Request::Dispatch {
                action,
                epoch: Some(epoch),
            })
            .await?;
        Ok(ack.dispatched.then_some(ack.state))
    }

    /// Current epoch and state, read in order with queued actions
    pub async fn current(&self) -> Result<(u64, DeploymentPlanState), DispatchError> {
        let ack = self.request(Request::Read).await?;
        Ok((ack.epoch, ack.state))
    }

    /// Read-only snapshot of the latest published state
    pub fn snapshot(&self) -> DeploymentPlanState {
        self.snapshots.borrow().clone()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<DeploymentPlanState> {
        self.snapshots.clone()
    }

    async fn request(&self, request: Request) -> Result<Ack, DispatchError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command {
                request,
                ack: Some(ack_tx),
            })
            .map_err(|_| DispatchError::StoreClosed)?;

        ack_rx.await.map_err(|_| DispatchError::StoreClosed)?
    }
}

/// Spawn the store loop.
///
/// The task ends once every [`Dispatcher`] has been dropped and returns the
/// store with its final state. When a journal is given, each action is
/// appended to it after being reduced and only takes effect once written.
/// After a failed write the store answers every request with the
/// [`DispatchError::Journal`] error, so the journal never falls behind the
/// live state.
pub fn spawn(
    store: PlanStore,
    journal: Option<Journal>,
) -> (Dispatcher, JoinHandle<PlanStore>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
    let (snapshot_tx, snapshot_rx) = watch::channel(store.state().clone());

    let handle = tokio::spawn(async move {
        let mut store = store;
        let mut broken: Option<DispatchError> = None;

        while let Some(Command { request, ack }) = rx.recv().await {
            let reply = if let Some(e) = &broken {
                Err(e.clone())
            } else {
                match request {
                    Request::Read => Ok(store.ack(false)),
                    Request::Dispatch { action, epoch }
                        if epoch.is_some_and(|e| e != store.epoch()) =>
                    {
                        debug!(action = action.name(), "Dropped action from a replaced plan");
                        Ok(store.ack(false))
                    }
                    Request::Dispatch { action, .. } => {
                        match commit(&mut store, action, journal.as_ref()).await {
                            Ok(()) => {
                                // Publish even when ignored so observers see a consistent sequence
                                snapshot_tx.send_replace(store.state().clone());
                                Ok(store.ack(true))
                            }
                            Err(e) => {
                                error!(error = %e, "Journal write failed, refusing further actions");
                                broken = Some(e.clone());
                                Err(e)
                            }
                        }
                    }
                }
            };

            if let Some(ack) = ack {
                let _ = ack.send(reply);
            }
        }

        store
    });

    (
        Dispatcher {
            tx,
            snapshots: snapshot_rx,
        },
        handle,
    )
}

/// Reduce one action and journal it. On a failed write the store is left
/// exactly as it was.
async fn commit(
    store: &mut PlanStore,
    action: DeploymentPlanAction,
    journal: Option<&Journal>,
) -> Result<(), DispatchError> {
    let Some(journal) = journal else {
        store.dispatch(action);
        return Ok(());
    };

    let previous = store.clone();
    let applied = store.dispatch(action.clone());
    let entry = journal_entry(journal.session_id(), &applied, action, store.state());

    if let Err(e) = journal.append(&entry).await {
        *store = previous;
        return Err(DispatchError::Journal {
            sequence: applied.sequence,
            reason: format!("{:#}", e),
        });
    }

    Ok(())
}

fn journal_entry(
    session_id: Uuid,
    applied: &Applied,
    action: DeploymentPlanAction,
    state: &DeploymentPlanState,
) -> JournalEntry {
    let is_success = matches!(action, DeploymentPlanAction::GeneratePlanSuccess { .. });
    let entry = JournalEntry::new(
        session_id,
        applied.sequence,
        action,
        applied.status_after,
        applied.applied,
    );

    match state.plan() {
        Some(plan) if is_success && applied.applied => {
            entry.with_plan_digest(plan_digest(&plan.analysis, &plan.steps))
        }
        _ => entry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_sequence_counts_ignored_actions() {
        let mut store = PlanStore::new();

        let first = store.dispatch(DeploymentPlanAction::ApproveAndExecute);
        assert!(!first.applied);
        assert_eq!(first.sequence, 1);
        assert_eq!(first.status_after, PlanStatus::Idle);

        let second = store.dispatch(DeploymentPlanAction::GeneratePlanStart);
        assert!(second.applied);
        assert_eq!(second.sequence, 2);
        assert_eq!(store.state().status(), PlanStatus::Generating);
    }

    #[test]
    fn test_epoch_advances_on_start_and_reset() {
        let mut store = PlanStore::new();
        assert_eq!(store.epoch(), 0);

        store.dispatch(DeploymentPlanAction::GeneratePlanStart);
        assert_eq!(store.epoch(), 1);

        // Ignored start keeps the epoch
        store.dispatch(DeploymentPlanAction::GeneratePlanStart);
        store.dispatch(DeploymentPlanAction::stream("x"));
        assert_eq!(store.epoch(), 1);

        store.dispatch(DeploymentPlanAction::Reset);
        assert_eq!(store.epoch(), 2);
    }

    #[test]
    fn test_from_state_continues_sequence() {
        let mut store = PlanStore::from_state(DeploymentPlanState::Idle, 41);

        let applied = store.dispatch(DeploymentPlanAction::GeneratePlanStart);
        assert_eq!(applied.sequence, 42);
    }

    #[tokio::test]
    async fn test_spawned_store_applies_in_order() {
        let (dispatcher, handle) = spawn(PlanStore::new(), None);

        dispatcher.dispatch(DeploymentPlanAction::GeneratePlanStart).unwrap();
        dispatcher.dispatch(DeploymentPlanAction::stream("Analyzing ")).unwrap();
        let state = dispatcher
            .apply(DeploymentPlanAction::stream("risk..."))
            .await
            .unwrap();

        assert_eq!(state.partial_explanations(), Some("Analyzing risk..."));
        assert_eq!(dispatcher.snapshot(), state);

        drop(dispatcher);
        let store = handle.await.unwrap();
        assert_eq!(store.sequence(), 3);
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let (dispatcher, _handle) = spawn(PlanStore::new(), None);
        let mut rx = dispatcher.subscribe();

        dispatcher.dispatch(DeploymentPlanAction::GeneratePlanStart).unwrap();
        rx.changed().await.unwrap();

        assert_eq!(rx.borrow().status(), PlanStatus::Generating);
    }

    #[tokio::test]
    async fn test_actions_from_an_old_epoch_are_dropped() {
        let (dispatcher, handle) = spawn(PlanStore::new(), None);

        let (epoch, _) = dispatcher
            .apply_tracked(DeploymentPlanAction::GeneratePlanStart)
            .await
            .unwrap();
        let streamed = dispatcher
            .apply_in(epoch, DeploymentPlanAction::stream("first"))
            .await
            .unwrap();
        assert_eq!(streamed.unwrap().partial_explanations(), Some("first"));

        dispatcher.apply(DeploymentPlanAction::Reset).await.unwrap();
        dispatcher.apply(DeploymentPlanAction::GeneratePlanStart).await.unwrap();

        let stale = dispatcher
            .apply_in(epoch, DeploymentPlanAction::stream("late"))
            .await
            .unwrap();
        assert!(stale.is_none());

        let (current, state) = dispatcher.current().await.unwrap();
        assert_eq!(current, epoch + 2);
        assert_eq!(state.status(), PlanStatus::Generating);
        assert_eq!(state.partial_explanations(), None);

        drop(dispatcher);
        // The dropped chunk never reached the store
        assert_eq!(handle.await.unwrap().sequence(), 4);
    }

    #[tokio::test]
    async fn test_spawned_store_journals_actions() {
        let temp_dir = TempDir::new().unwrap();
        let journal = Journal::open_in(temp_dir.path(), Uuid::new_v4())
            .await
            .unwrap();
        let (dispatcher, handle) = spawn(PlanStore::new(), Some(journal.clone()));

        dispatcher.apply(DeploymentPlanAction::GeneratePlanStart).await.unwrap();
        dispatcher.apply(DeploymentPlanAction::GeneratePlanStart).await.unwrap();
        drop(dispatcher);
        handle.await.unwrap();

        let entries = journal.replay().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].applied);
        assert!(!entries[1].applied);
        assert_eq!(entries[1].status_after, PlanStatus::Generating);
    }

    #[tokio::test]
    async fn test_journal_failure_rejects_the_action() {
        let temp_dir = TempDir::new().unwrap();
        let journal = Journal::open_in(temp_dir.path(), Uuid::new_v4())
            .await
            .unwrap();
        // A directory where the log file should be makes every append fail
        std::fs::create_dir_all(journal.actions_path()).unwrap();

        let (dispatcher, handle) = spawn(PlanStore::new(), Some(journal));

        let err = dispatcher
            .apply(DeploymentPlanAction::GeneratePlanStart)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Journal { sequence: 1, .. }));
        assert_eq!(dispatcher.snapshot(), DeploymentPlanState::Idle);

        // The store stays refused after the first failure
        let again = dispatcher.apply(DeploymentPlanAction::Reset).await.unwrap_err();
        assert_eq!(again, err);
        assert!(dispatcher.current().await.is_err());

        drop(dispatcher);
        let store = handle.await.unwrap();
        assert_eq!(store.sequence(), 0);
        assert_eq!(store.into_state(), DeploymentPlanState::Idle);
    }
}
