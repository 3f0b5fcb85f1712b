//! Core orchestration logic.
//!
//! This module contains:
//! - Reducer: The pure plan state machine
//! - Store: Single-writer store task and dispatcher handle
//! - Safety: Safety scoring and reports
//! - Policy: The approval gate
//! - Generator: Streaming plan generation
//! - Executor: Step-by-step plan execution
//! - Journal: Append-only action log
//! - Scenario: Scripted sessions for simulation
//! - Orchestrator: Session coordination

pub mod executor;
pub mod generator;
pub mod journal;
pub mod orchestrator;
pub mod policy;
pub mod reducer;
pub mod safety;
pub mod scenario;
pub mod store;

// Re-export commonly used types
pub use executor::{RetryPolicy, StepExecutor};
pub use generator::PlanGenerator;
pub use journal::{plan_digest, Journal};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use policy::{PolicyConfig, PolicyDecision, PolicyGate};
pub use reducer::{reduce, transition, Transition};
pub use safety::{
    assess, LexiconScorer, Measurement, SafetyEvaluator, SafetyScorer, SafetySettings,
};
pub use scenario::Scenario;
pub use store::{spawn, Applied, DispatchError, Dispatcher, PlanStore};
