//! plangate - Event-sourced orchestrator for AI-generated deployment plans
//!
//! Streams an AI analysis of a proposed change, gates it through safety
//! scoring and an approval policy, and executes the approved plan step by
//! step.
//!
//! # Architecture
//!
//! The system is built around a pure reducer:
//! - All state changes are actions applied by a single store task
//! - Every action is appended to a per-session journal
//! - Current state is derived by replaying the journal through the reducer
//!
//! # Modules
//!
//! - `adapters`: Analysis providers and step runners (scripted, subprocess)
//! - `core`: Reducer, store, safety, policy, generator, executor, journal
//! - `domain`: Data structures (Analysis, SafetyReport, state, actions)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Replay a scripted session
//! plangate simulate scenarios/migration.yaml --approve
//!
//! # Generate and run a real plan
//! git diff | plangate plan
//!
//! # Approve a plan that stopped for review
//! plangate approve <session-id>
//!
//! # Inspect a session
//! plangate status <session-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{reduce, Orchestrator, OrchestratorSettings, PlanStore};
pub use crate::domain::{DeploymentPlanAction, DeploymentPlanState, PlanStatus};
