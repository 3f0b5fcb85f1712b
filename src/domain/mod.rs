//! Domain types for the plan orchestrator.
//!
//! This module contains the core data structures:
//! - Analysis: The AI-generated change analysis
//! - Report: Safety scores, thresholds and issues
//! - Step: Deployment steps and their status
//! - State: The plan state union
//! - Action: Events accepted by the reducer
//! - Journal: Entries of the persisted action log

pub mod action;
pub mod analysis;
pub mod journal;
pub mod report;
pub mod state;
pub mod step;

// Re-export commonly used types
pub use action::{DeploymentPlanAction, PolicyResult};
pub use analysis::{Analysis, PartialAnalysis};
pub use journal::JournalEntry;
pub use report::{SafetyIssue, SafetyReport, SafetyScores, SafetyThresholds};
pub use state::{DeploymentPlanState, Plan, PlanStatus};
pub use step::{DeploymentStep, StepStatus};
