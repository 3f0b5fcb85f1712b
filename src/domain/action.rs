//! Actions accepted by the plan reducer.
//!
//! Every collaborator (generation provider, step runner, UI) changes plan
//! state only by dispatching one of these.

use serde::{Deserialize, Serialize};

use super::analysis::Analysis;
use super::report::SafetyReport;
use super::step::{DeploymentStep, StepStatus};

/// The policy gate's verdict delivered with a generated plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub requires_approval: bool,
    pub notes: Vec<String>,
    pub safety_report: SafetyReport,
}

/// The exhaustive set of events the reducer accepts.
///
/// Serialized as `{"type": "UPDATE_STEP", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentPlanAction {
    GeneratePlanStart,

    GeneratePlanStream {
        explanations_chunk: String,
    },

    GeneratePlanSuccess {
        analysis: Analysis,
        steps: Vec<DeploymentStep>,
        policy_result: PolicyResult,
    },

    GeneratePlanFailure {
        error: String,
    },

    ApproveAndExecute,

    SetCurrentStep {
        step_index: usize,
    },

    UpdateStep {
        step_index: usize,
        new_status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },

    ExecutionFailure {
        error: String,
    },

    CompleteExecution,

    Reset,
}

impl DeploymentPlanAction {
    /// Wire name of the action type
    pub fn name(&self) -> &'static str {
        match self {
            Self::GeneratePlanStart => "GENERATE_PLAN_START",
            Self::GeneratePlanStream { .. } => "GENERATE_PLAN_STREAM",
            Self::GeneratePlanSuccess { .. } => "GENERATE_PLAN_SUCCESS",
            Self::GeneratePlanFailure { .. } => "GENERATE_PLAN_FAILURE",
            Self::ApproveAndExecute => "APPROVE_AND_EXECUTE",
            Self::SetCurrentStep { .. } => "SET_CURRENT_STEP",
            Self::UpdateStep { .. } => "UPDATE_STEP",
            Self::ExecutionFailure { .. } => "EXECUTION_FAILURE",
            Self::CompleteExecution => "COMPLETE_EXECUTION",
            Self::Reset => "RESET",
        }
    }

    /// Shorthand for a stream chunk action
    pub fn stream(chunk: impl Into<String>) -> Self {
        Self::GeneratePlanStream {
            explanations_chunk: chunk.into(),
        }
    }

    /// Shorthand for a step status update
    pub fn update_step(step_index: usize, new_status: StepStatus, duration: Option<u64>) -> Self {
        Self::UpdateStep {
            step_index,
            new_status,
            duration,
        }
    }
}
