//! The canonical deployment plan state.
//!
//! `DeploymentPlanState` is a sum type: each status carries exactly the
//! fields that are meaningful in it, so a `running` plan without steps or an
//! `idle` plan with an error cannot be represented.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::analysis::{Analysis, PartialAnalysis};
use super::report::SafetyReport;
use super::step::DeploymentStep;

/// A finalized plan: the analysis, its ordered steps and the safety report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub analysis: Analysis,
    pub steps: Vec<DeploymentStep>,
    pub safety_report: SafetyReport,
}

/// State of the deployment plan orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeploymentPlanState {
    /// Nothing generated yet (or reset)
    Idle,

    /// Analysis is streaming in
    Generating {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_analysis: Option<PartialAnalysis>,
    },

    /// Generation failed
    Failed { error: String },

    /// Plan generated and gated; waiting for an explicit approval
    AwaitingApproval {
        #[serde(flatten)]
        plan: Plan,
        policy_notes: Vec<String>,
        requires_approval: bool,
    },

    /// Steps are executing
    Running {
        #[serde(flatten)]
        plan: Plan,
        current_step_index: usize,
    },

    /// A step failed; remaining steps were not attempted
    ExecutionFailed {
        #[serde(flatten)]
        plan: Plan,
        current_step_index: usize,
        error: String,
    },

    /// Every step completed
    Completed {
        #[serde(flatten)]
        plan: Plan,
        current_step_index: usize,
    },
}

impl Default for DeploymentPlanState {
    fn default() -> Self {
        Self::Idle
    }
}

impl DeploymentPlanState {
    /// The status tag of this state
    pub fn status(&self) -> PlanStatus {
        match self {
            Self::Idle => PlanStatus::Idle,
            Self::Generating { .. } => PlanStatus::Generating,
            Self::Failed { .. } => PlanStatus::Failed,
            Self::AwaitingApproval { .. } => PlanStatus::AwaitingApproval,
            Self::Running { .. } => PlanStatus::Running,
            Self::ExecutionFailed { .. } => PlanStatus::ExecutionFailed,
            Self::Completed { .. } => PlanStatus::Completed,
        }
    }

    /// The finalized plan, once generation has succeeded
    pub fn plan(&self) -> Option<&Plan> {
        match self {
            Self::AwaitingApproval { plan, .. }
            | Self::Running { plan, .. }
            | Self::ExecutionFailed { plan, .. }
            | Self::Completed { plan, .. } => Some(plan),
            Self::Idle | Self::Generating { .. } | Self::Failed { .. } => None,
        }
    }

    /// Steps of the finalized plan (empty before generation succeeds)
    pub fn steps(&self) -> &[DeploymentStep] {
        self.plan().map(|p| p.steps.as_slice()).unwrap_or(&[])
    }

    pub fn current_step_index(&self) -> Option<usize> {
        match self {
            Self::Running {
                current_step_index, ..
            }
            | Self::ExecutionFailed {
                current_step_index, ..
            }
            | Self::Completed {
                current_step_index, ..
            } => Some(*current_step_index),
            _ => None,
        }
    }

    /// Error message for `failed` and `execution_failed`
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error } | Self::ExecutionFailed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Explanation text streamed so far while generating
    pub fn partial_explanations(&self) -> Option<&str> {
        match self {
            Self::Generating {
                partial_analysis: Some(partial),
            } => Some(&partial.explanations),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Terminal states accept only `GENERATE_PLAN_START` or `RESET`
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Status tag of a [`DeploymentPlanState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Idle,
    Generating,
    Failed,
    AwaitingApproval,
    Running,
    ExecutionFailed,
    Completed,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Generating => "generating",
            Self::Failed => "failed",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Running => "running",
            Self::ExecutionFailed => "execution_failed",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::ExecutionFailed | Self::Completed)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
