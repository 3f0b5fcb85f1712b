//! Deployment steps and their forward-only status lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a deployment step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed (with error)
    Failed,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl StepStatus {
    /// Completed and failed are terminal for a step
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether a step may move from `self` to `next` without regressing
    pub fn can_advance_to(self, next: StepStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single step in a deployment plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStep {
    /// Step identifier (unique within the plan)
    pub id: String,

    /// Human-readable title
    pub title: String,

    /// Current status
    #[serde(default)]
    pub status: StepStatus,

    /// Elapsed time in milliseconds, set once the step completes or fails
    #[serde(
        rename = "duration_ms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<u64>,
}

impl DeploymentStep {
    /// Create a pending step
    pub fn pending(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: StepStatus::Pending,
            duration: None,
        }
    }

    /// Materialize one pending step per action, preserving order.
    ///
    /// Ids are `step-<n>` (1-based); titles are derived from the action
    /// identifier.
    pub fn from_actions(actions: &[String]) -> Vec<Self> {
        actions
            .iter()
            .enumerate()
            .map(|(i, action)| Self::pending(format!("step-{}", i + 1), title_for_action(action)))
            .collect()
    }

    /// Move the step forward to `status`.
    ///
    /// Returns false (and leaves the step untouched) when the move would
    /// regress or repeat the current status. `duration` is only recorded
    /// when the new status is terminal.
    pub fn advance(&mut self, status: StepStatus, duration: Option<u64>) -> bool {
        if !self.status.can_advance_to(status) {
            return false;
        }

        self.status = status;
        if status.is_terminal() {
            self.duration = duration;
        }
        true
    }
}

/// Turn an action identifier like `migrate_db` into a title ("Migrate db")
pub fn title_for_action(action: &str) -> String {
    let words: Vec<&str> = action
        .split(|c: char| c == '_' || c == '-' || c == '.' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .collect();

    let joined = words.join(" ");
    let mut chars = joined.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => action.to_string(),
    }
}
