//! Journal entries for the event-sourced action log.
//!
//! Every action the store receives is recorded, in order, whether or not it
//! changed the state. Replaying the actions through the reducer reproduces
//! the session's state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::action::DeploymentPlanAction;
use super::state::PlanStatus;

/// A single entry in the append-only action journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique identifier for this entry
    pub id: Uuid,

    /// When the action was applied (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The orchestrator session this entry belongs to
    pub session_id: Uuid,

    /// Position of the action in dispatch order (starting at 1)
    pub sequence: u64,

    /// The dispatched action
    pub action: DeploymentPlanAction,

    /// Status after the action was reduced
    pub status_after: PlanStatus,

    /// False when the reducer ignored the action
    pub applied: bool,

    /// Digest of the finalized plan (recorded on GENERATE_PLAN_SUCCESS)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_digest: Option<String>,
}

impl JournalEntry {
    /// Create a new entry with the current timestamp
    pub fn new(
        session_id: Uuid,
        sequence: u64,
        action: DeploymentPlanAction,
        status_after: PlanStatus,
        applied: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id,
            sequence,
            action,
            status_after,
            applied,
            plan_digest: None,
        }
    }

    /// Attach the digest of the finalized plan
    pub fn with_plan_digest(mut self, digest: String) -> Self {
        self.plan_digest = Some(digest);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serialization() {
        let entry = JournalEntry::new(
            Uuid::new_v4(),
            3,
            DeploymentPlanAction::stream("risk..."),
            PlanStatus::Generating,
            true,
        );

        let json = serde_json::to_string(&entry).unwrap();
        let parsed: JournalEntry = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.sequence, 3);
        assert_eq!(parsed.status_after, PlanStatus::Generating);
        assert_eq!(parsed.action, DeploymentPlanAction::stream("risk..."));
        assert!(parsed.plan_digest.is_none());
        assert!(!json.contains("plan_digest"));
    }

    #[test]
    fn test_entry_with_digest() {
        let entry = JournalEntry::new(
            Uuid::new_v4(),
            1,
            DeploymentPlanAction::Reset,
            PlanStatus::Idle,
            false,
        )
        .with_plan_digest("abcd".to_string());

        assert_eq!(entry.plan_digest, Some("abcd".to_string()));
    }
}
