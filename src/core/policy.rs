//! Policy gate deciding whether a generated plan needs human approval.
//!
//! Rules are evaluated in a fixed order and each triggered rule adds one
//! note:
//! 1. The safety report is not ok
//! 2. Model confidence is below the auto-approval floor
//! 3. An action matches a high-risk pattern (destructive or irreversible)

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::domain::{Analysis, PolicyResult, SafetyReport};

/// Policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Minimum confidence for a plan to skip human review (default: 0.8)
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,

    /// Glob patterns for destructive or irreversible actions
    #[serde(default = "default_high_risk_actions")]
    pub high_risk_actions: Vec<String>,

    /// Approve automatically when no rule triggers (default: false)
    #[serde(default)]
    pub auto_approve: bool,
}

fn default_confidence_floor() -> f64 {
    0.8
}

fn default_high_risk_actions() -> Vec<String> {
    vec![
        "*drop*".to_string(),
        "*delete*".to_string(),
        "*destroy*".to_string(),
        "*truncate*".to_string(),
        "*purge*".to_string(),
        "*wipe*".to_string(),
        "*force*push*".to_string(),
    ]
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            confidence_floor: default_confidence_floor(),
            high_risk_actions: default_high_risk_actions(),
            auto_approve: false,
        }
    }
}

impl PolicyConfig {
    /// Check if an action matches any high-risk pattern (case-insensitive)
    pub fn is_high_risk(&self, action: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::new()
        };

        for pattern_str in &self.high_risk_actions {
            if let Ok(pattern) = Pattern::new(pattern_str) {
                if pattern.matches_with(action, options) {
                    return true;
                }
            }
        }
        false
    }
}

/// The gate's verdict for one analysis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub requires_approval: bool,

    /// One note per triggered rule, in rule order
    pub notes: Vec<String>,
}

impl PolicyDecision {
    /// Bundle the decision with the report it was made from
    pub fn into_result(self, safety_report: SafetyReport) -> PolicyResult {
        PolicyResult {
            requires_approval: self.requires_approval,
            notes: self.notes,
            safety_report,
        }
    }
}

/// Deterministic approval gate
#[derive(Debug, Clone, Default)]
pub struct PolicyGate {
    config: PolicyConfig,
}

impl PolicyGate {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Decide whether the plan may proceed without human approval
    pub fn decide(&self, analysis: &Analysis, report: &SafetyReport) -> PolicyDecision {
        let mut notes = Vec::new();

        if !report.ok {
            let kinds: Vec<&str> = report.issues.iter().map(|i| i.kind()).collect();
            notes.push(if kinds.is_empty() {
                "safety report did not pass".to_string()
            } else {
                format!("safety report flagged: {}", kinds.join(", "))
            });
        }

        // NaN confidence never clears the floor
        if analysis.confidence.is_nan() || analysis.confidence < self.config.confidence_floor {
            notes.push(format!(
                "confidence {:.2} is below the auto-approval floor {:.2}",
                analysis.confidence, self.config.confidence_floor
            ));
        }

        let risky: Vec<&str> = analysis
            .actions
            .iter()
            .filter(|a| self.config.is_high_risk(a))
            .map(String::as_str)
            .collect();
        if !risky.is_empty() {
            notes.push(format!("high-risk actions: {}", risky.join(", ")));
        }

        PolicyDecision {
            requires_approval: !notes.is_empty(),
            notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SafetyIssue, SafetyScores, SafetyThresholds};

    fn report(ok: bool) -> SafetyReport {
        SafetyReport {
            ok,
            issues: if ok {
                vec![]
            } else {
                vec![SafetyIssue::Toxicity {
                    score: 0.6,
                    threshold: 0.5,
                    details: None,
                }]
            },
            notes: vec![],
            scores: SafetyScores::default(),
            thresholds: SafetyThresholds::default(),
        }
    }

    fn analysis(actions: &[&str], confidence: f64) -> Analysis {
        Analysis::new("gpt", actions.iter().map(|a| a.to_string()).collect(), confidence)
    }

    #[test]
    fn test_no_rule_triggered() {
        let gate = PolicyGate::default();
        let decision = gate.decide(&analysis(&["build", "deploy"], 0.95), &report(true));

        assert!(!decision.requires_approval);
        assert!(decision.notes.is_empty());
    }

    #[test]
    fn test_rules_in_order() {
        let gate = PolicyGate::default();
        let decision = gate.decide(&analysis(&["drop_table"], 0.4), &report(false));

        assert!(decision.requires_approval);
        assert_eq!(decision.notes.len(), 3);
        assert!(decision.notes[0].contains("toxicity"));
        assert!(decision.notes[1].contains("confidence"));
        assert!(decision.notes[2].contains("drop_table"));
    }

    #[test]
    fn test_low_confidence_alone() {
        let gate = PolicyGate::default();
        let decision = gate.decide(&analysis(&["deploy"], 0.79), &report(true));

        assert!(decision.requires_approval);
        assert_eq!(decision.notes.len(), 1);
    }

    #[test]
    fn test_nan_confidence_requires_approval() {
        let gate = PolicyGate::default();
        let decision = gate.decide(&analysis(&["deploy"], f64::NAN), &report(true));
        assert!(decision.requires_approval);
    }

    #[test]
    fn test_high_risk_matching() {
        let config = PolicyConfig::default();

        assert!(config.is_high_risk("drop_users_table"));
        assert!(config.is_high_risk("DELETE_BUCKET"));
        assert!(config.is_high_risk("git_force_push"));
        assert!(!config.is_high_risk("deploy_canary"));
        assert!(!config.is_high_risk("run_tests"));
    }

    #[test]
    fn test_custom_patterns_replace_defaults() {
        let config = PolicyConfig {
            high_risk_actions: vec!["rotate_*".to_string()],
            ..Default::default()
        };

        assert!(config.is_high_risk("rotate_keys"));
        assert!(!config.is_high_risk("drop_table"));
    }

    #[test]
    fn test_into_result_keeps_report() {
        let decision = PolicyDecision {
            requires_approval: true,
            notes: vec!["n".to_string()],
        };
        let result = decision.into_result(report(false));

        assert!(result.requires_approval);
        assert!(!result.safety_report.ok);
    }
}
