//! Safety report data: per-dimension scores, thresholds and issues.

use serde::{Deserialize, Serialize};

/// Measured values for each safety dimension.
///
/// `factuality` is a consistency value (higher is better); toxicity and
/// bias are scores (lower is better).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyScores {
    pub toxicity: f64,
    pub bias: f64,
    pub factuality: f64,
}

/// Configured limits for each safety dimension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyThresholds {
    /// Maximum tolerated toxicity score (default: 0.2)
    #[serde(default = "default_toxicity")]
    pub toxicity: f64,

    /// Maximum tolerated bias score (default: 0.3)
    #[serde(default = "default_bias")]
    pub bias: f64,

    /// Minimum required factual consistency (default: 0.6)
    #[serde(default = "default_factuality")]
    pub factuality: f64,
}

fn default_toxicity() -> f64 {
    0.2
}
fn default_bias() -> f64 {
    0.3
}
fn default_factuality() -> f64 {
    0.6
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            toxicity: default_toxicity(),
            bias: default_bias(),
            factuality: default_factuality(),
        }
    }
}

/// One policy violation found in an analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SafetyIssue {
    Toxicity {
        score: f64,
        threshold: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    Bias {
        score: f64,
        threshold: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dimension: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    Factuality {
        consistency: f64,
        threshold: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        missing_evidence: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl SafetyIssue {
    /// Dimension name ("toxicity", "bias" or "factuality")
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Toxicity { .. } => "toxicity",
            Self::Bias { .. } => "bias",
            Self::Factuality { .. } => "factuality",
        }
    }
}

/// Outcome of evaluating one analysis. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyReport {
    /// True iff no dimension is violated
    pub ok: bool,

    /// Violations in fixed dimension order (toxicity, bias, factuality)
    pub issues: Vec<SafetyIssue>,

    /// Human-readable notes
    pub notes: Vec<String>,

    pub scores: SafetyScores,

    pub thresholds: SafetyThresholds,
}

impl SafetyReport {
    /// Find the issue for a dimension, if that dimension was violated
    pub fn issue(&self, kind: &str) -> Option<&SafetyIssue> {
        self.issues.iter().find(|issue| issue.kind() == kind)
    }
}
