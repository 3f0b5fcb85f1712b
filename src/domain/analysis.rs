//! The AI-generated analysis of a proposed change.

use serde::{Deserialize, Serialize};

/// Finalized analysis produced once per generation cycle.
///
/// `explanations` is streamed incrementally while the plan is generating;
/// once the analysis is finalized it is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Model that produced the analysis
    pub model: String,

    /// Ordered action identifiers (one deployment step per action)
    #[serde(default)]
    pub actions: Vec<String>,

    /// Free-text explanation of the proposed change
    #[serde(default)]
    pub explanations: String,

    /// Model confidence in [0, 1]
    pub confidence: f64,
}

impl Analysis {
    /// Create an analysis with the given model, actions and confidence
    pub fn new(model: impl Into<String>, actions: Vec<String>, confidence: f64) -> Self {
        Self {
            model: model.into(),
            actions,
            explanations: String::new(),
            confidence,
        }
    }

    /// Attach explanation text
    pub fn with_explanations(mut self, explanations: impl Into<String>) -> Self {
        self.explanations = explanations.into();
        self
    }

    /// Whether the confidence is a finite value in [0, 1]
    pub fn has_valid_confidence(&self) -> bool {
        self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence)
    }
}

/// Explanation text accumulated while a plan is generating
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialAnalysis {
    pub explanations: String,
}
