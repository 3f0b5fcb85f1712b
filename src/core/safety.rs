//! Safety evaluation for generated analyses.
//!
//! Scores an analysis on three dimensions and compares each score against
//! its configured threshold:
//! - Toxicity (violation when score > threshold)
//! - Bias (violation when score > threshold)
//! - Factuality (violation when consistency < threshold)
//!
//! Evaluation never fails. Missing evidence is annotated on the report.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::domain::{Analysis, SafetyIssue, SafetyReport, SafetyScores, SafetyThresholds};

/// Safety configuration: thresholds plus the lexicons used for scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetySettings {
    #[serde(flatten)]
    pub thresholds: SafetyThresholds,

    /// Words counted as toxic when they appear in the explanations
    #[serde(default = "default_toxic_terms")]
    pub toxic_terms: Vec<String>,

    /// Bias dimension name -> words indicating that dimension
    #[serde(default = "default_bias_lexicons")]
    pub bias_lexicons: BTreeMap<String, Vec<String>>,
}

fn default_toxic_terms() -> Vec<String> {
    ["idiot", "idiotic", "stupid", "moron", "garbage", "trash", "hate", "dumb", "incompetent"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_bias_lexicons() -> BTreeMap<String, Vec<String>> {
    let mut lexicons = BTreeMap::new();
    lexicons.insert(
        "gender".to_string(),
        ["he", "she", "him", "her", "his", "hers", "man", "woman", "men", "women", "guys"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    lexicons.insert(
        "age".to_string(),
        ["young", "old", "elderly", "boomer", "junior", "senior"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    lexicons
}

impl SafetySettings {
    /// Check that every threshold is a finite value in [0, 1]
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        for (name, value) in [
            ("toxicity", t.toxicity),
            ("bias", t.bias),
            ("factuality", t.factuality),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                anyhow::bail!("Safety threshold '{}' must be within [0, 1], got {}", name, value);
            }
        }
        Ok(())
    }
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            thresholds: SafetyThresholds::default(),
            toxic_terms: default_toxic_terms(),
            bias_lexicons: default_bias_lexicons(),
        }
    }
}

/// Raw measurements of an analysis, before thresholds are applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurement {
    pub scores: SafetyScores,

    /// The bias dimension that produced the bias score
    pub bias_dimension: Option<String>,

    /// Actions the explanations give no support for
    pub missing_evidence: Vec<String>,
}

/// Measures an analysis on each safety dimension
pub trait SafetyScorer: Send + Sync {
    fn measure(&self, analysis: &Analysis) -> Measurement;
}

/// Deterministic lexicon-based scorer.
///
/// - toxicity: share of explanation words found in the toxic lexicon
/// - bias: highest share of words from any single bias lexicon
/// - factuality: share of actions referenced in the explanations
#[derive(Debug, Clone)]
pub struct LexiconScorer {
    toxic_terms: Vec<String>,
    bias_lexicons: BTreeMap<String, Vec<String>>,
}

impl Default for LexiconScorer {
    fn default() -> Self {
        Self::from_settings(&SafetySettings::default())
    }
}

impl LexiconScorer {
    pub fn from_settings(settings: &SafetySettings) -> Self {
        Self {
            toxic_terms: lowercase_all(&settings.toxic_terms),
            bias_lexicons: settings
                .bias_lexicons
                .iter()
                .map(|(dimension, terms)| (dimension.clone(), lowercase_all(terms)))
                .collect(),
        }
    }

    fn share(words: &[String], lexicon: &[String]) -> f64 {
        if words.is_empty() {
            return 0.0;
        }
        let hits = words.iter().filter(|w| lexicon.contains(w)).count();
        hits as f64 / words.len() as f64
    }
}

impl SafetyScorer for LexiconScorer {
    fn measure(&self, analysis: &Analysis) -> Measurement {
        let words = tokenize(&analysis.explanations);

        let toxicity = Self::share(&words, &self.toxic_terms);

        // Ties keep the first dimension in lexicon order
        let mut bias = 0.0;
        let mut bias_dimension = None;
        for (dimension, lexicon) in &self.bias_lexicons {
            let score = Self::share(&words, lexicon);
            if score > bias {
                bias = score;
                bias_dimension = Some(dimension.clone());
            }
        }

        let text = normalize(&analysis.explanations);
        let missing_evidence: Vec<String> = analysis
            .actions
            .iter()
            .filter(|action| !is_referenced(&text, action))
            .cloned()
            .collect();

        let factuality = if analysis.actions.is_empty() {
            1.0
        } else {
            let referenced = analysis.actions.len() - missing_evidence.len();
            referenced as f64 / analysis.actions.len() as f64
        };

        Measurement {
            scores: SafetyScores {
                toxicity,
                bias,
                factuality,
            },
            bias_dimension,
            missing_evidence,
        }
    }
}

fn lowercase_all(terms: &[String]) -> Vec<String> {
    terms.iter().map(|t| t.to_lowercase()).collect()
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Lowercase and collapse separators so `migrate_db` matches "migrate db"
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_referenced(normalized_text: &str, action: &str) -> bool {
    let needle = normalize(action);
    if needle.is_empty() {
        return false;
    }
    format!(" {} ", normalized_text).contains(&format!(" {} ", needle))
}

/// Runs a scorer and applies thresholds
pub struct SafetyEvaluator {
    scorer: Box<dyn SafetyScorer>,
}

impl Default for SafetyEvaluator {
    fn default() -> Self {
        Self::new(LexiconScorer::default())
    }
}

impl SafetyEvaluator {
    pub fn new(scorer: impl SafetyScorer + 'static) -> Self {
        Self {
            scorer: Box::new(scorer),
        }
    }

    pub fn from_settings(settings: &SafetySettings) -> Self {
        Self::new(LexiconScorer::from_settings(settings))
    }

    /// Evaluate an analysis against thresholds
    pub fn evaluate(&self, analysis: &Analysis, thresholds: &SafetyThresholds) -> SafetyReport {
        assess(&self.scorer.measure(analysis), thresholds)
    }
}

/// Compare a measurement against thresholds and build the report.
///
/// Issues are emitted in the fixed order toxicity, bias, factuality. A
/// non-finite measured value counts as a violation and is recorded as the
/// worst value of its dimension (1.0 for scores, 0.0 for consistency), so
/// the report always serializes.
pub fn assess(measurement: &Measurement, thresholds: &SafetyThresholds) -> SafetyReport {
    let raw = measurement.scores;
    let scores = SafetyScores {
        toxicity: finite_or(raw.toxicity, 1.0),
        bias: finite_or(raw.bias, 1.0),
        factuality: finite_or(raw.factuality, 0.0),
    };
    let mut issues = Vec::new();
    let mut notes = Vec::new();

    if exceeds(raw.toxicity, thresholds.toxicity) {
        notes.push(format!(
            "toxicity score {:.2} exceeds threshold {:.2}",
            scores.toxicity, thresholds.toxicity
        ));
        issues.push(SafetyIssue::Toxicity {
            score: scores.toxicity,
            threshold: thresholds.toxicity,
            details: non_finite_details(raw.toxicity),
        });
    }

    if exceeds(raw.bias, thresholds.bias) {
        let dimension = measurement.bias_dimension.clone();
        notes.push(match &dimension {
            Some(d) => format!(
                "bias score {:.2} ({}) exceeds threshold {:.2}",
                scores.bias, d, thresholds.bias
            ),
            None => format!(
                "bias score {:.2} exceeds threshold {:.2}",
                scores.bias, thresholds.bias
            ),
        });
        issues.push(SafetyIssue::Bias {
            score: scores.bias,
            threshold: thresholds.bias,
            dimension,
            details: non_finite_details(raw.bias),
        });
    }

    if falls_below(raw.factuality, thresholds.factuality) {
        notes.push(format!(
            "factual consistency {:.2} is below threshold {:.2}",
            scores.factuality, thresholds.factuality
        ));
        let missing = &measurement.missing_evidence;
        issues.push(SafetyIssue::Factuality {
            consistency: scores.factuality,
            threshold: thresholds.factuality,
            missing_evidence: (!missing.is_empty()).then(|| missing.clone()),
            details: non_finite_details(raw.factuality).or_else(|| {
                (!missing.is_empty())
                    .then(|| format!("{} action(s) lack supporting explanation", missing.len()))
            }),
        });
    }

    if !measurement.missing_evidence.is_empty() {
        notes.push(format!(
            "no supporting explanation for: {}",
            measurement.missing_evidence.join(", ")
        ));
    }

    SafetyReport {
        ok: issues.is_empty(),
        issues,
        notes,
        scores,
        thresholds: *thresholds,
    }
}

fn exceeds(score: f64, threshold: f64) -> bool {
    !score.is_finite() || score > threshold
}

fn falls_below(consistency: f64, threshold: f64) -> bool {
    !consistency.is_finite() || consistency < threshold
}

fn finite_or(value: f64, worst: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        worst
    }
}

fn non_finite_details(value: f64) -> Option<String> {
    (!value.is_finite()).then(|| "measured value is not finite".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(toxicity: f64, bias: f64, factuality: f64) -> Measurement {
        Measurement {
            scores: SafetyScores {
                toxicity,
                bias,
                factuality,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_toxicity_over_threshold() {
        let thresholds = SafetyThresholds {
            toxicity: 0.5,
            ..Default::default()
        };

        let report = assess(&measurement(0.6, 0.0, 1.0), &thresholds);

        assert!(!report.ok);
        assert_eq!(report.issues.len(), 1);
        assert!(matches!(
            report.issues[0],
            SafetyIssue::Toxicity { score, threshold, .. } if score == 0.6 && threshold == 0.5
        ));
    }

    #[test]
    fn test_score_at_threshold_passes() {
        let thresholds = SafetyThresholds {
            toxicity: 0.5,
            bias: 0.5,
            factuality: 0.5,
        };

        let report = assess(&measurement(0.5, 0.5, 0.5), &thresholds);
        assert!(report.ok);
        assert!(report.issues.is_empty());
        assert!(report.notes.is_empty());
    }

    #[test]
    fn test_issue_order_is_fixed() {
        let report = assess(&measurement(0.9, 0.9, 0.1), &SafetyThresholds::default());

        let kinds: Vec<&str> = report.issues.iter().map(|i| i.kind()).collect();
        assert_eq!(kinds, vec!["toxicity", "bias", "factuality"]);
        assert_eq!(report.notes.len(), 3);
    }

    #[test]
    fn test_non_finite_is_violation() {
        let report = assess(&measurement(f64::NAN, 0.0, 1.0), &SafetyThresholds::default());

        assert!(!report.ok);
        match &report.issues[0] {
            SafetyIssue::Toxicity { score, details, .. } => {
                assert_eq!(*score, 1.0);
                assert_eq!(details.as_deref(), Some("measured value is not finite"));
            }
            other => panic!("Expected toxicity issue, got {:?}", other),
        }
        assert_eq!(report.scores.toxicity, 1.0);
    }

    #[test]
    fn test_thresholds_must_be_finite_and_in_range() {
        assert!(SafetySettings::default().validate().is_ok());

        let settings: SafetySettings = serde_yaml::from_str("toxicity: .nan").unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("toxicity"));

        let settings: SafetySettings = serde_yaml::from_str("factuality: 1.5").unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_non_finite_report_survives_serialization() {
        let report = assess(
            &measurement(f64::NAN, f64::INFINITY, f64::NEG_INFINITY),
            &SafetyThresholds::default(),
        );

        assert_eq!(report.issues.len(), 3);
        assert_eq!(report.scores.factuality, 0.0);

        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("null"));
        let parsed: SafetyReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_lexicon_factuality_and_missing_evidence() {
        let analysis = Analysis::new(
            "gpt",
            vec!["backup_db".to_string(), "migrate_db".to_string()],
            0.9,
        )
        .with_explanations("First backup db, then restart the service.");

        let m = LexiconScorer::default().measure(&analysis);

        assert_eq!(m.scores.factuality, 0.5);
        assert_eq!(m.missing_evidence, vec!["migrate_db".to_string()]);
        assert_eq!(m.scores.toxicity, 0.0);
    }

    #[test]
    fn test_missing_evidence_is_annotated_not_failed() {
        let analysis = Analysis::new(
            "gpt",
            vec!["deploy".to_string(), "notify".to_string(), "cleanup".to_string()],
            0.9,
        )
        .with_explanations("We deploy and notify.");

        let report = SafetyEvaluator::default().evaluate(&analysis, &SafetyThresholds::default());

        // 2/3 consistency passes the default 0.6 threshold
        assert!(report.ok);
        assert!(report.notes.iter().any(|n| n.contains("cleanup")));
    }

    #[test]
    fn test_lexicon_toxicity_and_bias_dimension() {
        let analysis = Analysis::new("gpt", vec![], 0.9)
            .with_explanations("stupid idiot she her");

        let m = LexiconScorer::default().measure(&analysis);

        assert_eq!(m.scores.toxicity, 0.5);
        assert_eq!(m.scores.bias, 0.5);
        assert_eq!(m.bias_dimension.as_deref(), Some("gender"));
        assert_eq!(m.scores.factuality, 1.0);
    }

    #[test]
    fn test_empty_explanations() {
        let analysis = Analysis::new("gpt", vec!["deploy".to_string()], 0.9);
        let report = SafetyEvaluator::default().evaluate(&analysis, &SafetyThresholds::default());

        assert!(!report.ok);
        match report.issue("factuality") {
            Some(SafetyIssue::Factuality {
                consistency,
                missing_evidence,
                ..
            }) => {
                assert_eq!(*consistency, 0.0);
                assert_eq!(missing_evidence.as_deref(), Some(&["deploy".to_string()][..]));
            }
            other => panic!("Expected factuality issue, got {:?}", other),
        }
    }

    #[test]
    fn test_settings_yaml_parsing() {
        let yaml = r#"
toxicity: 0.1
factuality: 0.9
toxic_terms: ["awful"]
"#;
        let settings: SafetySettings = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(settings.thresholds.toxicity, 0.1);
        assert_eq!(settings.thresholds.bias, 0.3);
        assert_eq!(settings.thresholds.factuality, 0.9);
        assert_eq!(settings.toxic_terms, vec!["awful".to_string()]);
        assert!(settings.bias_lexicons.contains_key("gender"));
    }
}
