//! Scenario definitions for `plangate simulate`.
//!
//! A scenario scripts one full session in YAML: the explanation chunks the
//! provider streams, the final analysis (or generation error), and how each
//! action behaves when executed.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::{PlanRequest, ScriptedProvider, ScriptedRunner, StepScript};
use crate::domain::Analysis;

/// A scripted session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name (used in CLI output)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Change description handed to the provider
    #[serde(default)]
    pub request: String,

    /// Explanation chunks streamed before the outcome
    #[serde(default)]
    pub chunks: Vec<String>,

    /// Pause between chunks in milliseconds
    #[serde(default)]
    pub chunk_delay_ms: u64,

    /// Final analysis (mutually exclusive with `error`)
    #[serde(default)]
    pub analysis: Option<Analysis>,

    /// Generation error (mutually exclusive with `analysis`)
    #[serde(default)]
    pub error: Option<String>,

    /// Per-action execution behavior; unlisted actions succeed
    #[serde(default)]
    pub steps: HashMap<String, StepScript>,
}

impl Scenario {
    /// Load a scenario from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a scenario from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse scenario YAML")
    }

    /// Validate the scenario definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Scenario name cannot be empty");
        }

        match (&self.analysis, &self.error) {
            (Some(_), Some(_)) => {
                anyhow::bail!("Scenario '{}' sets both 'analysis' and 'error'", self.name)
            }
            (None, None) => {
                anyhow::bail!("Scenario '{}' needs an 'analysis' or an 'error'", self.name)
            }
            _ => {}
        }

        if let Some(ref analysis) = self.analysis {
            for action in self.steps.keys() {
                if !analysis.actions.contains(action) {
                    anyhow::bail!(
                        "Scenario '{}' scripts unknown action '{}'",
                        self.name,
                        action
                    );
                }
            }
        }

        Ok(())
    }

    pub fn request(&self) -> PlanRequest {
        PlanRequest::new(self.request.clone())
    }

    /// Provider replaying the scripted generation
    pub fn provider(&self) -> ScriptedProvider {
        let provider = match (&self.analysis, &self.error) {
            (Some(analysis), _) => ScriptedProvider::succeeding(self.chunks.clone(), analysis.clone()),
            (None, Some(error)) => ScriptedProvider::failing(self.chunks.clone(), error.clone()),
            (None, None) => ScriptedProvider::failing(self.chunks.clone(), "no outcome scripted"),
        };

        provider.with_chunk_delay(Duration::from_millis(self.chunk_delay_ms))
    }

    /// Runner replaying the scripted step outcomes
    pub fn runner(&self) -> ScriptedRunner {
        ScriptedRunner::new(self.steps.clone())
    }
}
