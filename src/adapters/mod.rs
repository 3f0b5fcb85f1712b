//! Adapter interfaces for external systems.
//!
//! The orchestrator never calls a model or touches a deployment target
//! directly. It goes through two seams:
//! - `AnalysisProvider`: streams explanation chunks and returns a final
//!   analysis
//! - `StepRunner`: performs the deployment action behind one step

pub mod command;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{Analysis, DeploymentStep};

// Re-export the adapters
pub use command::{CommandProvider, CommandRunner};
pub use scripted::{ScriptedProvider, ScriptedRunner, StepScript};

/// Sink for streamed explanation chunks
pub type ChunkSender = mpsc::UnboundedSender<String>;

/// A request to analyze a proposed change
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanRequest {
    /// Description of the proposed change (diff, ticket text, ...)
    pub change: String,

    /// Extra context for the model
    #[serde(default)]
    pub context: Option<String>,
}

impl PlanRequest {
    pub fn new(change: impl Into<String>) -> Self {
        Self {
            change: change.into(),
            context: None,
        }
    }

    /// Text handed to the provider
    pub fn prompt(&self) -> String {
        match &self.context {
            Some(context) => format!("{}\n\nContext:\n{}", self.change, context),
            None => self.change.clone(),
        }
    }
}

/// Analysis generation failures
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Generation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Malformed provider output: {0}")]
    Malformed(String),

    #[error("Invalid analysis: {0}")]
    InvalidAnalysis(String),

    #[error("Generation failed: {0}")]
    Failed(String),
}

/// Trait for analysis generation providers
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Generate an analysis, sending explanation chunks as they arrive.
    ///
    /// The sender is dropped when generation finishes, which ends the
    /// chunk stream.
    async fn generate(
        &self,
        request: &PlanRequest,
        chunks: ChunkSender,
    ) -> Result<Analysis, GenerationError>;
}

/// Output of a successful step
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub output: String,
}

impl StepOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

/// Step execution failures
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("Step '{step}' timed out after {seconds}s")]
    Timeout { step: String, seconds: u64 },

    #[error("Step '{step}' failed: {reason}")]
    Failed { step: String, reason: String },

    #[error("No command configured for action '{action}'")]
    NoCommand { action: String },

    #[error("Failed to launch step '{step}': {reason}")]
    Spawn { step: String, reason: String },
}

/// Trait for deployment step runners
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Human-readable runner name
    fn name(&self) -> &str;

    /// Perform the deployment action behind `step`
    async fn run(&self, step: &DeploymentStep, action: &str) -> Result<StepOutput, StepError>;
}
