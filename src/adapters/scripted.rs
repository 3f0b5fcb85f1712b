//! Scripted adapters with predetermined behavior.
//!
//! Used by `plangate simulate` to replay a scenario file, and by tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Analysis, DeploymentStep};

use super::{
    AnalysisProvider, ChunkSender, GenerationError, PlanRequest, StepError, StepOutput, StepRunner,
};

/// Provider that streams fixed chunks, then returns a fixed outcome
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    chunks: Vec<String>,
    outcome: Result<Analysis, String>,
    chunk_delay: Duration,
}

impl ScriptedProvider {
    /// Stream `chunks`, then succeed with `analysis`
    pub fn succeeding(chunks: Vec<String>, analysis: Analysis) -> Self {
        Self {
            chunks,
            outcome: Ok(analysis),
            chunk_delay: Duration::ZERO,
        }
    }

    /// Stream `chunks`, then fail with `error`
    pub fn failing(chunks: Vec<String>, error: impl Into<String>) -> Self {
        Self {
            chunks,
            outcome: Err(error.into()),
            chunk_delay: Duration::ZERO,
        }
    }

    /// Pause between chunks
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[async_trait]
impl AnalysisProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        _request: &PlanRequest,
        chunks: ChunkSender,
    ) -> Result<Analysis, GenerationError> {
        for chunk in &self.chunks {
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            let _ = chunks.send(chunk.clone());
        }

        self.outcome.clone().map_err(GenerationError::Failed)
    }
}

/// Scripted behavior of one action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepScript {
    /// Fail with this message (after any transient failures)
    #[serde(default)]
    pub fail: Option<String>,

    /// Fail this many attempts before succeeding
    #[serde(default)]
    pub transient_failures: u32,

    /// Simulated work time in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
}

/// Runner whose step outcomes come from a script keyed by action.
/// Actions without a script succeed immediately.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: HashMap<String, StepScript>,

    /// Actions in the order they were attempted
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new(scripts: HashMap<String, StepScript>) -> Self {
        Self {
            scripts,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Script one action
    pub fn with_script(mut self, action: impl Into<String>, script: StepScript) -> Self {
        self.scripts.insert(action.into(), script);
        self
    }

    /// Actions attempted so far, in order (retries included)
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record_attempt(&self, action: &str) -> u32 {
        match self.calls.lock() {
            Ok(mut calls) => {
                calls.push(action.to_string());
                calls.iter().filter(|a| a.as_str() == action).count() as u32
            }
            Err(_) => 1,
        }
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, step: &DeploymentStep, action: &str) -> Result<StepOutput, StepError> {
        let attempt = self.record_attempt(action);
        let script = self.scripts.get(action).cloned().unwrap_or_default();

        if script.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(script.delay_ms)).await;
        }

        if attempt <= script.transient_failures {
            return Err(StepError::Failed {
                step: step.id.clone(),
                reason: format!("transient failure (attempt {})", attempt),
            });
        }

        match script.fail {
            Some(reason) => Err(StepError::Failed {
                step: step.id.clone(),
                reason,
            }),
            None => Ok(StepOutput::new(format!("{} done", action))),
        }
    }
}
