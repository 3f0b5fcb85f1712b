//! Subprocess adapters.
//!
//! `CommandProvider` runs an external generator (for example
//! `fabric -p deployment_plan`), writes the request to its stdin and reads
//! JSON lines from stdout:
//!
//! ```text
//! {"chunk": "Analyzing "}
//! {"chunk": "risk..."}
//! {"analysis": {"model": "...", "actions": [...], "explanations": "...", "confidence": 0.9}}
//! ```
//!
//! `CommandRunner` maps action identifiers to shell commands and runs one
//! per step.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::domain::{Analysis, DeploymentStep};

use super::{
    AnalysisProvider, ChunkSender, GenerationError, PlanRequest, StepError, StepOutput, StepRunner,
};

/// One line of generator output
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProviderLine {
    Chunk { chunk: String },
    Analysis { analysis: Analysis },
}

/// Analysis provider backed by an external command
#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProvider {
    /// Create a provider from a command line (program followed by args).
    ///
    /// Returns `None` for an empty command line.
    pub fn from_command_line(command: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    async fn run_command(
        &self,
        request: &PlanRequest,
        chunks: ChunkSender,
    ) -> Result<Analysis, GenerationError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GenerationError::Unavailable(format!("failed to spawn '{}': {}", self.program, e))
            })?;

        // Write the request, then drop stdin to signal EOF
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt().as_bytes())
                .await
                .map_err(|e| GenerationError::Failed(format!("failed to write request: {}", e)))?;
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GenerationError::Failed("generator stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut analysis = None;

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| GenerationError::Failed(format!("failed to read output: {}", e)))?
        {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<ProviderLine>(line) {
                Ok(ProviderLine::Chunk { chunk }) => {
                    // Receiver gone means the generation was abandoned
                    let _ = chunks.send(chunk);
                }
                Ok(ProviderLine::Analysis { analysis: a }) => analysis = Some(a),
                Err(e) => {
                    return Err(GenerationError::Malformed(format!(
                        "unparsable line '{}': {}",
                        line, e
                    )))
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| GenerationError::Failed(format!("failed to wait for generator: {}", e)))?;

        if !status.success() {
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            return Err(GenerationError::Failed(format!(
                "'{}' exited with code {}: {}",
                self.program,
                status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        analysis.ok_or_else(|| {
            GenerationError::Malformed("generator finished without an analysis".to_string())
        })
    }
}

#[async_trait]
impl AnalysisProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.program
    }

    async fn generate(
        &self,
        request: &PlanRequest,
        chunks: ChunkSender,
    ) -> Result<Analysis, GenerationError> {
        timeout(self.timeout, self.run_command(request, chunks))
            .await
            .map_err(|_| GenerationError::Timeout {
                seconds: self.timeout.as_secs(),
            })?
    }
}

/// Step runner executing a shell command per action
#[derive(Debug, Clone)]
pub struct CommandRunner {
    /// Action identifier -> shell command
    commands: BTreeMap<String, String>,

    /// Shell used to run commands (default: "sh")
    shell: String,
}

impl CommandRunner {
    pub fn new(commands: BTreeMap<String, String>) -> Self {
        Self {
            commands,
            shell: "sh".to_string(),
        }
    }

    /// Use a different shell (must accept `-c <command>`)
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl StepRunner for CommandRunner {
    fn name(&self) -> &str {
        "command"
    }

    async fn run(&self, step: &DeploymentStep, action: &str) -> Result<StepOutput, StepError> {
        let command = self.commands.get(action).ok_or_else(|| StepError::NoCommand {
            action: action.to_string(),
        })?;

        debug!(step = %step.id, %action, %command, "Running step command");

        // kill_on_drop so a timed-out step does not leave the process behind
        let output = Command::new(&self.shell)
            .args(["-c", command.as_str()])
            .env("PLANGATE_STEP_ID", &step.id)
            .env("PLANGATE_STEP_TITLE", &step.title)
            .env("PLANGATE_ACTION", action)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StepError::Spawn {
                step: step.id.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StepError::Failed {
                step: step.id.clone(),
                reason: format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        Ok(StepOutput::new(String::from_utf8_lossy(&output.stdout)))
    }
}
