//! Command-line interface for plangate.
//!
//! Provides commands for simulating scripted sessions, generating and
//! running real plans, evaluating analyses, and inspecting journaled
//! sessions.

use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use uuid::Uuid;

use crate::adapters::{CommandProvider, CommandRunner, PlanRequest, StepRunner};
use crate::config;
use crate::core::{
    Journal, Orchestrator, OrchestratorSettings, PolicyGate, SafetyEvaluator, Scenario,
};
use crate::domain::{Analysis, DeploymentPlanState, PlanStatus};

/// plangate - Gate and run AI-generated deployment plans
#[derive(Parser, Debug)]
#[command(name = "plangate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a scripted scenario through the orchestrator
    Simulate {
        /// Scenario file (YAML)
        scenario: PathBuf,

        /// Approve the plan even if policy asks for review
        #[arg(long)]
        approve: bool,
    },

    /// Generate a plan with the configured generator and run it
    Plan {
        /// File describing the change (reads from stdin if not provided)
        #[arg(short, long)]
        request: Option<PathBuf>,

        /// Extra context handed to the generator
        #[arg(short, long)]
        context: Option<String>,

        /// Approve the plan even if policy asks for review
        #[arg(long)]
        approve: bool,
    },

    /// Approve a session's plan awaiting approval and execute it
    Approve {
        /// Session ID (UUID)
        session_id: String,

        /// Run the steps scripted in this scenario instead of the configured commands
        #[arg(long)]
        scenario: Option<PathBuf>,
    },

    /// Run the safety evaluator and policy gate on an analysis file
    Evaluate {
        /// Analysis file (JSON)
        analysis: PathBuf,
    },

    /// Rebuild and show the state of a session
    Status {
        /// Session ID (UUID)
        session_id: String,
    },

    /// List recent sessions
    Sessions {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Simulate { scenario, approve } => simulate(&scenario, approve).await,
            Commands::Plan {
                request,
                context,
                approve,
            } => run_plan(request, context, approve).await,
            Commands::Approve {
                session_id,
                scenario,
            } => approve_session(&session_id, scenario.as_deref()).await,
            Commands::Evaluate { analysis } => evaluate(&analysis),
            Commands::Status { session_id } => show_status(&session_id).await,
            Commands::Sessions { limit } => list_sessions(limit).await,
            Commands::Config => show_config(),
        }
    }
}

/// Run a scenario file end to end
async fn simulate(path: &Path, approve: bool) -> Result<()> {
    let scenario = Scenario::from_file(path)?;
    scenario.validate()?;

    let cfg = config::config()?;
    let orchestrator = Orchestrator::open(OrchestratorSettings::from_config(cfg)).await?;
    eprintln!(
        "[Session {}: scenario '{}']",
        orchestrator.session_id(),
        scenario.name
    );

    let echo = tokio::spawn(echo_explanations(orchestrator.subscribe()));
    let state = orchestrator
        .run(
            Arc::new(scenario.provider()),
            Arc::new(scenario.runner()),
            scenario.request(),
            approve,
        )
        .await?;
    echo.abort();

    finish(orchestrator.session_id(), &state)
}

/// Generate a plan with the configured command and run it
async fn run_plan(request_file: Option<PathBuf>, context: Option<String>, approve: bool) -> Result<()> {
    let cfg = config::config()?;

    let provider =
        CommandProvider::from_command_line(&cfg.generator.command, cfg.generator.timeout())
            .context("No generator configured (set generator.command in .plangate/config.yaml)")?;
    let runner = CommandRunner::new(cfg.execution.commands.clone());

    let change = if let Some(path) = request_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read request file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No change description provided. Use --request <file> or pipe to stdin");
    };

    if change.trim().is_empty() {
        anyhow::bail!("Change description is empty");
    }

    let request = PlanRequest {
        change,
        context,
    };

    let orchestrator = Orchestrator::open(OrchestratorSettings::from_config(cfg)).await?;
    eprintln!("[Session {}]", orchestrator.session_id());

    let echo = tokio::spawn(echo_explanations(orchestrator.subscribe()));
    let state = orchestrator
        .run(Arc::new(provider), Arc::new(runner), request, approve)
        .await?;
    echo.abort();

    finish(orchestrator.session_id(), &state)
}

/// Approve a plan left awaiting approval by an earlier run, then execute it
/// in the same session
async fn approve_session(session_id_str: &str, scenario: Option<&Path>) -> Result<()> {
    let session_id = Uuid::parse_str(session_id_str)
        .with_context(|| format!("Invalid session ID: {}", session_id_str))?;

    let base_dir = config::sessions_dir()?;
    if !base_dir.join(session_id.to_string()).exists() {
        anyhow::bail!("Session {} not found", session_id);
    }

    let cfg = config::config()?;
    let runner: Arc<dyn StepRunner> = match scenario {
        Some(path) => {
            let scenario = Scenario::from_file(path)?;
            scenario.validate()?;
            Arc::new(scenario.runner())
        }
        None => Arc::new(CommandRunner::new(cfg.execution.commands.clone())),
    };

    let journal = Journal::open_in(&base_dir, session_id).await?;
    let orchestrator = Orchestrator::resume(OrchestratorSettings::from_config(cfg), journal).await?;

    let state = orchestrator.snapshot();
    if state.status() != PlanStatus::AwaitingApproval {
        anyhow::bail!(
            "Session {} is {}, not awaiting approval",
            session_id,
            state.status()
        );
    }

    print_state(&state);
    eprintln!("\n[Session {} approved]", session_id);

    let state = orchestrator.approve().await?;
    let state = if state.is_running() {
        orchestrator.execute(runner).await?
    } else {
        state
    };

    finish(session_id, &state)
}

/// Print streamed explanation text to stderr as it arrives
async fn echo_explanations(mut rx: watch::Receiver<DeploymentPlanState>) {
    let mut printed = String::new();

    while rx.changed().await.is_ok() {
        let text = rx.borrow().partial_explanations().map(str::to_string);
        match text {
            Some(text) => {
                let (restarted, unseen) = unseen_text(&printed, &text);
                if restarted && !printed.is_empty() {
                    eprintln!();
                }
                if !unseen.is_empty() {
                    eprint!("{}", unseen);
                    let _ = io::stderr().flush();
                }
                printed = text;
            }
            None => {
                if !printed.is_empty() {
                    eprintln!();
                }
                printed.clear();
            }
        }
    }
}

/// Part of `text` not echoed yet. When `text` does not continue what was
/// already printed, a new generation started and all of it is unseen.
fn unseen_text<'a>(printed: &str, text: &'a str) -> (bool, &'a str) {
    match text.strip_prefix(printed) {
        Some(rest) => (false, rest),
        None => (true, text),
    }
}

/// Print the final state and exit non-zero on failure
fn finish(session_id: Uuid, state: &DeploymentPlanState) -> Result<()> {
    print_state(state);

    match state.status() {
        PlanStatus::Failed | PlanStatus::ExecutionFailed => {
            eprintln!("\n[Session {} failed]", session_id);
            std::process::exit(1);
        }
        PlanStatus::AwaitingApproval => {
            eprintln!(
                "\n[Session {} awaiting approval; run `plangate approve {}` to execute]",
                session_id, session_id
            );
        }
        _ => {
            eprintln!("\n[Session {} {}]", session_id, state.status());
        }
    }

    Ok(())
}

fn print_state(state: &DeploymentPlanState) {
    println!("Status: {}", state.status());

    if let Some(plan) = state.plan() {
        let analysis = &plan.analysis;
        println!("Model: {} (confidence {:.2})", analysis.model, analysis.confidence);

        let report = &plan.safety_report;
        println!(
            "Safety: {} (toxicity {:.2}, bias {:.2}, factuality {:.2})",
            if report.ok { "ok" } else { "issues found" },
            report.scores.toxicity,
            report.scores.bias,
            report.scores.factuality
        );
        for note in &report.notes {
            println!("  - {}", note);
        }
    }

    if let DeploymentPlanState::AwaitingApproval {
        policy_notes,
        requires_approval,
        ..
    } = state
    {
        println!("Requires approval: {}", requires_approval);
        for note in policy_notes {
            println!("  - {}", note);
        }
    }

    let steps = state.steps();
    if !steps.is_empty() {
        println!("\n{:<10} {:<30} {:<10} {:>10}", "STEP", "TITLE", "STATUS", "DURATION");
        println!("{}", "-".repeat(63));
        for step in steps {
            let duration = step
                .duration
                .map(|ms| format!("{}ms", ms))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<10} {:<30} {:<10} {:>10}",
                step.id,
                step.title,
                step.status.as_str(),
                duration
            );
        }
    }

    if let Some(error) = state.error() {
        println!("\nError: {}", error);
    }
}

/// Evaluate an analysis without running anything
fn evaluate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read analysis file: {}", path.display()))?;
    let analysis: Analysis = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse analysis file: {}", path.display()))?;

    let cfg = config::config()?;
    let report = SafetyEvaluator::from_settings(&cfg.safety).evaluate(&analysis, &cfg.safety.thresholds);
    let decision = PolicyGate::new(cfg.policy.clone()).decide(&analysis, &report);

    println!("{}", serde_json::to_string_pretty(&decision.into_result(report))?);
    Ok(())
}

/// Show the state of a session, rebuilt from its journal
async fn show_status(session_id_str: &str) -> Result<()> {
    let session_id = Uuid::parse_str(session_id_str)
        .with_context(|| format!("Invalid session ID: {}", session_id_str))?;

    let base_dir = config::sessions_dir()?;
    if !base_dir.join(session_id.to_string()).exists() {
        anyhow::bail!("Session {} not found", session_id);
    }

    let journal = Journal::open_in(&base_dir, session_id).await?;
    let entries = journal.replay().await?;
    let state = journal.rebuild_state().await?;
    let ignored = entries.iter().filter(|e| !e.applied).count();

    println!("Session ID: {}", session_id);
    if let Some(first) = entries.first() {
        println!("Started: {}", first.timestamp);
    }
    if let Some(last) = entries.last() {
        println!("Updated: {}", last.timestamp);
    }
    println!("Actions: {} ({} ignored)", entries.len(), ignored);
    if let Some(digest) = entries.iter().rev().find_map(|e| e.plan_digest.as_deref()) {
        println!("Plan digest: {}", digest);
    }
    println!();
    print_state(&state);

    Ok(())
}

/// List recent sessions, most recently updated first
async fn list_sessions(limit: usize) -> Result<()> {
    let base_dir = config::sessions_dir()?;
    let session_ids = Journal::list_sessions(&base_dir).await?;

    let mut sessions: Vec<(Uuid, Option<DateTime<Utc>>, DeploymentPlanState)> = Vec::new();
    for session_id in session_ids {
        let journal = Journal::open_in(&base_dir, session_id).await?;
        let entries = journal.replay().await?;
        let updated = entries.last().map(|e| e.timestamp);
        let state = journal.rebuild_state().await?;
        sessions.push((session_id, updated, state));
    }

    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }

    sessions.sort_by(|a, b| b.1.cmp(&a.1));

    println!("{:<38} {:<18} {:<6} {:<20}", "SESSION ID", "STATUS", "STEPS", "UPDATED");
    println!("{}", "-".repeat(84));

    for (session_id, updated, state) in sessions.into_iter().take(limit) {
        let updated = updated
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<18} {:<6} {:<20}",
            session_id,
            state.status().as_str(),
            state.steps().len(),
            updated
        );
    }

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("plangate configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Sessions: {}", cfg.sessions_dir().display());
    println!();
    println!("Generator:");
    if cfg.generator.command.is_empty() {
        println!("  Command: (not configured)");
    } else {
        println!("  Command: {}", cfg.generator.command.join(" "));
    }
    println!("  Timeout: {}s", cfg.generator.timeout_seconds);
    println!();
    println!("Execution:");
    println!("  Step timeout: {}s", cfg.execution.step_timeout_seconds);
    println!("  Max attempts: {}", cfg.execution.retry.max_attempts);
    for (action, command) in &cfg.execution.commands {
        println!("  {}: {}", action, command);
    }
    println!();
    println!("Safety:");
    println!("  Toxicity threshold:   {}", cfg.safety.thresholds.toxicity);
    println!("  Bias threshold:       {}", cfg.safety.thresholds.bias);
    println!("  Factuality threshold: {}", cfg.safety.thresholds.factuality);
    println!();
    println!("Policy:");
    println!("  Confidence floor:  {}", cfg.policy.confidence_floor);
    println!("  Auto approve:      {}", cfg.policy.auto_approve);
    println!("  High-risk actions: {}", cfg.policy.high_risk_actions.join(", "));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unseen_text_continues_stream() {
        assert_eq!(unseen_text("", "Analyzing "), (false, "Analyzing "));
        assert_eq!(unseen_text("Analyzing ", "Analyzing risk"), (false, "risk"));
        assert_eq!(unseen_text("Analyzing risk", "Analyzing risk"), (false, ""));
    }

    #[test]
    fn test_unseen_text_after_missed_restart() {
        // A shorter multi-byte text from the next generation must not be
        // sliced at the old offset
        assert_eq!(unseen_text("Déploiement prêt", "Ré"), (true, "Ré"));
        assert_eq!(unseen_text("abc", "xyzw"), (true, "xyzw"));
    }

    #[test]
    fn test_approve_command_parses() {
        let cli = Cli::try_parse_from([
            "plangate",
            "approve",
            "6f1c1c4e-2f63-4a3b-9a59-1a2b3c4d5e6f",
            "--scenario",
            "demo.yaml",
        ])
        .unwrap();

        match cli.command {
            Commands::Approve {
                session_id,
                scenario,
            } => {
                assert_eq!(session_id, "6f1c1c4e-2f63-4a3b-9a59-1a2b3c4d5e6f");
                assert_eq!(scenario, Some(PathBuf::from("demo.yaml")));
            }
            other => panic!("Expected approve, got {:?}", other),
        }
    }
}
