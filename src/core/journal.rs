//! Append-only action journal with file-based persistence.
//!
//! Actions are stored as newline-delimited JSON (JSONL), one file per
//! orchestrator session, so a session's state can be rebuilt by replaying
//! its actions through the reducer.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::domain::{Analysis, DeploymentPlanState, DeploymentStep, JournalEntry};

use super::reducer::reduce;

/// File-based action journal for one session
#[derive(Debug, Clone)]
pub struct Journal {
    session_id: Uuid,

    /// Directory containing the session
    session_dir: PathBuf,

    /// Path to the actions.jsonl file
    actions_path: PathBuf,
}

impl Journal {
    /// Create or open the journal for a session under the configured home
    pub async fn open(session_id: Uuid) -> Result<Self> {
        let base_dir = Self::base_directory()?;
        Self::open_in(&base_dir, session_id).await
    }

    /// Create or open the journal for a session under `base_dir`
    pub async fn open_in(base_dir: &Path, session_id: Uuid) -> Result<Self> {
        let session_dir = base_dir.join(session_id.to_string());

        fs::create_dir_all(&session_dir).await.with_context(|| {
            format!("Failed to create session directory: {}", session_dir.display())
        })?;

        Ok(Self {
            session_id,
            actions_path: session_dir.join("actions.jsonl"),
            session_dir,
        })
    }

    /// Get the base directory for all sessions (~/.plangate/sessions or $PLANGATE_HOME/sessions)
    pub fn base_directory() -> Result<PathBuf> {
        crate::config::sessions_dir()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Get the path to the actions file
    pub fn actions_path(&self) -> &Path {
        &self.actions_path
    }

    /// Append an entry to the log.
    ///
    /// The write holds an exclusive lock on the file so concurrent
    /// processes never interleave lines.
    pub async fn append(&self, entry: &JournalEntry) -> Result<()> {
        let json = serde_json::to_string(entry).context("Failed to serialize journal entry")?;
        let path = self.actions_path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open journal: {}", path.display()))?;

            file.lock_exclusive()
                .context("Failed to acquire file lock on actions.jsonl")?;

            let written = writeln!(file, "{}", json)
                .and_then(|_| file.flush())
                .context("Failed to write journal entry");

            file.unlock().context("Failed to release journal lock")?;
            written
        })
        .await
        .context("Journal writer task panicked")?
    }

    /// Replay all entries in order
    pub async fn replay(&self) -> Result<Vec<JournalEntry>> {
        if !self.actions_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.actions_path)
            .await
            .with_context(|| format!("Failed to open journal: {}", self.actions_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut entries = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse journal entry: {}", line))?;
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Rebuild the session state by folding every journaled action
    /// through the reducer, starting from idle
    pub async fn rebuild_state(&self) -> Result<DeploymentPlanState> {
        let entries = self.replay().await?;
        Ok(entries
            .into_iter()
            .map(|entry| entry.action)
            .fold(DeploymentPlanState::Idle, reduce))
    }

    /// List all session IDs in a base directory
    pub async fn list_sessions(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        sessions.push(uuid);
                    }
                }
            }
        }

        Ok(sessions)
    }
}

/// Digest of a finalized plan (first 16 hex chars of SHA-256)
pub fn plan_digest(analysis: &Analysis, steps: &[DeploymentStep]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(analysis.model.as_bytes());
    for action in &analysis.actions {
        hasher.update(b"\n");
        hasher.update(action.as_bytes());
    }
    hasher.update(b"\n--\n");
    for step in steps {
        hasher.update(step.id.as_bytes());
        hasher.update(b":");
        hasher.update(step.title.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(analysis.explanations.as_bytes());

    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeploymentPlanAction, PlanStatus};
    use tempfile::TempDir;

    async fn create_test_journal() -> (Journal, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let journal = Journal::open_in(temp_dir.path(), Uuid::new_v4())
            .await
            .unwrap();
        (journal, temp_dir)
    }

    #[tokio::test]
    async fn test_append_and_replay_order() {
        let (journal, _temp) = create_test_journal().await;

        for (i, chunk) in ["a", "b", "c"].iter().enumerate() {
            let entry = JournalEntry::new(
                journal.session_id(),
                i as u64 + 1,
                DeploymentPlanAction::stream(*chunk),
                PlanStatus::Generating,
                true,
            );
            journal.append(&entry).await.unwrap();
        }

        let entries = journal.replay().await.unwrap();
        assert_eq!(entries.len(), 3);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.sequence, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_replay_missing_file_is_empty() {
        let (journal, _temp) = create_test_journal().await;
        assert!(journal.replay().await.unwrap().is_empty());
        assert_eq!(journal.rebuild_state().await.unwrap(), DeploymentPlanState::Idle);
    }

    #[tokio::test]
    async fn test_rebuild_state() {
        let (journal, _temp) = create_test_journal().await;
        let actions = [
            DeploymentPlanAction::GeneratePlanStart,
            DeploymentPlanAction::stream("Analyzing "),
            DeploymentPlanAction::stream("risk..."),
        ];

        for (i, action) in actions.into_iter().enumerate() {
            let entry = JournalEntry::new(
                journal.session_id(),
                i as u64 + 1,
                action,
                PlanStatus::Generating,
                true,
            );
            journal.append(&entry).await.unwrap();
        }

        let state = journal.rebuild_state().await.unwrap();
        assert_eq!(state.partial_explanations(), Some("Analyzing risk..."));
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let temp_dir = TempDir::new().unwrap();
        let first = Journal::open_in(temp_dir.path(), Uuid::new_v4()).await.unwrap();
        let second = Journal::open_in(temp_dir.path(), Uuid::new_v4()).await.unwrap();
        std::fs::create_dir_all(temp_dir.path().join("not-a-session")).unwrap();

        let mut sessions = Journal::list_sessions(temp_dir.path()).await.unwrap();
        sessions.sort();
        let mut expected = vec![first.session_id(), second.session_id()];
        expected.sort();

        assert_eq!(sessions, expected);
    }

    #[test]
    fn test_plan_digest_consistency() {
        let analysis = Analysis::new("gpt", vec!["deploy".to_string()], 0.9);
        let steps = DeploymentStep::from_actions(&analysis.actions);

        let digest1 = plan_digest(&analysis, &steps);
        let digest2 = plan_digest(&analysis, &steps);
        let other = plan_digest(&analysis.clone().with_explanations("changed"), &steps);

        assert_eq!(digest1, digest2);
        assert_ne!(digest1, other);
        assert_eq!(digest1.len(), 16);
    }
}
