//! Configuration for plangate.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PLANGATE_HOME)
//! 2. Config file (.plangate/config.yaml)
//! 3. Defaults (~/.plangate)
//!
//! Config file discovery:
//! - Searches current directory and parents for .plangate/config.yaml
//! - `paths.home` is relative to the .plangate/ directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::executor::RetryPolicy;
use crate::core::policy::PolicyConfig;
use crate::core::safety::SafetySettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub safety: SafetySettings,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub generator: GeneratorSettings,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .plangate/)
    pub home: Option<String>,
}

/// How approved plans are executed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Action identifier -> shell command, used by `plangate plan`
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
}

fn default_step_timeout() -> u64 {
    300
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            step_timeout_seconds: default_step_timeout(),
            retry: RetryPolicy::default(),
            commands: BTreeMap::new(),
        }
    }
}

impl ExecutionSettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }
}

/// External analysis generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSettings {
    /// Program and arguments, e.g. ["fabric", "-p", "deployment_plan"]
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default = "default_generator_timeout")]
    pub timeout_seconds: u64,
}

fn default_generator_timeout() -> u64 {
    120
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_seconds: default_generator_timeout(),
        }
    }
}

impl GeneratorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to plangate home (session state)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub safety: SafetySettings,
    pub policy: PolicyConfig,
    pub execution: ExecutionSettings,
    pub generator: GeneratorSettings,
}

impl ResolvedConfig {
    /// Directory holding one subdirectory per session
    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("sessions")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".plangate").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    resolve(find_config_file(), std::env::var("PLANGATE_HOME").ok())
}

/// Build the configuration from an optional config file and an optional
/// PLANGATE_HOME override
fn resolve(config_file: Option<PathBuf>, env_home: Option<String>) -> Result<ResolvedConfig> {
    let default_home = || -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".plangate"))
    };

    let Some(config_path) = config_file else {
        let home = match env_home {
            Some(home) => PathBuf::from(home),
            None => default_home()?,
        };

        return Ok(ResolvedConfig {
            home,
            config_file: None,
            safety: SafetySettings::default(),
            policy: PolicyConfig::default(),
            execution: ExecutionSettings::default(),
            generator: GeneratorSettings::default(),
        });
    };

    let config = load_config_file(&config_path)?;
    config
        .safety
        .validate()
        .with_context(|| format!("Invalid safety settings in {}", config_path.display()))?;

    let home = if let Some(env_home) = env_home {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = config.paths.home {
        // home is relative to .plangate/ directory
        let plangate_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(plangate_dir, home_path)
    } else {
        default_home()?
    };

    Ok(ResolvedConfig {
        home,
        config_file: Some(config_path),
        safety: config.safety,
        policy: config.policy,
        execution: config.execution,
        generator: config.generator,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the plangate home directory (session state).
pub fn plangate_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the sessions directory ($PLANGATE_HOME/sessions)
pub fn sessions_dir() -> Result<PathBuf> {
    Ok(config()?.sessions_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(temp: &TempDir, yaml: &str) -> PathBuf {
        let plangate_dir = temp.path().join(".plangate");
        std::fs::create_dir_all(&plangate_dir).unwrap();

        let config_path = plangate_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", yaml).unwrap();
        config_path
    }

    #[test]
    fn test_default_config_without_file() {
        let config = resolve(None, None).unwrap();

        let expected_home = dirs::home_dir().unwrap().join(".plangate");
        assert_eq!(config.home, expected_home);
        assert_eq!(config.sessions_dir(), expected_home.join("sessions"));
        assert!(config.config_file.is_none());
        assert!(!config.policy.auto_approve);
        assert_eq!(config.execution.step_timeout_seconds, 300);
        assert_eq!(config.execution.retry.max_attempts, 1);
    }

    #[test]
    fn test_env_home_overrides_defaults() {
        let config = resolve(None, Some("/srv/plangate".to_string())).unwrap();
        assert_eq!(config.home, PathBuf::from("/srv/plangate"));
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1.0"
paths:
  home: ./state
safety:
  toxicity: 0.1
  bias: 0.25
policy:
  confidence_floor: 0.9
  high_risk_actions: ["*drop*"]
  auto_approve: true
execution:
  step_timeout_seconds: 60
  retry:
    max_attempts: 3
  commands:
    migrate_db: ./scripts/migrate.sh
generator:
  command: ["fabric", "-p", "deployment_plan"]
"#,
        );

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./state".to_string()));
        assert_eq!(config.safety.thresholds.toxicity, 0.1);
        assert_eq!(config.safety.thresholds.bias, 0.25);
        // Unset thresholds keep their defaults
        assert_eq!(config.safety.thresholds.factuality, 0.6);
        assert!(!config.safety.toxic_terms.is_empty());
        assert_eq!(config.policy.confidence_floor, 0.9);
        assert!(config.policy.auto_approve);
        assert_eq!(config.execution.step_timeout(), Duration::from_secs(60));
        assert_eq!(config.execution.retry.max_attempts, 3);
        assert_eq!(config.execution.retry.initial_delay_ms, 1000);
        assert_eq!(
            config.execution.commands.get("migrate_db"),
            Some(&"./scripts/migrate.sh".to_string())
        );
        assert_eq!(config.generator.command.len(), 3);
        assert_eq!(config.generator.timeout_seconds, 120);
    }

    #[test]
    fn test_home_resolved_relative_to_config_dir() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "paths:\n  home: ./state");

        let config = resolve(Some(config_path.clone()), None).unwrap();
        assert_eq!(config.config_file, Some(config_path));
        assert!(config.home.ends_with(".plangate/state"));

        let config = resolve(config.config_file.clone(), Some("/override".to_string())).unwrap();
        assert_eq!(config.home, PathBuf::from("/override"));
    }

    #[test]
    fn test_invalid_thresholds_are_rejected() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "safety:\n  bias: .nan");

        let err = resolve(Some(config_path), None).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Invalid safety settings"));
        assert!(message.contains("bias"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
