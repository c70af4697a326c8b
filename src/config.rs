//! Runtime settings for the agentflow binary.
//!
//! Settings sources (highest priority first):
//! 1. Environment variables (AGENTFLOW_HOME, AGENTFLOW_PROVIDER, AGENTFLOW_TIMEOUT)
//! 2. Config file (.agentflow/config.yaml)
//! 3. Defaults (~/.agentflow, no provider, 30s timeout, 5 loop iterations)
//!
//! Config file discovery:
//! - Searches current directory and parents for .agentflow/config.yaml
//! - Relative paths in the file are resolved against the .agentflow/ directory
//!
//! Settings are loaded explicitly and passed down; nothing is cached globally.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const ENV_HOME: &str = "AGENTFLOW_HOME";
pub const ENV_PROVIDER: &str = "AGENTFLOW_PROVIDER";
pub const ENV_TIMEOUT: &str = "AGENTFLOW_TIMEOUT";

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
    #[serde(default)]
    pub defaults: Option<DefaultsConfig>,
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    /// Command line of the model provider, e.g. `ollama run llama3`
    pub command: Option<String>,
    /// Per-call timeout for the provider command
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsConfig {
    pub timeout_seconds: Option<u64>,
    pub max_iterations: Option<u32>,
}

/// Resolved settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Absolute path to the agentflow home directory
    pub home: PathBuf,
    /// Default provider command line
    pub provider: Option<String>,
    /// Per-call provider timeout
    pub provider_timeout: Duration,
    /// Orchestration timeout used when a file sets none
    pub timeout: Duration,
    /// Loop bound used when a file sets none
    pub max_iterations: u32,
    /// Filter directive for logging, if configured
    pub log_level: Option<String>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the environment, the nearest config file and defaults
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        Self::load_from(&cwd, |key| std::env::var(key).ok())
    }

    /// Load settings starting the config file search at `start`, reading
    /// variables through `env`
    pub fn load_from<F>(start: &Path, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_file = find_config_file(start);
        let file = match &config_file {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };

        let default_home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".agentflow");

        let home = if let Some(env_home) = env(ENV_HOME) {
            PathBuf::from(env_home)
        } else if let (Some(home), Some(path)) = (&file.home, &config_file) {
            // home is relative to .agentflow/
            let config_dir = path.parent().unwrap_or(Path::new("."));
            resolve_path(config_dir, home)
        } else {
            default_home
        };

        let provider = env(ENV_PROVIDER)
            .or_else(|| file.provider.as_ref().and_then(|p| p.command.clone()))
            .filter(|command| !command.trim().is_empty());

        let timeout_seconds = match env(ENV_TIMEOUT) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{} must be a number of seconds, got '{}'", ENV_TIMEOUT, raw))?,
            None => file
                .defaults
                .as_ref()
                .and_then(|d| d.timeout_seconds)
                .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        };

        let provider_timeout = file
            .provider
            .as_ref()
            .and_then(|p| p.timeout_seconds)
            .map(Duration::from_secs)
            .unwrap_or(crate::adapters::command::DEFAULT_TIMEOUT);

        let max_iterations = file
            .defaults
            .as_ref()
            .and_then(|d| d.max_iterations)
            .unwrap_or(DEFAULT_MAX_ITERATIONS);

        Ok(Self {
            home,
            provider,
            provider_timeout,
            timeout: Duration::from_secs(timeout_seconds),
            max_iterations,
            log_level: file.log_level,
            config_file,
        })
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".agentflow").join("config.yaml");
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

/// Resolve a path that may be relative to `base`
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
