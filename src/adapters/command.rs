//! Model provider backed by a local command.
//!
//! The prompt is piped to the process over stdin and stdout is the
//! completion, e.g. `ollama run llama3` or any wrapper script.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ModelProvider;

/// Default per-call timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Model provider using subprocess mode
#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProvider {
    /// Create a provider running `program` with `args`
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Parse a whitespace-separated command line such as `ollama run llama3`
    pub fn from_command_line(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .context("Provider command cannot be empty")?;
        Ok(Self::new(program, parts))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Spawn the command, write the prompt, collect stdout
    async fn run_subprocess(&self, prompt: &str) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn provider command '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("Failed to write prompt to provider stdin")?;
            // Dropping stdin signals EOF
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| {
                format!(
                    "Provider command '{}' timed out after {:?}",
                    self.program, self.timeout
                )
            })?
            .with_context(|| format!("Failed to wait for provider command '{}'", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Provider command '{}' failed with exit code {}: {}",
                self.program,
                exit_code,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout).context("Provider output is not valid UTF-8")?;

        Ok(stdout.trim_end().to_string())
    }

    /// Check that the command can be spawned
    pub async fn health_check(&self) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Provider command '{}' is not available", self.program))?;

        // Spawning is the check; the process itself is not needed
        let _ = child.start_kill();
        Ok(())
    }
}

#[async_trait]
impl ModelProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.program
    }

    async fn generate(&self, cancel: &CancellationToken, prompt: &str) -> Result<String> {
        debug!(program = %self.program, prompt_len = prompt.len(), "Invoking provider command");

        // Dropping the subprocess future kills the child
        tokio::select! {
            result = self.run_subprocess(prompt) => result,
            _ = cancel.cancelled() => anyhow::bail!("Provider command '{}' cancelled", self.program),
        }
    }
}
