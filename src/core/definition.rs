//! Declarative orchestration files.
//!
//! An orchestration is described in YAML and turned into an
//! [`OrchestrationConfig`] once every agent definition has been resolved to a
//! handler:
//!
//! ```yaml
//! name: review
//! description: Draft, then polish
//! mode: sequential
//! order: [writer, editor]
//! timeout_seconds: 120
//! agents:
//!   - name: writer
//!     system_prompt: Write a first draft.
//!     output_key: draft
//!   - name: editor
//!     system_prompt: Polish the draft.
//!     input_keys: [draft]
//!     output_key: final
//!     retry:
//!       max_retries: 2
//!       initial_delay_ms: 500
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::AgentResult;

use super::agent::{agent_fn, AgentHandler};
use super::orchestration::{CollaborativeMerge, OrchestrationConfig, OrchestrationMode};
use super::retry::RetryPolicy;

/// A complete orchestration definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationFile {
    /// Orchestration name (used in logs and CLI output)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    pub mode: OrchestrationMode,

    /// Agents in declaration order
    pub agents: Vec<AgentDefinition>,

    /// Execution order (sequential mode)
    #[serde(default)]
    pub order: Option<Vec<String>>,

    /// Overall deadline; absent or zero means unbounded
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Loop bound (loop mode)
    #[serde(default)]
    pub max_iterations: Option<u32>,

    /// Collaborative fan-out limit
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    #[serde(default)]
    pub merge: CollaborativeMerge,

    /// Retry policy for agents without their own
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// One agent entry of an orchestration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique agent name
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Instructions placed at the top of every prompt
    #[serde(default)]
    pub system_prompt: String,

    /// State keys included in the prompt
    #[serde(default)]
    pub input_keys: Vec<String>,

    /// State key the answer is stored under (defaults to the agent name)
    #[serde(default)]
    pub output_key: Option<String>,

    /// Provider command overriding the default one
    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl AgentDefinition {
    /// State key the agent writes its answer to
    pub fn output_key(&self) -> &str {
        self.output_key.as_deref().unwrap_or(&self.name)
    }
}

impl OrchestrationFile {
    /// Load an orchestration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read orchestration file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid orchestration file: {}", path.display()))
    }

    /// Parse an orchestration from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse orchestration YAML")
    }

    /// Fill in settings the file leaves unset
    pub fn with_defaults(mut self, timeout: Duration, max_iterations: u32) -> Self {
        if self.timeout_seconds.is_none() {
            self.timeout_seconds = Some(timeout.as_secs());
        }
        if self.mode == OrchestrationMode::Loop && self.max_iterations.is_none() {
            self.max_iterations = Some(max_iterations);
        }
        self
    }

    /// Validate the definition without resolving any agent
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Orchestration name cannot be empty");
        }

        self.to_config(|_| Ok(Arc::new(agent_fn(|_, _, _| Ok(AgentResult::empty())))))?;
        Ok(())
    }

    /// Build the runtime configuration, resolving each definition to a handler
    pub fn to_config<F>(&self, mut resolve: F) -> Result<OrchestrationConfig>
    where
        F: FnMut(&AgentDefinition) -> Result<Arc<dyn AgentHandler>>,
    {
        let mut builder = OrchestrationConfig::builder(self.mode).merge(self.merge);

        for definition in &self.agents {
            let handler = resolve(definition)
                .with_context(|| format!("Failed to set up agent '{}'", definition.name))?;
            builder = builder.agent_arc(definition.name.clone(), handler);
            if let Some(policy) = &definition.retry {
                builder = builder.retry_for(definition.name.clone(), policy.clone());
            }
        }

        if let Some(order) = &self.order {
            builder = builder.order(order.iter().cloned());
        }
        if let Some(seconds) = self.timeout_seconds {
            builder = builder.timeout(Duration::from_secs(seconds));
        }
        if let Some(max_iterations) = self.max_iterations {
            builder = builder.max_iterations(max_iterations);
        }
        if let Some(limit) = self.max_concurrency {
            builder = builder.max_concurrency(limit);
        }
        if let Some(policy) = &self.retry {
            builder = builder.retry(policy.clone());
        }

        builder
            .build()
            .with_context(|| format!("Invalid orchestration '{}'", self.name))
    }

    /// Get an agent definition by name
    pub fn get_agent(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.name == name)
    }
}
