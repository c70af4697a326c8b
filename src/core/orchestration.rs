//! Orchestration modes and the validated configuration that drives a run.
//!
//! Configurations are assembled with [`OrchestrationConfig::builder`] and
//! validated once in `build()`; an invalid configuration never reaches the
//! runner.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::State;

use super::agent::AgentHandler;
use super::error::ConfigError;
use super::hooks::HookRegistry;
use super::retry::RetryPolicy;

/// How events are distributed to agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    /// Every agent runs concurrently on its own clone of the state
    #[serde(alias = "collaborate", alias = "parallel")]
    Collaborative,

    /// Agents run one after another in an explicit order, sharing one state
    Sequential,

    /// A single agent runs repeatedly, threading its state between iterations
    Loop,
}

impl OrchestrationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collaborative => "collaborative",
            Self::Sequential => "sequential",
            Self::Loop => "loop",
        }
    }
}

impl fmt::Display for OrchestrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order in which collaborative branch states are folded into the result.
///
/// Later branches win on colliding keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborativeMerge {
    /// Branches merge in the order they finished; ties go to declaration order
    #[default]
    CompletionOrder,

    /// Branches merge in the order the agents were declared
    DeclarationOrder,
}

/// Early-exit check evaluated after every loop iteration (1-indexed)
pub type TerminationPredicate = Arc<dyn Fn(&State, u32) -> bool + Send + Sync>;

/// A named agent registered with a configuration
#[derive(Clone)]
pub struct AgentEntry {
    pub name: String,
    pub handler: Arc<dyn AgentHandler>,
}

/// Immutable, validated orchestration configuration
#[derive(Clone)]
pub struct OrchestrationConfig {
    mode: OrchestrationMode,
    agents: Vec<AgentEntry>,
    order: Option<Vec<String>>,
    timeout: Option<Duration>,
    max_iterations: Option<u32>,
    termination: Option<TerminationPredicate>,
    max_concurrency: Option<usize>,
    merge: CollaborativeMerge,
    retry: Option<RetryPolicy>,
    agent_retry: HashMap<String, RetryPolicy>,
    hooks: Option<Arc<HookRegistry>>,
}

impl OrchestrationConfig {
    /// Start building a configuration for the given mode
    pub fn builder(mode: OrchestrationMode) -> OrchestrationBuilder {
        OrchestrationBuilder::new(mode)
    }

    /// Check every structural rule for the configured mode
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgents);
        }

        let mut names = HashSet::new();
        for entry in &self.agents {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::EmptyAgentName);
            }
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigError::DuplicateAgent(entry.name.clone()));
            }
        }

        if self.max_concurrency == Some(0) {
            return Err(ConfigError::ZeroConcurrency);
        }

        if let Some(policy) = &self.retry {
            policy.validate()?;
        }
        for (agent, policy) in &self.agent_retry {
            if !names.contains(agent.as_str()) {
                return Err(ConfigError::UnknownRetryAgent(agent.clone()));
            }
            policy.validate()?;
        }

        match self.mode {
            OrchestrationMode::Collaborative => {}
            OrchestrationMode::Loop => {
                if self.agents.len() != 1 {
                    return Err(ConfigError::LoopAgentCount(self.agents.len()));
                }
                if self.max_iterations.unwrap_or(0) < 1 {
                    return Err(ConfigError::MissingMaxIterations);
                }
            }
            OrchestrationMode::Sequential => {
                let order = self.order.as_ref().ok_or(ConfigError::MissingOrder)?;
                if order.is_empty() {
                    return Err(ConfigError::MissingOrder);
                }

                let mut seen = HashSet::new();
                for name in order {
                    if !names.contains(name.as_str()) {
                        return Err(ConfigError::UnknownAgentInOrder(name.clone()));
                    }
                    if !seen.insert(name.as_str()) {
                        return Err(ConfigError::DuplicateInOrder(name.clone()));
                    }
                }

                if let Some(missing) = self.agents.iter().find(|e| !seen.contains(e.name.as_str())) {
                    return Err(ConfigError::UnorderedAgent(missing.name.clone()));
                }
            }
        }

        Ok(())
    }

    pub fn mode(&self) -> OrchestrationMode {
        self.mode
    }

    /// Agents in declaration order
    pub fn agents(&self) -> &[AgentEntry] {
        &self.agents
    }

    /// Look up a registered agent by name
    pub fn agent(&self, name: &str) -> Option<&AgentEntry> {
        self.agents.iter().find(|e| e.name == name)
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.iter().map(|e| e.name.as_str()).collect()
    }

    /// Explicit sequential order, if one was configured
    pub fn order(&self) -> Option<&[String]> {
        self.order.as_deref()
    }

    /// Overall deadline for one invocation; `None` means unbounded
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_iterations(&self) -> Option<u32> {
        self.max_iterations
    }

    pub fn termination(&self) -> Option<&TerminationPredicate> {
        self.termination.as_ref()
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    pub fn merge(&self) -> CollaborativeMerge {
        self.merge
    }

    /// Retry policy for an agent: its own, else the default, else none
    pub fn retry_policy(&self, agent: &str) -> Option<&RetryPolicy> {
        self.agent_retry.get(agent).or(self.retry.as_ref())
    }

    pub fn hooks(&self) -> Option<&Arc<HookRegistry>> {
        self.hooks.as_ref()
    }
}

impl fmt::Debug for OrchestrationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationConfig")
            .field("mode", &self.mode)
            .field("agents", &self.agent_names())
            .field("order", &self.order)
            .field("timeout", &self.timeout)
            .field("max_iterations", &self.max_iterations)
            .field("termination", &self.termination.is_some())
            .field("max_concurrency", &self.max_concurrency)
            .field("merge", &self.merge)
            .field("retry", &self.retry)
            .field("agent_retry", &self.agent_retry)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Fluent builder for [`OrchestrationConfig`]
pub struct OrchestrationBuilder {
    config: OrchestrationConfig,
}

impl OrchestrationBuilder {
    fn new(mode: OrchestrationMode) -> Self {
        Self {
            config: OrchestrationConfig {
                mode,
                agents: Vec::new(),
                order: None,
                timeout: None,
                max_iterations: None,
                termination: None,
                max_concurrency: None,
                merge: CollaborativeMerge::default(),
                retry: None,
                agent_retry: HashMap::new(),
                hooks: None,
            },
        }
    }

    /// Register an agent under a unique name
    pub fn agent(self, name: impl Into<String>, handler: impl AgentHandler + 'static) -> Self {
        self.agent_arc(name, Arc::new(handler))
    }

    /// Register an already shared agent
    pub fn agent_arc(mut self, name: impl Into<String>, handler: Arc<dyn AgentHandler>) -> Self {
        self.config.agents.push(AgentEntry {
            name: name.into(),
            handler,
        });
        self
    }

    /// Explicit execution order (required for sequential mode)
    pub fn order<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.order = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Overall deadline; a zero duration disables the timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Upper bound on loop repetitions
    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = Some(max_iterations);
        self
    }

    /// Stop a loop early once the predicate returns true
    pub fn until<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&State, u32) -> bool + Send + Sync + 'static,
    {
        self.config.termination = Some(Arc::new(predicate));
        self
    }

    /// Bound the number of collaborative branches running at once
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.config.max_concurrency = Some(limit);
        self
    }

    pub fn merge(mut self, merge: CollaborativeMerge) -> Self {
        self.config.merge = merge;
        self
    }

    /// Retry policy for every agent without one of its own
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = Some(policy);
        self
    }

    /// Retry policy for one agent
    pub fn retry_for(mut self, agent: impl Into<String>, policy: RetryPolicy) -> Self {
        self.config.agent_retry.insert(agent.into(), policy);
        self
    }

    /// Lifecycle callbacks run around every agent invocation
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.config.hooks = Some(Arc::new(hooks));
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> Result<OrchestrationConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
