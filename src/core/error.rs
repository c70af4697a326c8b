//! Error taxonomy for configuration, agent and orchestration failures.

use thiserror::Error;

use super::orchestration::OrchestrationMode;
use super::report::PartialRun;

/// Configuration errors, raised before any agent runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("orchestration needs at least one agent")]
    NoAgents,

    #[error("agent name cannot be empty")]
    EmptyAgentName,

    #[error("duplicate agent name: {0}")]
    DuplicateAgent(String),

    #[error("loop mode requires exactly one agent, got {0}")]
    LoopAgentCount(usize),

    #[error("loop mode requires max_iterations >= 1")]
    MissingMaxIterations,

    #[error("sequential mode requires an explicit agent order")]
    MissingOrder,

    #[error("sequential order references unknown agent '{0}'")]
    UnknownAgentInOrder(String),

    #[error("agent '{0}' appears more than once in the sequential order")]
    DuplicateInOrder(String),

    #[error("agent '{0}' is registered but missing from the sequential order")]
    UnorderedAgent(String),

    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("retry policy set for unknown agent '{0}'")]
    UnknownRetryAgent(String),

    #[error("invalid retry policy: {0}")]
    InvalidRetry(String),
}

/// Failure of a single agent invocation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// The agent itself reported an error (message includes the cause chain)
    #[error("{0}")]
    Failed(String),

    /// The orchestration deadline passed while the agent was running
    #[error("timed out after {elapsed_ms}ms")]
    TimedOut { elapsed_ms: u64 },

    /// The caller cancelled the orchestration while the agent was running
    #[error("cancelled")]
    Cancelled,

    /// The agent task panicked
    #[error("panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{:#}", err))
    }
}

impl AgentError {
    /// Build a `Failed` error from a message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Terminal orchestration errors.
///
/// A caller receives either a usable result or exactly one of these.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("invalid orchestration config: {0}")]
    Config(#[from] ConfigError),

    #[error("{mode} orchestration cancelled before any agent ran")]
    Cancelled { mode: OrchestrationMode },

    #[error(
        "{mode} orchestration aborted: agent '{agent}'{} failed: {source}",
        iteration_suffix(.iteration)
    )]
    AgentFailed {
        mode: OrchestrationMode,
        agent: String,
        iteration: Option<u32>,
        source: AgentError,
        partial: Box<PartialRun>,
    },

    #[error("{mode} orchestration failed: all agents failed ({summary})")]
    AllAgentsFailed {
        mode: OrchestrationMode,
        summary: String,
        partial: Box<PartialRun>,
    },
}

fn iteration_suffix(iteration: &Option<u32>) -> String {
    iteration
        .map(|i| format!(" (iteration {})", i))
        .unwrap_or_default()
}

impl OrchestrationError {
    /// Diagnostics gathered before the run was aborted
    pub fn partial(&self) -> Option<&PartialRun> {
        match self {
            Self::AgentFailed { partial, .. } | Self::AllAgentsFailed { partial, .. } => {
                Some(partial.as_ref())
            }
            _ => None,
        }
    }

    /// Whether the run failed because of cancellation, before or during execution
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::AgentFailed { source, .. } => source.is_cancelled(),
            Self::AllAgentsFailed { partial, .. } => partial.all_failed_with(AgentError::is_cancelled),
            Self::Config(_) => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::AgentFailed { source, .. } => source.is_timeout(),
            Self::AllAgentsFailed { partial, .. } => partial.all_failed_with(AgentError::is_timeout),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::State;
    use std::collections::BTreeMap;

    #[test]
    fn test_agent_failed_message_names_mode_and_agent() {
        let err = OrchestrationError::AgentFailed {
            mode: OrchestrationMode::Loop,
            agent: "refiner".to_string(),
            iteration: Some(3),
            source: AgentError::msg("model unavailable"),
            partial: Box::new(PartialRun {
                state: State::new(),
                agents: BTreeMap::new(),
            }),
        };

        assert_eq!(
            err.to_string(),
            "loop orchestration aborted: agent 'refiner' (iteration 3) failed: model unavailable"
        );
        assert!(err.partial().is_some());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_config_error_conversion() {
        let err: OrchestrationError = ConfigError::NoAgents.into();
        assert!(matches!(err, OrchestrationError::Config(ConfigError::NoAgents)));
        assert!(err.partial().is_none());
    }

    #[test]
    fn test_agent_error_kinds() {
        assert!(AgentError::TimedOut { elapsed_ms: 5 }.is_timeout());
        assert!(AgentError::Cancelled.is_cancelled());
        let err = anyhow::anyhow!("connection refused").context("model call failed");
        let from_anyhow: AgentError = err.into();
        assert_eq!(
            from_anyhow.to_string(),
            "model call failed: connection refused"
        );
    }
}
