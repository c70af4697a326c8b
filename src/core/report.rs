//! Aggregated results and per-agent diagnostics returned by the runner.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::domain::{AgentResult, State};

use super::error::AgentError;
use super::orchestration::OrchestrationMode;

/// What happened to one agent during an invocation
#[derive(Debug)]
pub enum AgentOutcome {
    /// The agent returned a result
    Completed(AgentResult),

    /// The agent failed, timed out, was cancelled or panicked.
    ///
    /// `state` is the partial state it left behind, kept for diagnostics only.
    Failed {
        error: AgentError,
        state: Option<State>,
    },

    /// The agent never ran (a sequential pipeline aborted before reaching it)
    NotRun,
}

impl AgentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn result(&self) -> Option<&AgentResult> {
        match self {
            Self::Completed(result) => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&AgentError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Short status label for summaries
    pub fn status(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Failed { error, .. } if error.is_timeout() => "timed_out",
            Self::Failed { error, .. } if error.is_cancelled() => "cancelled",
            Self::Failed { .. } => "failed",
            Self::NotRun => "not_run",
        }
    }
}

/// Per-agent outcomes keyed by agent name
pub type AgentOutcomes = BTreeMap<String, AgentOutcome>;

/// The combined result of one orchestration invocation
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResult {
    pub mode: OrchestrationMode,

    /// Collaborative: object of successful agent outputs keyed by name.
    /// Sequential: the last agent's output. Loop: the last iteration's output.
    pub output: Value,

    /// Final merged or threaded state
    pub state: State,

    /// Number of agent invocations that completed successfully
    pub invocations: u32,

    /// Agents in the order their results were folded into `state`
    pub completion_order: Vec<String>,

    pub duration_ms: u64,
}

impl AggregatedResult {
    /// The output as text: strings verbatim, anything else as pretty JSON
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

/// A successful invocation: aggregated result plus diagnostics
#[derive(Debug)]
pub struct Execution {
    pub result: AggregatedResult,
    pub agents: AgentOutcomes,
}

impl Execution {
    pub fn outcome(&self, agent: &str) -> Option<&AgentOutcome> {
        self.agents.get(agent)
    }

    /// Names of agents that did not complete, in name order
    pub fn failed_agents(&self) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_partial(&self) -> bool {
        !self.failed_agents().is_empty()
    }
}

/// Diagnostics attached to a terminal error
#[derive(Debug)]
pub struct PartialRun {
    /// State as of the last successful step
    pub state: State,
    pub agents: AgentOutcomes,
}

impl PartialRun {
    /// True when at least one agent failed and every failure matches `kind`
    pub(crate) fn all_failed_with(&self, kind: fn(&AgentError) -> bool) -> bool {
        let mut errors = self.agents.values().filter_map(AgentOutcome::error).peekable();
        errors.peek().is_some() && errors.all(kind)
    }
}
