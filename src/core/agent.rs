//! The agent contract consumed by the runner.
//!
//! Concrete agents live outside the engine; the runner only sees
//! `Arc<dyn AgentHandler>` values registered under unique names.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{AgentResult, Event, State};

use super::error::AgentError;
use super::orchestration::OrchestrationMode;

/// Per-invocation context handed to an agent
#[derive(Debug, Clone)]
pub struct AgentContext {
    agent: String,
    mode: OrchestrationMode,
    iteration: Option<u32>,
    cancel: CancellationToken,
}

impl AgentContext {
    pub fn new(agent: impl Into<String>, mode: OrchestrationMode, cancel: CancellationToken) -> Self {
        Self {
            agent: agent.into(),
            mode,
            iteration: None,
            cancel,
        }
    }

    /// Set the 1-indexed loop iteration
    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    /// Name the agent was registered under
    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn mode(&self) -> OrchestrationMode {
        self.mode
    }

    /// Current loop iteration (loop mode only)
    pub fn iteration(&self) -> Option<u32> {
        self.iteration
    }

    /// Cancellation signal shared by every branch of the invocation.
    ///
    /// Agents should check it at their suspension points and return promptly.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the invocation is cancelled or times out
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A unit of work run by the orchestrator
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Process the event, reading and mutating `state` in place.
    ///
    /// Return an error to signal failure; the state is then not trusted for
    /// aggregation.
    async fn run(
        &self,
        ctx: &AgentContext,
        event: &Event,
        state: &State,
    ) -> Result<AgentResult, AgentError>;
}

/// Adapter turning a synchronous closure into an [`AgentHandler`]
pub struct AgentFn<F>(F);

/// Wrap a closure as an agent
pub fn agent_fn<F>(f: F) -> AgentFn<F>
where
    F: Fn(&AgentContext, &Event, &State) -> Result<AgentResult, AgentError> + Send + Sync,
{
    AgentFn(f)
}

#[async_trait]
impl<F> AgentHandler for AgentFn<F>
where
    F: Fn(&AgentContext, &Event, &State) -> Result<AgentResult, AgentError> + Send + Sync,
{
    async fn run(
        &self,
        ctx: &AgentContext,
        event: &Event,
        state: &State,
    ) -> Result<AgentResult, AgentError> {
        (self.0)(ctx, event, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_agent_fn_mutates_state() {
        let agent = agent_fn(|ctx, event, state| {
            state.set("seen", event.message().unwrap_or_default());
            Ok(AgentResult::new(ctx.agent().to_string()))
        });

        let ctx = AgentContext::new("echo", OrchestrationMode::Sequential, CancellationToken::new());
        let state = State::new();
        let result = agent
            .run(&ctx, &Event::from_message("ping"), &state)
            .await
            .unwrap();

        assert_eq!(result.output, json!("echo"));
        assert_eq!(state.get("seen"), Some(json!("ping")));
    }

    #[test]
    fn test_context_iteration() {
        let token = CancellationToken::new();
        let ctx = AgentContext::new("a", OrchestrationMode::Loop, token.clone()).with_iteration(2);
        assert_eq!(ctx.iteration(), Some(2));
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
