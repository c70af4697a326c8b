//! agentflow - Multi-agent orchestration runner
//!
//! Runs a set of named agents against an event in one of three modes:
//!
//! - **Collaborative**: every agent runs concurrently on its own copy of the
//!   state; successful branches are merged in completion order and a single
//!   failure does not abort the others.
//! - **Sequential**: agents run in an explicit order, each seeing the state
//!   left by the previous one; the first failure aborts the run.
//! - **Loop**: one agent runs repeatedly until a termination predicate, its
//!   own completion signal or the iteration bound stops it.
//!
//! Agents that talk to language models can embed tool-call directives in
//! their output; [`core::ToolCallPipeline`] executes them and folds the
//! results into a final answer.
//!
//! # Modules
//!
//! - `domain`: Event, State and per-agent results
//! - `core`: Configuration, the runner, the tool-call pipeline, YAML files
//! - `adapters`: Model provider and tool manager ports plus built-in adapters
//! - `agents`: Built-in prompt agent
//! - `config`: Settings resolution for the binary
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```no_run
//! use agentflow::{agent_fn, AgentResult, Event, OrchestrationConfig, OrchestrationMode, Orchestrator, State};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrchestrationConfig::builder(OrchestrationMode::Sequential)
//!     .agent("collector", agent_fn(|_, _, state| {
//!         state.set("data", "raw");
//!         Ok(AgentResult::empty())
//!     }))
//!     .agent("formatter", agent_fn(|_, _, state| {
//!         state.set("data", "formatted");
//!         Ok(AgentResult::empty())
//!     }))
//!     .order(["collector", "formatter"])
//!     .build()?;
//!
//! let execution = Orchestrator::new(config)
//!     .execute(&CancellationToken::new(), &Event::from_message("go"), State::new())
//!     .await?;
//! assert_eq!(execution.result.state.get_str("data").as_deref(), Some("formatted"));
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod agents;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::adapters::{CommandProvider, ModelProvider, ToolManager, ToolOutput, ToolRegistry, ToolSchema};
pub use crate::agents::PromptAgent;
pub use crate::core::{
    agent_fn, execute, AgentContext, AgentError, AgentHandler, AgentOutcome, AggregatedResult,
    CollaborativeMerge, ConfigError, Execution, HookArgs, HookPoint, HookRegistry, OrchestrationConfig,
    OrchestrationError, OrchestrationFile, OrchestrationMode, Orchestrator, RetryPolicy, ToolCallPipeline,
};
pub use crate::domain::{AgentResult, Event, MergePolicy, State};
