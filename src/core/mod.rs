//! Core orchestration logic.
//!
//! This module contains:
//! - Agent: the handler contract and per-invocation context
//! - Orchestration: modes and validated configuration
//! - Orchestrator: the runner for collaborative, sequential and loop modes
//! - Hooks: lifecycle callbacks around agent invocations
//! - Retry: per-agent retry with backoff
//! - Tools: tool-call detection, execution and synthesis
//! - Definition: YAML orchestration files

pub mod agent;
pub mod definition;
pub mod error;
pub mod hooks;
pub mod orchestration;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod tools;

// Re-export commonly used types
pub use agent::{agent_fn, AgentContext, AgentFn, AgentHandler};
pub use definition::{AgentDefinition, OrchestrationFile};
pub use error::{AgentError, ConfigError, OrchestrationError};
pub use hooks::{HookArgs, HookFn, HookPoint, HookRegistry};
pub use orchestration::{
    AgentEntry, CollaborativeMerge, OrchestrationBuilder, OrchestrationConfig, OrchestrationMode,
    TerminationPredicate,
};
pub use orchestrator::{execute, Orchestrator, LOOP_COMPLETED_KEY};
pub use report::{AgentOutcome, AgentOutcomes, AggregatedResult, Execution, PartialRun};
pub use retry::RetryPolicy;
pub use tools::{
    format_tools_prompt, parse_tool_calls, ToolCall, ToolCallPipeline, ToolError, ToolInvocation,
    ToolRunOutcome, TOOL_CALL_MARKER,
};
