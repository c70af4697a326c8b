//! Domain types for the agentflow runner.
//!
//! This module contains the core data structures:
//! - Event: Immutable per-invocation input
//! - State: Mutable, shared key/value and metadata store
//! - AgentResult: Output of a single agent invocation

pub mod event;
pub mod result;
pub mod state;

// Re-export commonly used types
pub use event::{Event, MESSAGE_KEY, SESSION_ID_KEY};
pub use result::AgentResult;
pub use state::{MergePolicy, State, StateDelta, StateSnapshot, PROCESSED_BY_KEY};
