//! Ports to external systems.
//!
//! Agents reach language models through [`ModelProvider`] and tools through
//! [`ToolManager`]. Both return `anyhow::Result`; the tool-call pipeline
//! absorbs tool failures, agents decide what a provider failure means.

pub mod command;
pub mod registry;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

pub use command::CommandProvider;
pub use registry::ToolRegistry;

/// Text-generation capability
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Generate a completion for the prompt
    async fn generate(&self, cancel: &CancellationToken, prompt: &str) -> Result<String>;
}

/// Tool discovery and invocation
#[async_trait]
pub trait ToolManager: Send + Sync {
    /// Describe every tool that can be called
    async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<ToolSchema>>;

    /// Call a tool by name
    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput>;
}

/// Description of a callable tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,

    pub description: String,

    /// JSON schema of the arguments object
    #[serde(default)]
    pub parameters: Value,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Value::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Output from a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The content returned by the tool
    pub content: String,
}

impl ToolOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}
