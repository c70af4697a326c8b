//! In-process tool manager backed by registered closures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{ToolManager, ToolOutput, ToolSchema};

type ToolFn = Arc<dyn Fn(&Map<String, Value>) -> Result<String> + Send + Sync>;

struct RegisteredTool {
    schema: ToolSchema,
    call: ToolFn,
}

/// Tool manager holding named tools in memory
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a tool with the same name is replaced
    pub fn register<F>(&mut self, schema: ToolSchema, call: F)
    where
        F: Fn(&Map<String, Value>) -> Result<String> + Send + Sync + 'static,
    {
        self.tools.insert(
            schema.name.clone(),
            RegisteredTool {
                schema,
                call: Arc::new(call),
            },
        );
    }

    /// Builder form of [`ToolRegistry::register`]
    pub fn with_tool<F>(mut self, schema: ToolSchema, call: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<String> + Send + Sync + 'static,
    {
        self.register(schema, call);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl ToolManager for ToolRegistry {
    async fn list_tools(&self, _cancel: &CancellationToken) -> Result<Vec<ToolSchema>> {
        Ok(self.tools.values().map(|t| t.schema.clone()).collect())
    }

    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput> {
        if cancel.is_cancelled() {
            anyhow::bail!("Tool '{}' cancelled", name);
        }

        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool '{}'", name))?;

        (tool.call)(args).map(ToolOutput::new)
    }
}
