//! Tool-call detection, execution and synthesis.
//!
//! Generated text may contain directives of the form
//!
//! ```text
//! TOOL_CALL{"name": "search", "args": {"query": "rust"}}
//! ```
//!
//! The pipeline runs every directive through the [`ToolManager`] in the order
//! they appear, then makes exactly one more model call with the collected
//! results to produce the final answer. Tool failures are recorded per
//! directive and never escalate.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{ModelProvider, ToolManager, ToolSchema};

/// Marker that introduces a tool-call directive
pub const TOOL_CALL_MARKER: &str = "TOOL_CALL";

/// Prefix of the answer used when the synthesis call itself fails
pub const SYNTHESIS_FALLBACK_PREFIX: &str = "Tool execution completed:\n";

/// A tool-call directive found in generated text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,

    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Failure of a single tool directive
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("tool '{name}' failed: {message}")]
    Failed { name: String, message: String },

    #[error("tool '{name}' was cancelled before it ran")]
    Cancelled { name: String },
}

/// One executed directive and what it produced
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub call: ToolCall,
    pub result: Result<String, ToolError>,
}

impl ToolInvocation {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&ToolError> {
        self.result.as_ref().err()
    }

    /// Line describing the result, as shown to the model during synthesis
    pub fn summary_line(&self) -> String {
        match &self.result {
            Ok(content) => format!("Tool '{}' result: {}", self.call.name, content),
            Err(ToolError::Failed { message, .. }) => {
                format!("Tool '{}' failed: {}", self.call.name, message)
            }
            Err(err) => format!("Tool '{}' failed: {}", self.call.name, err),
        }
    }
}

/// Final answer plus everything that happened on the way
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRunOutcome {
    pub answer: String,

    /// Text produced by the first generation call
    pub initial: String,

    /// Executed directives in detection order
    pub invocations: Vec<ToolInvocation>,

    /// Error of the synthesis call, if it failed and the fallback was used
    pub synthesis_error: Option<String>,
}

impl ToolRunOutcome {
    fn unchanged(text: String) -> Self {
        Self {
            answer: text.clone(),
            initial: text,
            invocations: Vec::new(),
            synthesis_error: None,
        }
    }

    pub fn used_tools(&self) -> bool {
        !self.invocations.is_empty()
    }

    /// True when directives were found and every one of them failed
    pub fn all_failed(&self) -> bool {
        self.used_tools() && self.invocations.iter().all(|i| !i.is_success())
    }

    pub fn errors(&self) -> Vec<&ToolError> {
        self.invocations.iter().filter_map(ToolInvocation::error).collect()
    }
}

/// Find every well-formed directive in `text`, in order of appearance.
///
/// The marker must be followed immediately by a balanced JSON object with a
/// string `name` and, optionally, an object `args`. Anything else is ignored.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut cursor = 0;

    while let Some(found) = text[cursor..].find(TOOL_CALL_MARKER) {
        let body_start = cursor + found + TOOL_CALL_MARKER.len();
        let body = &text[body_start..];

        match balanced_object_len(body).and_then(|len| parse_directive(&body[..len]).map(|c| (len, c))) {
            Some((len, call)) => {
                calls.push(call);
                cursor = body_start + len;
            }
            None => cursor = body_start,
        }
    }

    calls
}

/// Byte length of the JSON object at the start of `text`, honouring string
/// literals and escapes. `None` if `text` does not start with a complete object.
fn balanced_object_len(text: &str) -> Option<usize> {
    if !text.starts_with('{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }

    None
}

fn parse_directive(body: &str) -> Option<ToolCall> {
    let Value::Object(mut object) = serde_json::from_str::<Value>(body).ok()? else {
        return None;
    };

    let name = match object.remove("name")? {
        Value::String(name) if !name.trim().is_empty() => name,
        _ => return None,
    };

    let args = match object.remove("args") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(args)) => args,
        Some(_) => return None,
    };

    Some(ToolCall { name, args })
}

/// Tool-usage instructions for a prompt; empty when there are no tools
pub fn format_tools_prompt(tools: &[ToolSchema]) -> String {
    if tools.is_empty() {
        return String::new();
    }

    let mut prompt = String::from("You have access to the following tools:\n\n");
    for tool in tools {
        prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        if !tool.parameters.is_null() {
            prompt.push_str(&format!("  Parameters: {}\n", tool.parameters));
        }
    }
    prompt.push_str(&format!(
        "\nTo use a tool, write a line of the form:\n{}{{\"name\": \"tool_name\", \"args\": {{\"parameter\": \"value\"}}}}\n",
        TOOL_CALL_MARKER
    ));
    prompt.push_str("You may call several tools. Their results will be given to you before your final answer.\n");
    prompt
}

/// Generate, detect and execute tool calls, then synthesize.
#[derive(Clone)]
pub struct ToolCallPipeline {
    provider: Arc<dyn ModelProvider>,
    tools: Option<Arc<dyn ToolManager>>,
}

impl ToolCallPipeline {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            tools: None,
        }
    }

    /// Attach a tool manager; without one the pipeline never runs tools
    pub fn with_tools(mut self, tools: Arc<dyn ToolManager>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn provider(&self) -> &dyn ModelProvider {
        self.provider.as_ref()
    }

    pub fn has_tools(&self) -> bool {
        self.tools.is_some()
    }

    /// Instructions describing the available tools, if a manager is attached
    pub async fn tool_instructions(&self, cancel: &CancellationToken) -> Result<Option<String>> {
        let Some(tools) = &self.tools else {
            return Ok(None);
        };
        let schemas = tools.list_tools(cancel).await?;
        let prompt = format_tools_prompt(&schemas);
        Ok((!prompt.is_empty()).then_some(prompt))
    }

    /// Run the full protocol for `prompt`.
    ///
    /// Only a failure of the first generation call is an error.
    #[instrument(skip_all, fields(provider = %self.provider.name()))]
    pub async fn complete(&self, cancel: &CancellationToken, prompt: &str) -> Result<ToolRunOutcome> {
        let generated = self.provider.generate(cancel, prompt).await?;
        Ok(self.resolve(cancel, prompt, generated).await)
    }

    /// Detect and execute directives in already generated text, then
    /// synthesize. Never fails.
    pub async fn resolve(&self, cancel: &CancellationToken, prompt: &str, generated: String) -> ToolRunOutcome {
        let Some(tools) = &self.tools else {
            return ToolRunOutcome::unchanged(generated);
        };

        let calls = parse_tool_calls(&generated);
        if calls.is_empty() {
            return ToolRunOutcome::unchanged(generated);
        }

        debug!(count = calls.len(), "Detected tool calls");

        let mut invocations = Vec::with_capacity(calls.len());
        for call in calls {
            let result = if cancel.is_cancelled() {
                Err(ToolError::Cancelled {
                    name: call.name.clone(),
                })
            } else {
                tools
                    .call_tool(cancel, &call.name, &call.args)
                    .await
                    .map(|output| output.content)
                    .map_err(|err| ToolError::Failed {
                        name: call.name.clone(),
                        message: format!("{:#}", err),
                    })
            };

            match &result {
                Ok(_) => info!(tool = %call.name, "Tool call succeeded"),
                Err(err) => warn!(tool = %call.name, error = %err, "Tool call failed"),
            }
            invocations.push(ToolInvocation { call, result });
        }

        let results = invocations
            .iter()
            .map(ToolInvocation::summary_line)
            .collect::<Vec<_>>()
            .join("\n");

        let synthesis_prompt = format!(
            "{}\n\nPrevious response: {}\n\nTool Results:\n{}\n\nPlease provide a final response based on the tool results above.",
            prompt, generated, results
        );

        let (answer, synthesis_error) = match self.provider.generate(cancel, &synthesis_prompt).await {
            Ok(answer) if !answer.trim().is_empty() => (answer, None),
            Ok(_) => {
                warn!("Synthesis returned no text, using tool results");
                (
                    format!("{}{}", SYNTHESIS_FALLBACK_PREFIX, results),
                    Some("synthesis returned no text".to_string()),
                )
            }
            Err(err) => {
                warn!(error = %err, "Synthesis failed, using tool results");
                (format!("{}{}", SYNTHESIS_FALLBACK_PREFIX, results), Some(format!("{:#}", err)))
            }
        };

        ToolRunOutcome {
            answer,
            initial: generated,
            invocations,
            synthesis_error,
        }
    }
}
