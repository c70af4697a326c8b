//! Built-in agents.
//!
//! [`PromptAgent`] turns an event and selected state entries into a prompt,
//! runs it through the tool-call pipeline and stores the answer in state.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::{AgentContext, AgentDefinition, AgentError, AgentHandler, ToolCallPipeline};
use crate::domain::{AgentResult, Event, State};

/// Metadata key recording tool failures of the last run
pub const TOOL_ERRORS_KEY: &str = "tool_errors";

/// Agent backed by a model provider and optional tools
pub struct PromptAgent {
    name: String,
    system_prompt: String,
    input_keys: Vec<String>,
    output_key: String,
    pipeline: ToolCallPipeline,
}

impl PromptAgent {
    /// Create an agent that stores its answer under its own name
    pub fn new(name: impl Into<String>, pipeline: ToolCallPipeline) -> Self {
        let name = name.into();
        Self {
            output_key: name.clone(),
            name,
            system_prompt: String::new(),
            input_keys: Vec::new(),
            pipeline,
        }
    }

    /// Create an agent from an orchestration file entry
    pub fn from_definition(definition: &AgentDefinition, pipeline: ToolCallPipeline) -> Self {
        Self::new(definition.name.clone(), pipeline)
            .with_system_prompt(definition.system_prompt.clone())
            .with_input_keys(definition.input_keys.iter().cloned())
            .with_output_key(definition.output_key())
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// State keys whose values are included in the prompt
    pub fn with_input_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    /// Assemble the prompt for one invocation
    pub fn build_prompt(&self, event: &Event, state: &State, tool_instructions: Option<&str>) -> String {
        let mut sections = Vec::new();

        if !self.system_prompt.trim().is_empty() {
            sections.push(self.system_prompt.trim().to_string());
        }

        if let Some(instructions) = tool_instructions {
            sections.push(instructions.trim_end().to_string());
        }

        let input = match event.message() {
            Some(message) => message.to_string(),
            None => Value::Object(event.data().clone()).to_string(),
        };
        sections.push(format!("Input:\n{}", input));

        for key in &self.input_keys {
            if let Some(value) = state.get(key) {
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                sections.push(format!("{}:\n{}", key, text));
            }
        }

        sections.join("\n\n")
    }
}

#[async_trait]
impl AgentHandler for PromptAgent {
    #[instrument(skip_all, fields(agent = %self.name))]
    async fn run(&self, ctx: &AgentContext, event: &Event, state: &State) -> Result<AgentResult, AgentError> {
        let cancel = ctx.cancellation_token();

        let instructions = match self.pipeline.tool_instructions(cancel).await {
            Ok(instructions) => instructions,
            Err(err) => {
                warn!(error = %err, "Failed to list tools, continuing without them");
                None
            }
        };

        let prompt = self.build_prompt(event, state, instructions.as_deref());
        debug!(prompt_len = prompt.len(), "Built prompt");

        let outcome = match self.pipeline.complete(cancel, &prompt).await {
            Ok(outcome) => outcome,
            Err(_) if ctx.is_cancelled() => return Err(AgentError::Cancelled),
            Err(err) => return Err(err.into()),
        };

        let errors = outcome.errors();
        if !errors.is_empty() {
            let summary = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            warn!(failed = errors.len(), "Tool calls failed");
            state.set_meta(TOOL_ERRORS_KEY, summary);
        } else {
            state.remove_meta(TOOL_ERRORS_KEY);
        }

        state.set(self.output_key.clone(), outcome.answer.clone());

        Ok(AgentResult::new(outcome.answer))
    }
}
