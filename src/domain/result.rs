//! Per-invocation agent results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::State;

/// The value produced by one agent invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    /// Final textual or structured output of the agent
    pub output: Value,

    /// State reflecting the agent's mutations.
    ///
    /// Agents usually leave this empty and mutate the state they were handed;
    /// a returned state replaces the threaded state in sequential and loop runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,

    /// Wall-clock time of the invocation, filled in by the runner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl AgentResult {
    /// Create a result with the given output
    pub fn new(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
            state: None,
            duration_ms: None,
        }
    }

    /// Create a result with no output
    pub fn empty() -> Self {
        Self::new(Value::Null)
    }

    /// Attach a replacement state
    pub fn with_state(mut self, state: State) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// The output as text: strings verbatim, anything else as JSON
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_text() {
        assert_eq!(AgentResult::new("plain").output_text(), "plain");
        assert_eq!(AgentResult::new(json!({"a": 1})).output_text(), r#"{"a":1}"#);
        assert_eq!(AgentResult::empty().output_text(), "");
    }

    #[test]
    fn test_result_with_state_serialization() {
        let state = State::new();
        state.set("k", "v");
        let result = AgentResult::new("done").with_state(state).with_duration(12);

        let json = serde_json::to_string(&result).unwrap();
        let parsed: AgentResult = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.duration_ms, Some(12));
        assert_eq!(parsed.state.unwrap().get_str("k"), Some("v".to_string()));
    }
}
