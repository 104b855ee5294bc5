use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::artifact::Artifact;
use crate::tools::Tool;

/// Name given to the synthetic action a soft failure is converted into.
pub const ERROR_ACTION: &str = "error";

/// One discrete tool invocation proposed within a single model turn.
///
/// `tool` and `output` are runtime-only: `tool` is attached by the
/// validation stage, `output` by the execution stage. Serialization
/// round-trips only `tag`/`name`/`path`/`input`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Action {
    pub tag: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub input: Map<String, Value>,
    #[serde(skip)]
    pub tool: Option<Arc<Tool>>,
    #[serde(skip)]
    pub output: Option<Artifact>,
}

impl Action {
    pub fn new(tag: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            name: name.into(),
            path: None,
            input: Map::new(),
            tool: None,
            output: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input = input;
        self
    }

    /// Builds the synthetic action a parse or validation failure is
    /// soft-converted into. The message rides in `input["message"]` so
    /// the error action serializes through the same surface as any
    /// other action.
    pub fn error(message: impl Into<String>) -> Self {
        let mut input = Map::new();
        input.insert("message".to_string(), Value::String(message.into()));
        Self {
            tag: ERROR_ACTION.to_string(),
            name: ERROR_ACTION.to_string(),
            path: None,
            input,
            tool: None,
            output: None,
        }
    }

    /// Like [`Action::error`], but scoped to one failing action: the
    /// synthetic entry's tag is derived from the original's so sibling
    /// actions keep executing and tags stay unique within the list.
    pub fn scoped_error(tag: &str, message: impl Into<String>) -> Self {
        let mut action = Action::error(message);
        action.tag = format!("{tag}:error");
        action
    }

    pub fn is_error(&self) -> bool {
        self.name == ERROR_ACTION
    }

    pub fn error_message(&self) -> Option<&str> {
        if !self.is_error() {
            return None;
        }
        self.input.get("message").and_then(Value::as_str)
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
            && self.name == other.name
            && self.path == other.path
            && self.input == other.input
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn error_action_carries_message() {
        let action = Action::error("bad json");
        assert!(action.is_error());
        assert_eq!(action.error_message(), Some("bad json"));
    }

    #[test]
    fn serde_round_trips_identity_fields() {
        let mut input = Map::new();
        input.insert("x".to_string(), json!(1));
        let action = Action::new("a1", "Calc").with_path("add").with_input(input);

        let encoded = serde_json::to_string(&action).expect("encodes");
        let decoded: Action = serde_json::from_str(&encoded).expect("decodes");
        assert_eq!(decoded, action);
        assert!(decoded.tool.is_none());
        assert!(decoded.output.is_none());
    }

    #[test]
    fn empty_input_omitted_from_serialization() {
        let action = Action::new("a1", "Calc");
        let encoded = serde_json::to_value(&action).expect("encodes");
        assert!(encoded.get("input").is_none());
        assert!(encoded.get("path").is_none());
    }
}
