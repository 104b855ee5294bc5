use serde::{Deserialize, Serialize};

/// A typed value flowing between execution cycles.
///
/// Every stage of a cycle produces an `Artifact` rather than raising:
/// tool output is `Text`, the joined result of a multi-action cycle is
/// `Composite`, and any soft failure is `Error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    Text { value: String },
    Composite { blocks: Vec<NamedArtifact> },
    Error { message: String },
}

/// One named block inside a [`Artifact::Composite`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedArtifact {
    pub name: String,
    pub artifact: Artifact,
}

impl Artifact {
    pub fn text(value: impl Into<String>) -> Self {
        Artifact::Text {
            value: value.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Artifact::Error {
            message: message.into(),
        }
    }

    pub fn composite(blocks: Vec<NamedArtifact>) -> Self {
        Artifact::Composite { blocks }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Artifact::Error { .. })
    }

    /// Flat text rendering used when an artifact feeds the next turn's
    /// prompt. Composite blocks render as `name: value` lines.
    pub fn render(&self) -> String {
        match self {
            Artifact::Text { value } => value.clone(),
            Artifact::Error { message } => format!("Error: {message}"),
            Artifact::Composite { blocks } => blocks
                .iter()
                .map(|block| format!("{}: {}", block.name, block.artifact.render()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl NamedArtifact {
    pub fn new(name: impl Into<String>, artifact: Artifact) -> Self {
        Self {
            name: name.into(),
            artifact,
        }
    }
}
