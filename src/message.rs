use std::ops::AddAssign;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ProducerError;

/// A pinned, boxed, `Send` stream of response fragments.
///
/// Produced by a model driver, consumed by
/// [`DeltaAggregator`](crate::DeltaAggregator).
pub type DeltaStream = Pin<Box<dyn Stream<Item = DeltaContent> + Send>>;

/// What a model driver hands back for one turn: either a complete
/// message or a stream of fragments to reassemble.
pub enum ModelOutput {
    Complete(Message),
    Streamed(DeltaStream),
}

/// The network-facing collaborator that yields one model turn.
///
/// Implemented by provider drivers outside this crate. Calls are
/// re-executable so a [`RetryPolicy`](crate::RetryPolicy) can wrap
/// them.
#[async_trait]
pub trait ModelProducer: Send + Sync {
    async fn produce(&self, prompt: &str) -> Result<ModelOutput, ProducerError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Running token totals, accumulated by simple addition. Absent counts
/// contribute zero and never reset the total.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// A finalized model turn: ordered content blocks plus usage totals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Usage,
}

impl Message {
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            usage: Usage::default(),
        }
    }

    /// Concatenated text of all `Text` blocks, in block order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ActionCall { .. } => None,
            })
            .collect()
    }
}

/// One finalized content block within a [`Message`].
///
/// An `ActionCall` keeps its input as the raw JSON string reconstructed
/// from the stream; decoding is deferred to the parse stage so a
/// malformed input degrades into a soft parse failure rather than a
/// lost block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ActionCall {
        tag: String,
        name: String,
        path: Option<String>,
        input: String,
    },
}

/// One incremental fragment of a streamed response.
///
/// `index` is the content-block position; indices are not guaranteed
/// contiguous or arrival-ordered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaContent {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub payload: DeltaPayload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeltaPayload {
    Text {
        text: String,
    },
    ActionCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_input: Option<String>,
    },
}

impl DeltaContent {
    pub fn text(index: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            usage: None,
            payload: DeltaPayload::Text { text: text.into() },
        }
    }

    pub fn action_call(
        index: u32,
        tag: Option<&str>,
        name: Option<&str>,
        path: Option<&str>,
        partial_input: Option<&str>,
    ) -> Self {
        Self {
            index,
            usage: None,
            payload: DeltaPayload::ActionCall {
                tag: tag.map(str::to_string),
                name: name.map(str::to_string),
                path: path.map(str::to_string),
                partial_input: partial_input.map(str::to_string),
            },
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates_additively() {
        let mut total = Usage::default();
        total += Usage {
            input_tokens: 10,
            output_tokens: 2,
        };
        total += Usage {
            input_tokens: 0,
            output_tokens: 5,
        };
        assert_eq!(
            total,
            Usage {
                input_tokens: 10,
                output_tokens: 7,
            }
        );
    }

    #[test]
    fn message_text_skips_action_calls() {
        let message = Message::assistant(vec![
            ContentBlock::Text {
                text: "Hel".to_string(),
            },
            ContentBlock::ActionCall {
                tag: "a1".to_string(),
                name: "Calc".to_string(),
                path: Some("add".to_string()),
                input: "{}".to_string(),
            },
            ContentBlock::Text {
                text: "lo".to_string(),
            },
        ]);
        assert_eq!(message.text(), "Hello");
    }
}
