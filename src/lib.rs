//! Model-agnostic tool-calling execution core for LLM agents.
//!
//! Surface:
//! - `parse_turn` for the textual `Thought:`/`Actions:`/`Answer:` protocol
//! - `DeltaAggregator` to reassemble streamed responses into a `Message`
//! - `Tool`/`ToolSet` capability registry with JSON schema validation
//! - `CycleRunner` wiring parse → validate → concurrent execution
//! - `EventBus` for synchronous cycle lifecycle and chunk events
//! - `RetryPolicy` bounded exponential backoff for producer calls

pub mod action;
pub mod aggregate;
pub mod artifact;
pub mod cycle;
pub mod error;
pub mod event;
pub mod message;
pub mod parse;
pub mod retry;
pub mod tools;

pub use action::{Action, ERROR_ACTION};
pub use aggregate::DeltaAggregator;
pub use artifact::{Artifact, NamedArtifact};
pub use cycle::{
    ActionExecutor, CycleContext, CycleRunner, Subtask, SubtaskId, validate_actions,
};
pub use error::{ProducerError, SchemaError, ToolError};
pub use event::{ActionHeader, ChunkPayload, CycleEvent, EventBus, EventKind, EventListener};
pub use message::{
    ContentBlock, DeltaContent, DeltaPayload, DeltaStream, Message, ModelOutput, ModelProducer,
    Role, Usage,
};
pub use parse::{ParsedTurn, parse_turn};
pub use retry::{Attempt, RetryPolicy};
pub use tools::{Capability, CapabilityHandler, Tool, ToolRegistry, ToolSet};
