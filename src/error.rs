use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("capability schema must be a JSON object")]
    SchemaNotObject,
    #[error("capability schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("tool {tool} has no capability named {path}")]
    UnknownCapability { tool: String, path: String },
    #[error("invalid input for {tool}.{path}: {message}")]
    InvalidInput {
        tool: String,
        path: String,
        message: String,
    },
    #[error("duplicate capability registered: {0}")]
    DuplicateCapability(String),
    #[error("duplicate tool registered: {0}")]
    DuplicateTool(String),
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Errors surfaced by the network-facing producer stages that a
/// [`RetryPolicy`](crate::RetryPolicy) typically wraps.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("producer request failed: {0}")]
    Request(String),
    #[error("producer response invalid: {0}")]
    Response(String),
    #[error("producer request rejected: {0}")]
    Rejected(String),
}

impl ProducerError {
    /// Whether retrying the same request can ever succeed. `Rejected`
    /// covers terminal refusals (bad request, auth) that a retry policy
    /// should propagate immediately.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProducerError::Rejected(_))
    }
}
