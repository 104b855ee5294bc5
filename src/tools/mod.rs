//! Tool and capability registry.
//!
//! A [`Tool`] exposes named capabilities ("paths"), each bound to an
//! input schema and an async handler at registration time. Dispatch is
//! an explicit map lookup; there is no reflection.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

use crate::artifact::Artifact;
use crate::cycle::CycleContext;
use crate::error::{SchemaError, ToolError};

/// Boxed-future handler signature a capability is registered with.
pub type CapabilityHandler =
    dyn Fn(Map<String, Value>, CycleContext) -> BoxFuture<'static, Result<Artifact, ToolError>>
        + Send
        + Sync;

/// The injected lookup collaborator consumed by the validation stage.
pub trait ToolRegistry: Send + Sync {
    fn find_tool(&self, name: &str) -> Option<Arc<Tool>>;
}

/// One named capability of a tool: its input schema plus the bound
/// handler.
#[derive(Clone)]
pub struct Capability {
    schema: Value,
    handler: Arc<CapabilityHandler>,
}

/// An invocable unit exposing named capabilities.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    capabilities: HashMap<String, Capability>,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("capabilities", &self.capabilities.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            capabilities: HashMap::new(),
        }
    }

    /// Registers a capability. The schema is validated here so a bad
    /// registration fails at startup, not mid-cycle.
    pub fn capability<F, Fut>(
        mut self,
        path: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Result<Self, ToolError>
    where
        F: Fn(Map<String, Value>, CycleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Artifact, ToolError>> + Send + 'static,
    {
        let path = path.into();
        validate_schema(&schema)?;
        if self.capabilities.contains_key(&path) {
            return Err(ToolError::DuplicateCapability(format!(
                "{}.{path}",
                self.name
            )));
        }
        self.capabilities.insert(
            path,
            Capability {
                schema,
                handler: Arc::new(move |input, ctx| Box::pin(handler(input, ctx))),
            },
        );
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn schema_for(&self, path: &str) -> Option<&Value> {
        self.capabilities.get(path).map(|cap| &cap.schema)
    }

    /// Checks an input payload against one capability's schema.
    pub fn validate_input(&self, path: &str, input: &Map<String, Value>) -> Result<(), ToolError> {
        let capability =
            self.capabilities
                .get(path)
                .ok_or_else(|| ToolError::UnknownCapability {
                    tool: self.name.clone(),
                    path: path.to_string(),
                })?;
        validate_arguments(&self.name, path, &capability.schema, input)
    }

    /// Dispatches to the bound capability. Input validation is the
    /// validation stage's job; this is a plain lookup and call.
    pub async fn invoke(
        &self,
        path: &str,
        input: Map<String, Value>,
        ctx: CycleContext,
    ) -> Result<Artifact, ToolError> {
        let capability =
            self.capabilities
                .get(path)
                .ok_or_else(|| ToolError::UnknownCapability {
                    tool: self.name.clone(),
                    path: path.to_string(),
                })?;
        (capability.handler)(input, ctx).await
    }
}

/// `HashMap`-backed [`ToolRegistry`] with duplicate rejection.
#[derive(Clone, Debug, Default)]
pub struct ToolSet {
    tools: HashMap<String, Arc<Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Tool) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::DuplicateTool(name));
        }
        self.tools.insert(name, Arc::new(tool));
        Ok(())
    }

    pub fn with_tool(mut self, tool: Tool) -> Result<Self, ToolError> {
        self.register(tool)?;
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl ToolRegistry for ToolSet {
    fn find_tool(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.get(name).cloned()
    }
}

fn validate_schema(schema: &Value) -> Result<(), SchemaError> {
    let schema_obj = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    let root_type = schema_obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(SchemaError::RootTypeMustBeObject)?;

    if root_type != "object" {
        return Err(SchemaError::RootTypeMustBeObject);
    }

    if let Some(required) = schema_obj.get("required") {
        let required_arr = required.as_array().ok_or(SchemaError::InvalidRequired)?;
        for item in required_arr {
            if !item.is_string() {
                return Err(SchemaError::InvalidRequired);
            }
        }
    }

    Ok(())
}

fn validate_arguments(
    tool_name: &str,
    path: &str,
    schema: &Value,
    input: &Map<String, Value>,
) -> Result<(), ToolError> {
    let invalid = |message: String| ToolError::InvalidInput {
        tool: tool_name.to_string(),
        path: path.to_string(),
        message,
    };

    let schema_obj = schema
        .as_object()
        .ok_or_else(|| invalid("capability schema must be a JSON object".to_string()))?;

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for field in required {
            let Some(field_name) = field.as_str() else {
                continue;
            };
            if !input.contains_key(field_name) {
                return Err(invalid(format!("missing required field: {field_name}")));
            }
        }
    }

    let properties = schema_obj
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if schema_obj
        .get("additionalProperties")
        .and_then(Value::as_bool)
        == Some(false)
    {
        for key in input.keys() {
            if !properties.contains_key(key) {
                return Err(invalid(format!("unknown field: {key}")));
            }
        }
    }

    for (key, value) in input {
        if let Some(field_schema) = properties.get(key) {
            if let Some(type_name) = field_schema.get("type").and_then(Value::as_str) {
                if !value_matches_type(value, type_name) {
                    return Err(invalid(format!("field '{key}' must be of type {type_name}")));
                }
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.as_f64().is_some(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}
