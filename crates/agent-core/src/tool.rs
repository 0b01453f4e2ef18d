//! Tool System
//!
//! Tool descriptors, call/result types and the [`ToolBackend`] capability
//! every remote tool provider implements. Backends are registered with the
//! [`BackendRegistry`](crate::registry::BackendRegistry), which namespaces
//! their tools and routes calls back to them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};

/// Separator between backend id and bare tool name
pub const NAMESPACE_DELIMITER: &str = "__";

/// Build `<backend>__<tool>`
pub fn namespaced_name(backend_id: &str, bare_name: &str) -> String {
    format!("{backend_id}{NAMESPACE_DELIMITER}{bare_name}")
}

/// Whether `id` can prefix tool names and still be recovered by
/// [`split_namespaced_name`]. A trailing `_` would merge into the delimiter.
pub fn is_valid_backend_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(NAMESPACE_DELIMITER) && !id.ends_with('_')
}

/// Split a namespaced name on the first delimiter occurrence
pub fn split_namespaced_name(name: &str) -> Result<(&str, &str)> {
    name.split_once(NAMESPACE_DELIMITER)
        .ok_or_else(|| AgentError::InvalidToolName(name.to_string()))
}

/// A tool as a backend advertises it (bare name)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON Schema for the arguments
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Catalog entry for one tool of one backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// `<backend>__<tool>` (or the bare name when not namespaced)
    pub namespaced_name: String,
    pub bare_name: String,
    pub backend_id: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn from_definition(backend_id: &str, definition: ToolDefinition, namespaced: bool) -> Self {
        let namespaced_name = if namespaced {
            namespaced_name(backend_id, &definition.name)
        } else {
            definition.name.clone()
        };
        Self {
            namespaced_name,
            bare_name: definition.name,
            backend_id: backend_id.to_string(),
            description: definition.description,
            input_schema: definition.input_schema,
        }
    }
}

/// Provider-callable function schema
/// (`{"type": "function", "function": {...}}`)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&ToolSpec> for FunctionSchema {
    fn from(spec: &ToolSpec) -> Self {
        Self {
            kind: "function".into(),
            function: FunctionDefinition {
                name: spec.namespaced_name.clone(),
                description: spec.description.clone(),
                parameters: spec.input_schema.clone(),
            },
        }
    }
}

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call ID, used to match the result message
    pub id: String,

    /// Namespaced tool identifier
    pub name: String,

    /// Arguments as JSON text, exactly as the provider sent them
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parsed arguments. Malformed or non-object JSON yields `{}`.
    pub fn parsed_arguments(&self) -> Value {
        match serde_json::from_str::<Value>(&self.arguments) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) | Err(_) => {
                if !self.arguments.trim().is_empty() {
                    tracing::debug!(tool = %self.name, "Ignoring malformed tool arguments");
                }
                Value::Object(serde_json::Map::new())
            }
        }
    }
}

/// Result from a backend tool invocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Backend that executed the call
    pub backend_id: String,

    /// Whether the backend reported success
    pub ok: bool,

    /// Rendered output
    pub payload_text: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl ToolCallResult {
    pub fn success(backend_id: impl Into<String>, payload_text: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            ok: true,
            payload_text: payload_text.into(),
            error_detail: None,
        }
    }

    pub fn failure(backend_id: impl Into<String>, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            backend_id: backend_id.into(),
            ok: false,
            payload_text: detail.clone(),
            error_detail: Some(detail),
        }
    }

    /// Text handed back to the model as the tool message content
    pub fn to_message_content(&self) -> String {
        if self.ok {
            self.payload_text.clone()
        } else {
            format!("Error: {}", self.error_detail.as_deref().unwrap_or(&self.payload_text))
        }
    }
}

/// One live link to a remote tool provider.
///
/// Implement once per transport. The registry only ever talks to backends
/// through this trait, never by inspecting the backend id.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Backend identifier, unique within a registry
    fn id(&self) -> &str;

    /// Establish the connection
    async fn connect(&self) -> Result<()>;

    /// Tools this backend currently offers
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;

    /// Invoke a tool by bare name
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult>;

    /// Probe liveness; a successful listing counts as healthy
    async fn health_check(&self) -> Result<bool> {
        Ok(self.list_tools().await.is_ok())
    }

    /// Release the connection
    async fn close(&self) -> Result<()>;
}
