//! JSON-RPC over HTTP Tool Backend
//!
//! Talks to a tool server that accepts JSON-RPC 2.0 requests by `POST` and
//! answers either with a single JSON body or with a server-sent-events
//! stream of `data: <json>` lines.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::mcp_http::HttpBackendFactory;
//!
//! let factory = HttpBackendFactory::new(Duration::from_secs(30))?;
//! let registry = BackendRegistry::connect(&configs, &factory).await?;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    registry::{AuthMode, BackendConfig, BackendFactory},
    tool::{ToolBackend, ToolCallResult, ToolDefinition},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{header, Client, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision announced during the handshake
pub const PROTOCOL_VERSION: &str = "2025-03-26";

const SESSION_HEADER: &str = "mcp-session-id";
const ACCEPT: &str = "application/json, text/event-stream";

/// JSON-RPC method not found
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl RpcResponse {
    fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => {
                let message = match err.data {
                    Some(data) if !data.is_null() => format!("{} ({data})", err.message),
                    _ => err.message,
                };
                Err(AgentError::JsonRpc {
                    code: err.code,
                    message,
                })
            }
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Pick the first `data:` line that decodes as a JSON-RPC response
fn parse_sse(body: &str) -> Result<RpcResponse> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .find_map(|data| serde_json::from_str::<RpcResponse>(data.trim()).ok())
        .ok_or_else(|| AgentError::Protocol("event stream carried no JSON-RPC response".into()))
}

/// Render a `tools/call` result as text.
///
/// Prefers `structuredContent`, then the text blocks of `content`, then the
/// raw result. `isError: true` makes the result a failure.
pub fn render_tool_result(backend_id: &str, result: &Value) -> ToolCallResult {
    if let Some(text) = result.as_str() {
        return ToolCallResult::success(backend_id, text);
    }
    let text = match result.get("structuredContent") {
        Some(structured) if !structured.is_null() => structured.to_string(),
        _ => {
            let blocks: Vec<&str> = result
                .get("content")
                .and_then(Value::as_array)
                .map(|content| {
                    content
                        .iter()
                        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                        .filter_map(|block| block.get("text").and_then(Value::as_str))
                        .collect()
                })
                .unwrap_or_default();
            if blocks.is_empty() {
                result.to_string()
            } else {
                blocks.join("\n")
            }
        }
    };

    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        ToolCallResult::failure(backend_id, text)
    } else {
        ToolCallResult::success(backend_id, text)
    }
}

/// Tool backend reached over HTTP
pub struct HttpToolBackend {
    id: String,
    endpoint: Url,
    auth: AuthMode,
    client: Client,
    session_id: RwLock<String>,
    next_id: AtomicU64,
}

impl HttpToolBackend {
    pub fn new(id: impl Into<String>, endpoint: Url, auth: AuthMode, client: Client) -> Self {
        Self {
            id: id.into(),
            endpoint,
            auth,
            client,
            session_id: RwLock::new(uuid::Uuid::new_v4().to_string()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn session_id(&self) -> String {
        self.session_id.read().clone()
    }

    fn decorate(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .header(header::ACCEPT, ACCEPT)
            .header(SESSION_HEADER, self.session_id());
        match &self.auth {
            AuthMode::Bearer { token } => request.bearer_auth(token),
            AuthMode::None => request,
        }
    }

    fn transport_error(&self, err: &reqwest::Error) -> AgentError {
        AgentError::Transport(format!("{}: {err}", self.id))
    }

    /// Send one request and decode its response
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: Some(self.next_id.fetch_add(1, Ordering::Relaxed)),
            method,
            params,
        };

        let response = self
            .decorate(self.client.post(self.endpoint.clone()))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if let Some(session) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut current = self.session_id.write();
            if *current != session {
                *current = session.to_string();
            }
        }
        let text = response.text().await.map_err(|e| self.transport_error(&e))?;

        if !status.is_success() {
            let snippet: String = text.chars().take(200).collect();
            return Err(AgentError::Transport(format!("{}: HTTP {status}: {snippet}", self.id)));
        }

        let envelope = if content_type.contains("text/event-stream") {
            parse_sse(&text)?
        } else {
            match serde_json::from_str::<RpcResponse>(&text) {
                Ok(envelope) => envelope,
                // a plain-text reply is the result itself
                Err(_) if !content_type.contains("json") => return Ok(Value::String(text)),
                Err(e) => return Err(AgentError::Protocol(format!("{}: {e}", self.id))),
            }
        };

        tracing::trace!(backend = %self.id, method, "JSON-RPC response received");
        envelope.into_result()
    }

    /// Fire-and-forget notification; only the HTTP status is checked
    async fn notify(&self, method: &str) -> Result<()> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        };
        let response = self
            .decorate(self.client.post(self.endpoint.clone()))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AgentError::Transport(format!("{}: HTTP {}", self.id, response.status())))
        }
    }
}

#[async_trait]
impl ToolBackend for HttpToolBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<()> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        match self.request("initialize", Some(params)).await {
            Ok(result) => {
                tracing::debug!(
                    backend = %self.id,
                    server = %result.pointer("/serverInfo/name").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                    "Handshake complete"
                );
                self.notify("notifications/initialized").await
            }
            // servers without a handshake still serve tools/list and tools/call
            Err(AgentError::JsonRpc { code: METHOD_NOT_FOUND, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let result = self.request("tools/list", None).await?;
        match result.get("tools") {
            Some(tools) => Ok(serde_json::from_value(tools.clone())?),
            None => Ok(Vec::new()),
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        tracing::debug!(backend = %self.id, tool = name, "Calling tool");
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let result = self.request("tools/call", Some(params)).await?;
        Ok(render_tool_result(&self.id, &result))
    }

    async fn close(&self) -> Result<()> {
        let response = self
            .decorate(self.client.delete(self.endpoint.clone()))
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        match response.status() {
            s if s.is_success() => Ok(()),
            // session termination is optional for servers
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_FOUND => Ok(()),
            s => Err(AgentError::Transport(format!("{}: HTTP {s} on close", self.id))),
        }
    }
}

/// Builds [`HttpToolBackend`]s sharing one HTTP client
#[derive(Clone)]
pub struct HttpBackendFactory {
    client: Client,
}

impl HttpBackendFactory {
    /// Factory whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl BackendFactory for HttpBackendFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn ToolBackend>> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| AgentError::Config(format!("backend '{}': invalid endpoint: {e}", config.id)))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(AgentError::Config(format!(
                "backend '{}': unsupported scheme '{}'",
                config.id,
                endpoint.scheme()
            )));
        }

        Ok(Arc::new(HttpToolBackend::new(
            config.id.clone(),
            endpoint,
            config.auth.clone(),
            self.client.clone(),
        )))
    }
}
