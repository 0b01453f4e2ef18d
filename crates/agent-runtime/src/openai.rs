//! OpenAI-compatible LLM Provider
//!
//! Implementation of `LlmProvider` for any chat-completions endpoint that
//! speaks the OpenAI function-calling format (OpenAI itself, Azure-style
//! gateways, vLLM, or Ollama's `/v1` API).

use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{Completion, CompletionRequest, FinishReason, LlmProvider, ModelInfo, TokenUsage},
    tool::{FunctionSchema, ToolCall},
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

/// OpenAI provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// API base URL, including the version segment
    pub base_url: String,

    /// Bearer key; optional for local gateways
    pub api_key: Option<String>,

    /// Default model
    pub model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "gpt-4o".into(),
            timeout_secs: 120,
        }
    }
}

impl OpenAiConfig {
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over any key lookup
    pub fn from_env_with(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            base_url: get("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            api_key: get("OPENAI_API_KEY").filter(|k| !k.is_empty()),
            model: get("OPENAI_MODEL").unwrap_or(defaults.model),
            timeout_secs: get("OPENAI_TIMEOUT_SECS")
                .and_then(|t| t.parse().ok())
                .unwrap_or(defaults.timeout_secs),
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tools: &'a [FunctionSchema],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunction,
}

fn function_kind() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    owned_by: Option<String>,
}

/// OpenAI-compatible provider
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    /// Create from configuration
    pub fn from_config(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_config(OpenAiConfig::from_env())
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Convert agent messages to chat-completions format
    fn convert_messages(system_prompt: &str, messages: &[Message]) -> Vec<WireMessage> {
        let system = (!system_prompt.is_empty()).then(|| WireMessage {
            role: "system".into(),
            content: Some(system_prompt.to_string()),
            tool_calls: None,
            tool_call_id: None,
        });

        system
            .into_iter()
            .chain(messages.iter().map(|m| WireMessage {
                role: m.role.to_string(),
                content: match m.role {
                    // assistant turns that only call tools carry no text
                    Role::Assistant if m.has_tool_calls() && m.content.is_empty() => None,
                    _ => Some(m.content.clone()),
                },
                tool_calls: m.has_tool_calls().then(|| {
                    m.tool_calls
                        .iter()
                        .map(|call| WireToolCall {
                            id: call.id.clone(),
                            kind: function_kind(),
                            function: WireFunction {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect()
                }),
                tool_call_id: m.tool_call_id.clone(),
            }))
            .collect()
    }

    /// Convert a chat-completions response to an agent completion
    fn convert_completion(response: ChatResponse, requested_model: &str) -> Result<Completion> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Provider("response contained no choices".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall::new(call.id, call.function.name, call.function.arguments))
            .collect::<Vec<_>>();

        let finish_reason = choice.finish_reason.as_deref().map(|reason| match reason {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolUse,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Error,
        });

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            model: if response.model.is_empty() {
                requested_model.to_string()
            } else {
                response.model
            },
            usage: response.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            finish_reason,
        })
    }

    fn send_error(err: &reqwest::Error) -> AgentError {
        if err.is_connect() || err.is_timeout() {
            AgentError::ProviderUnavailable(err.to_string())
        } else {
            AgentError::Provider(err.to_string())
        }
    }

    /// Map a non-success response to an error
    async fn status_error(response: Response) -> AgentError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(body);
        let detail = format!("HTTP {status}: {detail}");

        match status {
            StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited(detail),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::Auth(detail),
            s if s.is_server_error() => AgentError::ProviderUnavailable(detail),
            _ => AgentError::Provider(detail),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn health_check(&self) -> Result<bool> {
        match self.authorize(self.client.get(self.url("models"))).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::warn!("Provider health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion> {
        let options = request.options;
        let body = ChatRequest {
            model: &options.model,
            messages: Self::convert_messages(request.system_prompt, request.messages),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            tools: request.tools,
            tool_choice: (!request.tools.is_empty()).then_some("auto"),
        };

        let response = self
            .authorize(self.client.post(self.url("chat/completions")))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::send_error(&e))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("invalid response: {e}")))?;
        Self::convert_completion(parsed, &options.model)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .authorize(self.client.get(self.url("models")))
            .send()
            .await
            .map_err(|e| Self::send_error(&e))?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let list: ModelList = response
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("invalid model list: {e}")))?;
        Ok(list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                owned_by: m.owned_by,
            })
            .collect())
    }
}
