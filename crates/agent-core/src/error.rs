//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// A tool backend could not be reached while connecting
    #[error("Backend '{backend}' failed to connect: {message}")]
    BackendConnect { backend: String, message: String },

    /// Namespaced tool name without a backend prefix
    #[error("Invalid tool name '{0}': expected '<backend>__<tool>'")]
    InvalidToolName(String),

    /// Prefix does not match a connected backend
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// Backend accepted the call but failed to execute it
    #[error("Tool execution failed on '{backend}': {message}")]
    ToolExecution { backend: String, message: String },

    /// JSON-RPC error object returned by a tool backend
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc { code: i64, message: String },

    /// HTTP transport failure talking to a tool backend
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed protocol payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Session error
    #[error("Session error: {0}")]
    Session(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limited
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Check if error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_)
                | Self::RateLimited(_)
                | Self::Transport(_)
                | Self::Io(_)
        )
    }

    /// Wrap a backend-level failure so it carries the backend it came from
    pub fn tool_execution(backend: impl Into<String>, err: &Self) -> Self {
        let message = match err {
            Self::ToolExecution { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self::ToolExecution {
            backend: backend.into(),
            message,
        }
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(msg) => format!("The AI service encountered an error: {msg}"),
            Self::ProviderUnavailable(_) => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            Self::InvalidToolName(name) | Self::UnknownBackend(name) => {
                format!("The tool '{name}' is not available.")
            }
            Self::ToolExecution { backend, message } => {
                format!("The '{backend}' service failed: {message}")
            }
            Self::BackendConnect { backend, .. } => {
                format!("The '{backend}' service is not reachable right now.")
            }
            Self::RateLimited(_) => "You're sending messages too quickly. Please wait a moment.".into(),
            Self::Auth(_) => "Authentication failed. Please check your credentials.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
