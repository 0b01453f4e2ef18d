//! # agent-runtime
//!
//! Concrete transports for the agent core.
//!
//! ## Components
//!
//! - **`mcp_http`**: tool backends reached by JSON-RPC 2.0 over HTTP, with
//!   plain JSON or server-sent-events responses
//! - **`openai`**: chat-completions provider with function calling; works
//!   against any OpenAI-compatible endpoint
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{HttpBackendFactory, OpenAiProvider};
//!
//! let factory = HttpBackendFactory::new(Duration::from_secs(30))?;
//! let registry = BackendRegistry::connect(&backends, &factory).await?;
//!
//! let agent = AgentBuilder::new()
//!     .provider(Arc::new(OpenAiProvider::from_env()?))
//!     .build()?;
//! ```

pub mod mcp_http;
pub mod openai;

pub use mcp_http::{HttpBackendFactory, HttpToolBackend};
pub use openai::{OpenAiConfig, OpenAiProvider};

// Re-export core types for convenience
pub use agent_core::{
    Agent, AgentError, BackendRegistry, LlmProvider, Message, Result, Role, SessionStore, ToolBackend,
};
