//! # agent-core
//!
//! Core of a tool-using chat agent: a registry that joins several remote
//! tool backends into one namespaced catalog, a bounded agent loop that
//! runs the model's tool calls concurrently, and the session store that
//! tracks each identity's conversation.
//!
//! ## Architecture
//!
//! ```text
//! inbound ──► SessionStore ──► Agent ──► LlmProvider (Strategy)
//!             (flow, rate,      │
//!              LRU, sweep)      ▼
//!                          BackendRegistry ──► ToolBackend × N
//!                               ▲
//!                         IdentityPool (one registry per identity)
//! ```
//!
//! No transport code lives here. `ToolBackend` and `LlmProvider` are
//! implemented in `agent-runtime`.

pub mod error;
pub mod flow;
pub mod message;
pub mod periodic;
pub mod pool;
pub mod provider;
pub mod ratelimit;
pub mod reasoning;
pub mod registry;
pub mod session;
pub mod tool;

#[cfg(test)]
mod testing;

pub use error::{AgentError, Result};
pub use flow::{ChannelKind, FlowConfig, InboundEvent, RouteDecision};
pub use message::{Conversation, Message, Role};
pub use pool::{IdentityPool, PoolConfig, RegistryProvisioner};
pub use provider::LlmProvider;
pub use ratelimit::RateLimit;
pub use reasoning::{Agent, AgentBuilder, AgentConfig, TurnOutcome, TurnStatus};
pub use registry::{BackendConfig, BackendFactory, BackendRegistry, BackendState};
pub use session::{Session, SessionConfig, SessionStore};
pub use tool::{ToolBackend, ToolCall, ToolCallResult, ToolSpec};
