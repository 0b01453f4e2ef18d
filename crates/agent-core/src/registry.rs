//! Backend Registry & Tool Catalog
//!
//! Owns the set of backend connections, builds the namespaced tool catalog
//! and routes calls by namespaced name. A backend that fails to connect, or
//! fails to list its tools, degrades only itself: the rest of the registry
//! stays usable.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = BackendRegistry::connect(&configs, &factory).await?;
//! let catalog = registry.catalog(true).await;
//! let (backend, result) = registry
//!     .call_by_namespaced_name("math__add", json!({"a": 9, "b": 6}))
//!     .await?;
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::tool::{is_valid_backend_id, split_namespaced_name, ToolBackend, ToolCallResult, ToolSpec};

/// How a backend authenticates requests
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    None,
    Bearer { token: String },
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bearer { .. } => write!(f, "Bearer(<redacted>)"),
        }
    }
}

/// Static description of one backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique id, used as the namespace prefix
    pub id: String,

    /// Endpoint URL
    pub endpoint: String,

    #[serde(default)]
    pub auth: AuthMode,
}

impl BackendConfig {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            auth: AuthMode::None,
        }
    }

    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.auth = AuthMode::Bearer { token: token.into() };
        self
    }
}

/// Connection state of a registered backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Disconnected,
    Connected,
    Failed,
}

/// Builds a transport-specific backend from its configuration.
///
/// Errors here are configuration errors and abort registry construction.
pub trait BackendFactory: Send + Sync {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn ToolBackend>>;
}

struct BackendSlot {
    config: BackendConfig,
    backend: Arc<dyn ToolBackend>,
    state: RwLock<BackendState>,
}

impl BackendSlot {
    fn state(&self) -> BackendState {
        *self.state.read()
    }

    fn set_state(&self, state: BackendState) {
        *self.state.write() = state;
    }
}

/// Registry of tool backends
pub struct BackendRegistry {
    slots: Vec<BackendSlot>,
}

impl BackendRegistry {
    /// Create every backend and connect them independently.
    ///
    /// Fails only on configuration problems (duplicate ids, a factory
    /// rejecting a config). Unreachable backends are marked
    /// [`BackendState::Failed`] and skipped.
    pub async fn connect(configs: &[BackendConfig], factory: &dyn BackendFactory) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut slots = Vec::with_capacity(configs.len());

        for config in configs {
            if !is_valid_backend_id(&config.id) {
                return Err(AgentError::Config(format!(
                    "Invalid backend id '{}'",
                    config.id
                )));
            }
            if !seen.insert(config.id.clone()) {
                return Err(AgentError::Config(format!(
                    "Duplicate backend id '{}'",
                    config.id
                )));
            }
            slots.push(BackendSlot {
                config: config.clone(),
                backend: factory.create(config)?,
                state: RwLock::new(BackendState::Disconnected),
            });
        }

        let registry = Self { slots };
        registry.connect_all().await;
        Ok(registry)
    }

    async fn connect_all(&self) {
        let attempts = self.slots.iter().map(|slot| async move {
            match slot.backend.connect().await {
                Ok(()) => {
                    slot.set_state(BackendState::Connected);
                    tracing::info!(backend = %slot.config.id, endpoint = %slot.config.endpoint, "Backend connected");
                }
                Err(e) => {
                    slot.set_state(BackendState::Failed);
                    let err = AgentError::BackendConnect {
                        backend: slot.config.id.clone(),
                        message: e.to_string(),
                    };
                    tracing::warn!(backend = %slot.config.id, error = %err, "Backend unavailable, continuing without it");
                }
            }
        });
        join_all(attempts).await;
    }

    /// Registered backend ids, in configuration order
    pub fn backend_ids(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.config.id.as_str()).collect()
    }

    /// Current state of every backend
    pub fn backend_states(&self) -> BTreeMap<String, BackendState> {
        self.slots
            .iter()
            .map(|s| (s.config.id.clone(), s.state()))
            .collect()
    }

    /// Number of connected backends
    pub fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state() == BackendState::Connected)
            .count()
    }

    fn connected_slot(&self, backend_id: &str) -> Result<&BackendSlot> {
        self.slots
            .iter()
            .find(|s| s.config.id == backend_id && s.state() == BackendState::Connected)
            .ok_or_else(|| AgentError::UnknownBackend(backend_id.to_string()))
    }

    /// Probe every backend. Backends that never connected report `false`
    /// without being probed.
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        let probes = self.slots.iter().map(|slot| async move {
            let healthy = if slot.state() == BackendState::Connected {
                match slot.backend.health_check().await {
                    Ok(healthy) => healthy,
                    Err(e) => {
                        tracing::warn!(backend = %slot.config.id, error = %e, "Health probe failed");
                        false
                    }
                }
            } else {
                false
            };
            (slot.config.id.clone(), healthy)
        });
        join_all(probes).await.into_iter().collect()
    }

    /// Tools of every connected backend.
    ///
    /// A backend whose listing fails contributes nothing; this call itself
    /// never fails.
    pub async fn catalog(&self, namespaced: bool) -> Vec<ToolSpec> {
        let listings = self
            .slots
            .iter()
            .filter(|s| s.state() == BackendState::Connected)
            .map(|slot| async move {
                match slot.backend.list_tools().await {
                    Ok(tools) => tools
                        .into_iter()
                        .map(|t| ToolSpec::from_definition(&slot.config.id, t, namespaced))
                        .collect(),
                    Err(e) => {
                        tracing::warn!(backend = %slot.config.id, error = %e, "Tool listing failed, skipping backend");
                        Vec::new()
                    }
                }
            });

        join_all(listings).await.into_iter().flatten().collect()
    }

    /// Bare tools of a single backend
    pub async fn list_tools(&self, backend_id: &str) -> Result<Vec<ToolSpec>> {
        let slot = self.connected_slot(backend_id)?;
        let tools = slot.backend.list_tools().await?;
        Ok(tools
            .into_iter()
            .map(|t| ToolSpec::from_definition(backend_id, t, false))
            .collect())
    }

    /// Invoke `bare_name` on `backend_id`
    pub async fn call_tool(
        &self,
        backend_id: &str,
        bare_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult> {
        let slot = self.connected_slot(backend_id)?;
        tracing::debug!(backend = %backend_id, tool = %bare_name, "Dispatching tool call");
        slot.backend
            .call_tool(bare_name, arguments)
            .await
            .map_err(|e| AgentError::tool_execution(backend_id, &e))
    }

    /// Route a `<backend>__<tool>` call. Returns the backend id alongside
    /// the result.
    pub async fn call_by_namespaced_name(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<(String, ToolCallResult)> {
        let (backend_id, bare_name) = split_namespaced_name(name)?;
        let result = self.call_tool(backend_id, bare_name, arguments).await?;
        Ok((backend_id.to_string(), result))
    }

    /// Close every backend. A failure on one does not stop the others.
    pub async fn shutdown(&self) {
        let closes = self.slots.iter().map(|slot| async move {
            if slot.state() == BackendState::Disconnected {
                return;
            }
            if let Err(e) = slot.backend.close().await {
                tracing::warn!(backend = %slot.config.id, error = %e, "Backend close failed");
            }
            slot.set_state(BackendState::Disconnected);
        });
        join_all(closes).await;
        tracing::debug!(backends = self.slots.len(), "Registry shut down");
    }
}
