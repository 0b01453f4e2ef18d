//! Application State

use std::collections::BTreeMap;
use std::sync::Arc;

use agent_core::{
    error::Result,
    pool::{IdentityPool, PoolStats, RegistryProvisioner},
    reasoning::Agent,
    registry::{BackendConfig, BackendRegistry},
    session::SessionStore,
};
use agent_runtime::HttpBackendFactory;
use async_trait::async_trait;

use crate::config::backends_for_identity;

/// Where a turn gets its backend registry from
#[derive(Clone)]
pub enum RegistrySource {
    /// One registry for every identity
    Shared(Arc<BackendRegistry>),
    /// A registry per identity, built on demand
    PerIdentity(IdentityPool),
}

impl RegistrySource {
    pub async fn for_identity(&self, identity: &str) -> Result<Arc<BackendRegistry>> {
        match self {
            Self::Shared(registry) => Ok(Arc::clone(registry)),
            Self::PerIdentity(pool) => pool.get(identity).await,
        }
    }

    /// Backend health; dedicated registries are not probed
    pub async fn health(&self) -> BTreeMap<String, bool> {
        match self {
            Self::Shared(registry) => registry.health_check().await,
            Self::PerIdentity(_) => BTreeMap::new(),
        }
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        match self {
            Self::Shared(_) => None,
            Self::PerIdentity(pool) => Some(pool.stats()),
        }
    }

    pub async fn shutdown(&self) {
        match self {
            Self::Shared(registry) => registry.shutdown().await,
            Self::PerIdentity(pool) => pool.stop().await,
        }
    }
}

/// Builds an identity's registry from the configured backends, with
/// `{identity}` substituted into each endpoint
pub struct HttpProvisioner {
    pub backends: Vec<BackendConfig>,
    pub factory: HttpBackendFactory,
}

#[async_trait]
impl RegistryProvisioner for HttpProvisioner {
    async fn provision(&self, identity: &str) -> Result<BackendRegistry> {
        let backends = backends_for_identity(&self.backends, identity)?;
        BackendRegistry::connect(&backends, &self.factory).await
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Agent loop (provider + configuration)
    pub agent: Arc<Agent>,

    /// Per-identity sessions
    pub sessions: SessionStore,

    /// Tool backends
    pub registries: RegistrySource,
}
