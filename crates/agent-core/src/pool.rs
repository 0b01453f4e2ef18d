//! Identity Pool
//!
//! Some identities need their own backend connections (their own
//! credentials, their own sessions on the remote side). The pool builds a
//! [`BackendRegistry`] per identity on first use, keeps at most
//! `max_identities` of them, and tears a registry down when it is evicted
//! or has been idle past `idle_timeout`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use mockable::DefaultClock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::periodic::PeriodicTask;
use crate::registry::BackendRegistry;
use crate::session::SharedClock;

/// Builds the registry for one identity
#[async_trait]
pub trait RegistryProvisioner: Send + Sync {
    async fn provision(&self, identity: &str) -> Result<BackendRegistry>;
}

/// Identity pool configuration
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_identities: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_identities: 100,
            idle_timeout: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    /// Reject values the pool cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.max_identities == 0 {
            return Err(AgentError::Config("max_identities must be at least 1".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(AgentError::Config("identity sweep interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub live_bundles: usize,
    pub max_identities: usize,
    pub identities: Vec<String>,
    pub is_running: bool,
}

struct Bundle {
    registry: Arc<BackendRegistry>,
    last_used: DateTime<Utc>,
}

struct PoolInner {
    config: PoolConfig,
    provisioner: Arc<dyn RegistryProvisioner>,
    clock: SharedClock,
    bundles: Mutex<HashMap<String, Bundle>>,
    sweeper: Mutex<Option<PeriodicTask>>,
}

/// Bounded, LRU-evicted cache of per-identity registries
#[derive(Clone)]
pub struct IdentityPool {
    inner: Arc<PoolInner>,
}

impl IdentityPool {
    pub fn new(config: PoolConfig, provisioner: Arc<dyn RegistryProvisioner>) -> Self {
        Self::with_clock(config, provisioner, Arc::new(DefaultClock))
    }

    pub fn with_clock(mut config: PoolConfig, provisioner: Arc<dyn RegistryProvisioner>, clock: SharedClock) -> Self {
        if config.max_identities == 0 {
            tracing::warn!("max_identities is 0, holding one identity");
            config.max_identities = 1;
        }
        Self {
            inner: Arc::new(PoolInner {
                config,
                provisioner,
                clock,
                bundles: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Registry for `identity`, provisioning it on first use
    pub async fn get(&self, identity: &str) -> Result<Arc<BackendRegistry>> {
        if let Some(registry) = self.lookup(identity) {
            return Ok(registry);
        }

        // provisioning awaits, so it runs without the map lock held
        let fresh = Arc::new(self.inner.provisioner.provision(identity).await?);

        let now = self.inner.clock.utc();
        let (registry, retired) = {
            let mut bundles = self.inner.bundles.lock();
            if let Some(bundle) = bundles.get_mut(identity) {
                // lost a race with a concurrent get; keep the first one
                bundle.last_used = now;
                (Arc::clone(&bundle.registry), Some((identity.to_string(), fresh)))
            } else {
                let evicted = if bundles.len() >= self.inner.config.max_identities {
                    least_recent(&bundles).and_then(|id| bundles.remove(&id).map(|b| (id, b.registry)))
                } else {
                    None
                };
                bundles.insert(
                    identity.to_string(),
                    Bundle {
                        registry: Arc::clone(&fresh),
                        last_used: now,
                    },
                );
                (fresh, evicted)
            }
        };

        if let Some((id, old)) = retired {
            if id != identity {
                tracing::info!(evicted = %id, "Evicted least recently used identity");
            }
            old.shutdown().await;
        }
        tracing::info!(identity, "Provisioned identity registry");
        Ok(registry)
    }

    fn lookup(&self, identity: &str) -> Option<Arc<BackendRegistry>> {
        let now = self.inner.clock.utc();
        let mut bundles = self.inner.bundles.lock();
        bundles.get_mut(identity).map(|bundle| {
            bundle.last_used = now;
            Arc::clone(&bundle.registry)
        })
    }

    /// Tear down one identity's registry
    pub async fn remove(&self, identity: &str) -> bool {
        let bundle = self.inner.bundles.lock().remove(identity);
        match bundle {
            Some(bundle) => {
                bundle.registry.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Retire registries idle past the timeout. Returns the retired identities.
    pub async fn sweep(&self) -> Vec<String> {
        let now = self.inner.clock.utc();
        let timeout = chrono::Duration::from_std(self.inner.config.idle_timeout).unwrap_or(chrono::Duration::MAX);

        let retired: Vec<(String, Arc<BackendRegistry>)> = {
            let mut bundles = self.inner.bundles.lock();
            let idle: Vec<String> = bundles
                .iter()
                .filter(|(_, b)| now - b.last_used > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            idle.into_iter()
                .filter_map(|id| bundles.remove(&id).map(|b| (id, b.registry)))
                .collect()
        };

        join_all(retired.iter().map(|(_, registry)| registry.shutdown())).await;
        if !retired.is_empty() {
            tracing::info!(count = retired.len(), "Retired idle identity registries");
        }
        retired.into_iter().map(|(id, _)| id).collect()
    }

    /// Spawn the idle sweep. No-op when already running.
    pub fn start(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        *sweeper = Some(PeriodicTask::spawn(
            "identity-pool-sweep",
            self.inner.config.sweep_interval,
            move || {
                let pool = weak.upgrade().map(|inner| Self { inner });
                async move {
                    match pool {
                        Some(pool) => {
                            pool.sweep().await;
                            true
                        }
                        None => false,
                    }
                }
            },
        ));
    }

    /// Cancel the sweep and tear down every registry
    pub async fn stop(&self) {
        let task = self.inner.sweeper.lock().take();
        if let Some(task) = task {
            task.cancel().await;
        }

        let all: Vec<Arc<BackendRegistry>> = self.inner.bundles.lock().drain().map(|(_, b)| b.registry).collect();
        join_all(all.iter().map(|registry| registry.shutdown())).await;
        tracing::info!(closed = all.len(), "Identity pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let mut identities: Vec<String> = self.inner.bundles.lock().keys().cloned().collect();
        identities.sort();
        PoolStats {
            live_bundles: identities.len(),
            max_identities: self.inner.config.max_identities,
            identities,
            is_running: self.inner.sweeper.lock().as_ref().is_some_and(|task| !task.is_finished()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.bundles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn least_recent(bundles: &HashMap<String, Bundle>) -> Option<String> {
    bundles
        .iter()
        .min_by_key(|(_, b)| b.last_used)
        .map(|(id, _)| id.clone())
}
