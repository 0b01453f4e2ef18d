//! Tool-orchestrating agent server
//!
//! Axum-based HTTP surface for the agent: inbound chat messages go through
//! conversation-flow routing, the rate limiter and the session store, then
//! one agent turn against the configured tool backends.

mod config;
mod handlers;
mod state;

use std::sync::Arc;

use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{
    pool::IdentityPool,
    reasoning::AgentBuilder,
    registry::BackendRegistry,
    session::SessionStore,
    LlmProvider,
};
use agent_runtime::{HttpBackendFactory, OpenAiProvider};

use crate::config::ServerConfig;
use crate::state::{AppState, HttpProvisioner, RegistrySource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();
    let config = ServerConfig::from_env()?;

    // Initialize LLM provider
    let provider = Arc::new(OpenAiProvider::from_config(config.provider.clone())?);
    match provider.health_check().await {
        Ok(true) => tracing::info!(base_url = %config.provider.base_url, "✓ Connected to completion provider"),
        Ok(false) | Err(_) => {
            tracing::warn!(base_url = %config.provider.base_url, "⚠ Completion provider not reachable - turns will fail");
        }
    }

    let agent = AgentBuilder::new()
        .provider(provider)
        .config(config.agent.clone())
        .build()?;

    // Tool backends
    if config.backends.is_empty() {
        tracing::warn!("⚠ TOOL_BACKENDS is empty - the agent has no tools");
    }
    let factory = HttpBackendFactory::new(config.backend_timeout)?;
    let registries = if config.dedicated_backends {
        let pool = IdentityPool::new(
            config.pool.clone(),
            Arc::new(HttpProvisioner {
                backends: config.backends.clone(),
                factory,
            }),
        );
        pool.start();
        tracing::info!(backends = config.backends.len(), "Using per-identity backend registries");
        RegistrySource::PerIdentity(pool)
    } else {
        let registry = BackendRegistry::connect(&config.backends, &factory).await?;
        tracing::info!(
            connected = registry.connected_count(),
            configured = config.backends.len(),
            "Tool backends ready"
        );
        for tool in registry.catalog(true).await {
            tracing::info!("  • {}", tool.namespaced_name);
        }
        RegistrySource::Shared(Arc::new(registry))
    };

    // Sessions
    let sessions = SessionStore::new(config.session.clone());
    sessions.start();

    let state = AppState {
        agent: Arc::new(agent),
        sessions: sessions.clone(),
        registries: registries.clone(),
    };

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = handlers::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 agent server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                                   - Health check");
    tracing::info!("  GET  /api/stats                                - Session statistics");
    tracing::info!("  POST /api/messages                             - Inbound chat message");
    tracing::info!("  GET  /api/sessions/{{identity}}                  - Session info");
    tracing::info!("  POST /api/sessions/{{identity}}/reset            - Clear history");
    tracing::info!("  POST /api/sessions/{{identity}}/conversation/*   - Start/end flow");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    sessions.stop().await;
    registries.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl-C handler: {}", e);
        std::future::pending::<()>().await;
    }
}
