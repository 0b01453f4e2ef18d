//! HTTP Handlers

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use agent_core::{
    error::AgentError,
    flow::{InboundEvent, RouteDecision},
    pool::PoolStats,
    reasoning::TurnStatus,
    session::{SessionInfo, SessionStats},
};

use crate::state::AppState;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub provider_connected: bool,
    pub backends: BTreeMap<String, bool>,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub sessions: SessionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_pool: Option<PoolStats>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    /// Whether the agent ran a turn
    pub handled: bool,
    pub decision: RouteDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TurnStatus>,
}

#[derive(Debug, Serialize)]
pub struct SessionActionResponse {
    pub identity: String,
    pub conversation_active: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(err: &AgentError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match err {
        AgentError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
        AgentError::Session(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
        AgentError::BackendConnect { .. } | AgentError::Config(_) | AgentError::Transport(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "BACKEND_UNAVAILABLE")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "AGENT_ERROR"),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.user_message(),
            code: code.into(),
        }),
    )
}

fn session_not_found(identity: &str) -> (StatusCode, Json<ErrorResponse>) {
    error_response(&AgentError::Session(format!("no session for '{identity}'")))
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(stats))
        .route("/api/messages", post(message_handler))
        .route("/api/sessions/{identity}", get(get_session))
        .route("/api/sessions/{identity}/reset", post(reset_session))
        .route("/api/sessions/{identity}/conversation/start", post(start_conversation))
        .route("/api/sessions/{identity}/conversation/end", post(end_conversation))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let provider_connected = state.agent.provider().health_check().await.unwrap_or(false);
    let backends = state.registries.health().await;
    let healthy = provider_connected && backends.values().all(|up| *up);

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        provider_connected,
        backends,
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        sessions: state.sessions.stats(),
        identity_pool: state.registries.pool_stats(),
    })
}

/// Inbound chat message: flow routing, rate limit, then one agent turn
pub async fn message_handler(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> ApiResult<MessageResponse> {
    let decision = state.sessions.route_inbound(&event);
    if !decision.should_respond() {
        return Ok(Json(MessageResponse {
            handled: false,
            decision,
            reply: None,
            notice: decision.notice(),
            status: None,
        }));
    }

    let identity = event.identity.as_str();
    if !state.sessions.check_rate_limit(identity) {
        return Err(error_response(&AgentError::RateLimited(identity.to_string())));
    }

    // one turn per identity at a time
    let _turn = state.sessions.lock_turn(identity).await;
    let session = state
        .sessions
        .get_or_create(identity, &event.channel, event.channel_kind);
    if let (true, Some(thread)) = (event.mentions_agent, event.thread_ref()) {
        state.sessions.set_thread_affinity(identity, thread);
    }

    let registry = state.registries.for_identity(identity).await.map_err(|e| {
        tracing::error!(identity, error = %e, "Could not provision backends");
        error_response(&e)
    })?;

    let mut history = session.history;
    let outcome = state.agent.run_turn(&registry, &mut history, &event.text).await;
    if !state.sessions.update_history(identity, history) {
        tracing::debug!(identity, "Session evicted during turn; history dropped");
    }

    tracing::info!(
        identity,
        status = ?outcome.status,
        round_trips = outcome.round_trips,
        tool_calls = outcome.tool_calls,
        "Turn finished"
    );

    Ok(Json(MessageResponse {
        handled: true,
        decision,
        reply: Some(outcome.reply),
        notice: None,
        status: Some(outcome.status),
    }))
}

pub async fn get_session(State(state): State<AppState>, Path(identity): Path<String>) -> ApiResult<SessionInfo> {
    state
        .sessions
        .session_info(&identity)
        .map(Json)
        .ok_or_else(|| session_not_found(&identity))
}

pub async fn reset_session(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> ApiResult<SessionActionResponse> {
    if !state.sessions.reset_conversation(&identity) {
        return Err(session_not_found(&identity));
    }
    Ok(Json(SessionActionResponse {
        conversation_active: state.sessions.is_conversation_active(&identity),
        identity,
    }))
}

pub async fn start_conversation(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> ApiResult<SessionActionResponse> {
    if !state.sessions.start_conversation(&identity) {
        return Err(session_not_found(&identity));
    }
    Ok(Json(SessionActionResponse {
        identity,
        conversation_active: true,
    }))
}

pub async fn end_conversation(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> ApiResult<SessionActionResponse> {
    if !state.sessions.end_conversation(&identity) {
        return Err(session_not_found(&identity));
    }
    Ok(Json(SessionActionResponse {
        identity,
        conversation_active: false,
    }))
}
