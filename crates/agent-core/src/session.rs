//! Session Management
//!
//! Per-identity conversation state: history, activity, the conversation
//! flow, the rate window and thread affinity. The store is bounded; when
//! full, the least recently active session is evicted before a new one is
//! created. A background sweep removes idle sessions and closes lapsed flows.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let store = SessionStore::new(SessionConfig::default());
//! store.start();
//!
//! if store.route_inbound(&event).should_respond() && store.check_rate_limit(&event.identity) {
//!     let _turn = store.lock_turn(&event.identity).await;
//!     let session = store.get_or_create(&event.identity, &event.channel, event.channel_kind);
//!     // run the agent on session.history, then
//!     store.update_history(&event.identity, history);
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::{Clock, DefaultClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::error::{AgentError, Result};
use crate::flow::{ChannelKind, FlowConfig, InboundEvent, RouteDecision};
use crate::message::{Conversation, Message};
use crate::periodic::PeriodicTask;
use crate::ratelimit::{FixedWindow, RateLimit};

/// Shared time source
pub type SharedClock = Arc<dyn Clock + Send + Sync>;

/// Session store configuration
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Inactivity after which the sweep removes a session
    pub session_timeout: Duration,

    /// Capacity of the store
    pub max_sessions: usize,

    /// Period of the background sweep
    pub sweep_interval: Duration,

    pub rate_limit: RateLimit,

    pub flow: FlowConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(1800),
            max_sessions: 100,
            sweep_interval: Duration::from_secs(300),
            rate_limit: RateLimit::default(),
            flow: FlowConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Reject values the store cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(AgentError::Config("max_sessions must be at least 1".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(AgentError::Config("session sweep interval must be non-zero".into()));
        }
        Ok(())
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// A single identity's conversation state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub identity: String,

    /// Channel of the most recent message
    pub channel: String,
    pub channel_kind: ChannelKind,

    /// Full, untrimmed history
    pub history: Conversation,

    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,

    pub conversation_active: bool,
    pub conversation_started_at: Option<DateTime<Utc>>,

    pub rate: FixedWindow,

    /// Thread bound to this identity
    pub thread: Option<String>,
}

impl Session {
    pub fn new(identity: &str, channel: &str, channel_kind: ChannelKind, now: DateTime<Utc>) -> Self {
        Self {
            identity: identity.to_string(),
            channel: channel.to_string(),
            channel_kind,
            history: Conversation::new(),
            created_at: now,
            last_activity: now,
            conversation_active: false,
            conversation_started_at: None,
            rate: FixedWindow::new(now),
            thread: None,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    /// Idle longer than `timeout`
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_activity > chrono_duration(timeout)
    }

    pub fn start_conversation(&mut self, now: DateTime<Utc>) {
        self.conversation_active = true;
        self.conversation_started_at = Some(now);
        self.touch(now);
    }

    pub fn end_conversation(&mut self) {
        self.conversation_active = false;
        self.conversation_started_at = None;
    }

    /// Active flow with no activity for longer than `timeout`
    pub fn is_conversation_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.conversation_active && self.is_idle(now, timeout)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            identity: self.identity.clone(),
            channel: self.channel.clone(),
            channel_kind: self.channel_kind,
            created_at: self.created_at,
            last_activity: self.last_activity,
            conversation_length: self.history.len(),
            thread: self.thread.clone(),
            rate_limit_count: self.rate.count,
            conversation_active: self.conversation_active,
            conversation_started_at: self.conversation_started_at,
        }
    }
}

/// Serializable summary of a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub identity: String,
    pub channel: String,
    pub channel_kind: ChannelKind,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub conversation_length: usize,
    pub thread: Option<String>,
    pub rate_limit_count: u32,
    pub conversation_active: bool,
    pub conversation_started_at: Option<DateTime<Utc>>,
}

/// Store-wide counters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub direct_sessions: usize,
    pub indirect_sessions: usize,
    pub active_threads: usize,
    pub max_sessions: usize,
    pub session_timeout_secs: u64,
    pub is_running: bool,
}

/// Outcome of one sweep pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions removed for inactivity
    pub expired_sessions: Vec<String>,
    /// Sessions kept but whose flow was closed
    pub ended_flows: Vec<String>,
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<String, Session>,
    /// thread ref -> identity
    threads: HashMap<String, String>,
}

impl StoreState {
    fn remove(&mut self, identity: &str) -> Option<Session> {
        let session = self.sessions.remove(identity)?;
        if let Some(thread) = &session.thread {
            self.threads.remove(thread);
        }
        Some(session)
    }

    fn evict_least_recent(&mut self) -> Option<String> {
        let oldest = self
            .sessions
            .values()
            .min_by_key(|s| s.last_activity)
            .map(|s| s.identity.clone())?;
        self.remove(&oldest);
        Some(oldest)
    }
}

struct StoreInner {
    config: SessionConfig,
    clock: SharedClock,
    state: Mutex<StoreState>,
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    sweeper: Mutex<Option<PeriodicTask>>,
}

/// Bounded, sweepable map of identity to [`Session`].
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_clock(config, Arc::new(DefaultClock))
    }

    pub fn with_clock(mut config: SessionConfig, clock: SharedClock) -> Self {
        if config.max_sessions == 0 {
            tracing::warn!("max_sessions is 0, holding one session");
            config.max_sessions = 1;
        }
        Self {
            inner: Arc::new(StoreInner {
                config,
                clock,
                state: Mutex::new(StoreState::default()),
                turn_locks: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.utc()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the background sweep. No-op when already running.
    pub fn start(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        *sweeper = Some(PeriodicTask::spawn(
            "session-sweep",
            self.inner.config.sweep_interval,
            move || {
                let store = weak.upgrade().map(|inner| Self { inner });
                async move {
                    store.is_some_and(|store| {
                        store.sweep();
                        true
                    })
                }
            },
        ));
        tracing::info!(
            max_sessions = self.inner.config.max_sessions,
            timeout_secs = self.inner.config.session_timeout.as_secs(),
            "Session store started"
        );
    }

    /// Cancel the sweep and drop every session
    pub async fn stop(&self) {
        let task = self.inner.sweeper.lock().take();
        if let Some(task) = task {
            task.cancel().await;
        }

        let mut state = self.inner.state.lock();
        state.sessions.clear();
        state.threads.clear();
        drop(state);
        self.inner.turn_locks.lock().clear();
        tracing::info!("Session store stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.sweeper.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Existing session (touched, channel updated) or a new one, evicting
    /// the least recently active session when at capacity.
    pub fn get_or_create(&self, identity: &str, channel: &str, kind: ChannelKind) -> Session {
        let now = self.now();
        let mut state = self.inner.state.lock();

        if let Some(session) = state.sessions.get_mut(identity) {
            session.touch(now);
            if session.channel != channel {
                tracing::debug!(identity, channel, "Session switched channel");
                session.channel = channel.to_string();
                session.channel_kind = kind;
            }
            return session.clone();
        }

        let evicted = if state.sessions.len() >= self.inner.config.max_sessions {
            state.evict_least_recent()
        } else {
            None
        };

        let session = Session::new(identity, channel, kind, now);
        state.sessions.insert(identity.to_string(), session.clone());
        drop(state);

        if let Some(evicted) = evicted {
            self.drop_turn_lock(&evicted);
            tracing::info!(evicted = %evicted, "Evicted least recently active session");
        }
        tracing::info!(identity, channel, "Created session");
        session
    }

    /// Snapshot of a session; counts as activity
    pub fn get_session(&self, identity: &str) -> Option<Session> {
        let now = self.now();
        let mut state = self.inner.state.lock();
        state.sessions.get_mut(identity).map(|session| {
            session.touch(now);
            session.clone()
        })
    }

    /// Replace the stored history
    pub fn update_history(&self, identity: &str, history: Conversation) -> bool {
        self.with_session(identity, |session, now| {
            session.history = history;
            session.touch(now);
        })
    }

    /// Clear the history, keeping the session
    pub fn reset_conversation(&self, identity: &str) -> bool {
        let found = self.with_session(identity, |session, now| {
            session.history.clear();
            session.touch(now);
        });
        if found {
            tracing::info!(identity, "Reset conversation");
        }
        found
    }

    pub fn remove_session(&self, identity: &str) -> bool {
        let removed = self.inner.state.lock().remove(identity).is_some();
        if removed {
            self.drop_turn_lock(identity);
            tracing::info!(identity, "Removed session");
        }
        removed
    }

    /// The last `limit` messages of the history (all of them when `limit` is 0)
    pub fn conversation_context(&self, identity: &str, limit: usize) -> Vec<Message> {
        let state = self.inner.state.lock();
        let Some(session) = state.sessions.get(identity) else {
            return Vec::new();
        };
        let messages = session.history.messages();
        let start = if limit == 0 { 0 } else { messages.len().saturating_sub(limit) };
        messages[start..].to_vec()
    }

    pub fn session_info(&self, identity: &str) -> Option<SessionInfo> {
        self.inner.state.lock().sessions.get(identity).map(Session::info)
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.inner.state.lock().sessions.values().map(Session::info).collect();
        infos.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        infos
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.inner.state.lock();
        let active_sessions = state.sessions.len();
        let direct_sessions = state.sessions.values().filter(|s| s.channel_kind.is_direct()).count();
        let active_threads = state.threads.len();
        drop(state);

        SessionStats {
            active_sessions,
            direct_sessions,
            indirect_sessions: active_sessions - direct_sessions,
            active_threads,
            max_sessions: self.inner.config.max_sessions,
            session_timeout_secs: self.inner.config.session_timeout.as_secs(),
            is_running: self.is_running(),
        }
    }

    fn with_session(&self, identity: &str, f: impl FnOnce(&mut Session, DateTime<Utc>)) -> bool {
        let now = self.now();
        let mut state = self.inner.state.lock();
        state.sessions.get_mut(identity).map(|session| f(session, now)).is_some()
    }

    // ========================================================================
    // Conversation flow
    // ========================================================================

    pub fn start_conversation(&self, identity: &str) -> bool {
        let found = self.with_session(identity, |session, now| session.start_conversation(now));
        if found {
            tracing::info!(identity, "Started conversation flow");
        }
        found
    }

    pub fn end_conversation(&self, identity: &str) -> bool {
        let found = self.with_session(identity, |session, _| session.end_conversation());
        if found {
            tracing::info!(identity, "Ended conversation flow");
        }
        found
    }

    pub fn is_conversation_active(&self, identity: &str) -> bool {
        self.inner
            .state
            .lock()
            .sessions
            .get(identity)
            .is_some_and(|s| s.conversation_active)
    }

    pub fn is_conversation_expired(&self, identity: &str) -> bool {
        let now = self.now();
        let timeout = self.inner.config.flow.flow_timeout;
        self.inner
            .state
            .lock()
            .sessions
            .get(identity)
            .is_some_and(|s| s.is_conversation_expired(now, timeout))
    }

    /// Close the flow if it has lapsed. True only on the call that closes it.
    pub fn check_flow_expiry(&self, identity: &str) -> bool {
        let now = self.now();
        let timeout = self.inner.config.flow.flow_timeout;
        let mut state = self.inner.state.lock();
        match state.sessions.get_mut(identity) {
            Some(session) if session.is_conversation_expired(now, timeout) => {
                session.end_conversation();
                drop(state);
                tracing::info!(identity, "Conversation flow expired");
                true
            }
            _ => false,
        }
    }

    /// Decide whether an inbound message is for the agent, applying flow
    /// transitions on the way. Does not count as session activity.
    pub fn route_inbound(&self, event: &InboundEvent) -> RouteDecision {
        let flow = &self.inner.config.flow;
        let identity = event.identity.as_str();

        if flow.is_end_command(&event.text) {
            if self.is_conversation_active(identity) {
                self.end_conversation(identity);
                return RouteDecision::Ended;
            }
            return RouteDecision::Ignore;
        }

        if event.channel_kind.is_direct() {
            return if flow.direct_always_triggers {
                RouteDecision::Respond
            } else {
                RouteDecision::Ignore
            };
        }

        if flow.mention_triggers && event.mentions_agent {
            if flow.enabled {
                self.get_or_create(identity, &event.channel, event.channel_kind);
                self.start_conversation(identity);
            }
            return RouteDecision::Respond;
        }

        if flow.enabled {
            let in_flow = self
                .inner
                .state
                .lock()
                .sessions
                .get(identity)
                .is_some_and(|s| s.conversation_active && s.channel == event.channel);
            if in_flow {
                return if self.check_flow_expiry(identity) {
                    RouteDecision::Expired
                } else {
                    RouteDecision::Respond
                };
            }
        }

        if let Some(thread) = event.thread_ref() {
            if self.thread_owner(thread).as_deref() == Some(identity) {
                return RouteDecision::Respond;
            }
        }

        RouteDecision::Ignore
    }

    // ========================================================================
    // Rate limiting
    // ========================================================================

    /// Admit one request for `identity`. An identity without a session is
    /// always admitted.
    pub fn check_rate_limit(&self, identity: &str) -> bool {
        let now = self.now();
        let limit = self.inner.config.rate_limit;
        let mut state = self.inner.state.lock();
        let admitted = state
            .sessions
            .get_mut(identity)
            .is_none_or(|session| session.rate.check(now, limit));
        drop(state);
        if !admitted {
            tracing::warn!(identity, "Rate limit exceeded");
        }
        admitted
    }

    // ========================================================================
    // Thread affinity
    // ========================================================================

    /// Bind `thread` to the identity's session
    pub fn set_thread_affinity(&self, identity: &str, thread: &str) -> bool {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let Some(session) = state.sessions.get_mut(identity) else {
            return false;
        };
        if let Some(previous) = session.thread.replace(thread.to_string()) {
            state.threads.remove(&previous);
        }
        // a thread belongs to one identity at a time
        if let Some(other) = state.threads.insert(thread.to_string(), identity.to_string()) {
            if other != identity {
                if let Some(s) = state.sessions.get_mut(&other) {
                    s.thread = None;
                }
            }
        }
        drop(guard);
        tracing::debug!(identity, thread, "Bound thread");
        true
    }

    pub fn thread_owner(&self, thread: &str) -> Option<String> {
        self.inner.state.lock().threads.get(thread).cloned()
    }

    pub fn release_thread(&self, thread: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(identity) = state.threads.remove(thread) else {
            return false;
        };
        if let Some(session) = state.sessions.get_mut(&identity) {
            session.thread = None;
        }
        true
    }

    // ========================================================================
    // Sweep and turn serialisation
    // ========================================================================

    /// Remove idle sessions and close lapsed flows
    pub fn sweep(&self) -> SweepReport {
        let now = self.now();
        let config = &self.inner.config;
        let mut report = SweepReport::default();

        let mut state = self.inner.state.lock();
        let expired: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.is_idle(now, config.session_timeout))
            .map(|s| s.identity.clone())
            .collect();
        for identity in &expired {
            state.remove(identity);
        }
        report.expired_sessions = expired;

        for session in state.sessions.values_mut() {
            if session.is_conversation_expired(now, config.flow.flow_timeout) {
                session.end_conversation();
                report.ended_flows.push(session.identity.clone());
            }
        }

        // locks of identities that no longer have a session and are not in a turn
        self.inner
            .turn_locks
            .lock()
            .retain(|identity, lock| Arc::strong_count(lock) > 1 || state.sessions.contains_key(identity));
        drop(state);
        if !report.expired_sessions.is_empty() {
            tracing::info!(count = report.expired_sessions.len(), "Swept expired sessions");
        }
        if !report.ended_flows.is_empty() {
            tracing::info!(count = report.ended_flows.len(), "Ended lapsed conversation flows");
        }
        report
    }

    /// Wait until no other turn of `identity` is running. Hold the guard for
    /// the whole turn.
    pub async fn lock_turn(&self, identity: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.inner
                .turn_locks
                .lock()
                .entry(identity.to_string())
                .or_default(),
        );
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn turn_lock_count(&self) -> usize {
        self.inner.turn_locks.lock().len()
    }

    fn drop_turn_lock(&self, identity: &str) {
        let mut locks = self.inner.turn_locks.lock();
        // keep locks somebody is holding or waiting on
        if locks.get(identity).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    fn store_with(config: SessionConfig) -> (SessionStore, Arc<ManualClock>) {
        let clock = ManualClock::new();
        (SessionStore::with_clock(config, clock.clone()), clock)
    }

    fn store() -> (SessionStore, Arc<ManualClock>) {
        store_with(SessionConfig::default())
    }

    #[test]
    fn test_get_or_create_reuses_session() {
        let (store, clock) = store();
        let first = store.get_or_create("u1", "c1", ChannelKind::Shared);
        clock.advance_secs(5);
        let second = store.get_or_create("u1", "c2", ChannelKind::Direct);

        assert_eq!(store.len(), 1);
        assert_eq!(second.channel, "c2");
        assert_eq!(second.channel_kind, ChannelKind::Direct);
        assert!(second.last_activity > first.last_activity);
    }

    #[test]
    fn test_full_store_evicts_least_recent() {
        let (store, clock) = store_with(SessionConfig {
            max_sessions: 3,
            ..Default::default()
        });
        store.get_or_create("a", "c1", ChannelKind::Shared);
        clock.advance_secs(1);
        store.get_or_create("b", "c1", ChannelKind::Shared);
        store.update_history("b", Conversation::from_messages(vec![Message::user("hi")]));
        clock.advance_secs(1);
        store.get_or_create("c", "c1", ChannelKind::Shared);
        clock.advance_secs(1);
        // "a" was created first but is now the most recent
        store.get_or_create("a", "c1", ChannelKind::Shared);
        clock.advance_secs(1);

        store.get_or_create("d", "c1", ChannelKind::Shared);
        assert_eq!(store.len(), 3);
        assert!(store.session_info("b").is_none());
        for id in ["a", "c", "d"] {
            assert!(store.session_info(id).is_some(), "{id}");
        }

        let back = store.get_or_create("b", "c1", ChannelKind::Shared);
        assert!(back.history.is_empty());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_eviction_releases_thread() {
        let (store, clock) = store_with(SessionConfig {
            max_sessions: 1,
            ..Default::default()
        });
        store.get_or_create("a", "c1", ChannelKind::Shared);
        store.set_thread_affinity("a", "t1");
        clock.advance_secs(1);
        store.get_or_create("b", "c1", ChannelKind::Shared);
        assert_eq!(store.thread_owner("t1"), None);
        assert_eq!(store.stats().active_threads, 0);
    }

    #[tokio::test]
    async fn test_eviction_drops_idle_turn_locks() {
        let (store, clock) = store_with(SessionConfig {
            max_sessions: 2,
            ..Default::default()
        });
        for i in 0..50 {
            let identity = format!("u{i}");
            let turn = store.lock_turn(&identity).await;
            store.get_or_create(&identity, "c1", ChannelKind::Shared);
            drop(turn);
            clock.advance_secs(1);
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.turn_lock_count(), 2);

        store.sweep();
        assert_eq!(store.turn_lock_count(), 2);
    }

    #[tokio::test]
    async fn test_eviction_keeps_a_held_turn_lock() {
        let (store, clock) = store_with(SessionConfig {
            max_sessions: 1,
            ..Default::default()
        });
        let turn = store.lock_turn("a").await;
        store.get_or_create("a", "c1", ChannelKind::Shared);
        clock.advance_secs(1);
        store.get_or_create("b", "c1", ChannelKind::Shared);
        assert_eq!(store.turn_lock_count(), 1);

        // the holder finishes; the orphaned lock goes with the next sweep
        drop(turn);
        store.sweep();
        assert_eq!(store.turn_lock_count(), 0);
    }

    #[test]
    fn test_zero_capacity_holds_one_session() {
        let config = SessionConfig {
            max_sessions: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));

        let (store, clock) = store_with(config);
        store.get_or_create("a", "c1", ChannelKind::Shared);
        clock.advance_secs(1);
        store.get_or_create("b", "c1", ChannelKind::Shared);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().max_sessions, 1);
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let config = SessionConfig {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sweep_interval_is_not_reported_running() {
        let (store, _) = store_with(SessionConfig {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        });
        store.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!store.is_running());
        store.stop().await;
    }

    #[test]
    fn test_list_sessions_most_recent_first() {
        let (store, clock) = store();
        for id in ["a", "b", "c"] {
            store.get_or_create(id, "c1", ChannelKind::Shared);
            clock.advance_secs(1);
        }
        store.get_session("a");

        let order: Vec<String> = store.list_sessions().into_iter().map(|s| s.identity).collect();
        assert_eq!(order, vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn test_remove_session_releases_thread_and_turn_lock() {
        let (store, _) = store();
        drop(store.lock_turn("a").await);
        store.get_or_create("a", "c1", ChannelKind::Shared);
        store.set_thread_affinity("a", "t1");
        assert_eq!(store.turn_lock_count(), 1);

        assert!(store.remove_session("a"));
        assert_eq!(store.thread_owner("t1"), None);
        assert_eq!(store.turn_lock_count(), 0);
        assert!(store.session_info("a").is_none());
        assert!(!store.remove_session("a"));
    }

    #[test]
    fn test_rate_limit_through_store() {
        let (store, clock) = store();
        // no session yet
        assert!(store.check_rate_limit("u1"));

        store.get_or_create("u1", "c1", ChannelKind::Shared);
        clock.advance_secs(1);
        for _ in 0..5 {
            assert!(store.check_rate_limit("u1"));
        }
        assert!(!store.check_rate_limit("u1"));

        clock.advance_secs(61);
        assert!(store.check_rate_limit("u1"));
        assert_eq!(store.session_info("u1").unwrap().rate_limit_count, 1);
    }

    #[test]
    fn test_flow_expiry_is_observed_once() {
        let (store, clock) = store();
        store.get_or_create("u1", "c1", ChannelKind::Shared);
        store.start_conversation("u1");
        assert!(!store.is_conversation_expired("u1"));

        clock.advance_secs(90);
        assert!(!store.is_conversation_expired("u1"));
        clock.advance_secs(1);
        assert!(store.is_conversation_expired("u1"));

        assert!(store.check_flow_expiry("u1"));
        assert!(!store.is_conversation_active("u1"));
        assert!(!store.check_flow_expiry("u1"));
        assert!(!store.is_conversation_expired("u1"));
        // the session itself survives
        assert!(store.session_info("u1").is_some());
    }

    #[test]
    fn test_route_mention_then_follow_up() {
        let (store, clock) = store();
        let plain = InboundEvent::new("u1", "c1", "what's on today?");
        assert_eq!(store.route_inbound(&plain), RouteDecision::Ignore);

        let mention = InboundEvent::new("u1", "c1", "hey agent").mentioning();
        assert_eq!(store.route_inbound(&mention), RouteDecision::Respond);
        assert!(store.is_conversation_active("u1"));

        clock.advance_secs(30);
        assert_eq!(store.route_inbound(&plain), RouteDecision::Respond);

        // other channel is not part of the flow
        let elsewhere = InboundEvent::new("u1", "c2", "hello");
        assert_eq!(store.route_inbound(&elsewhere), RouteDecision::Ignore);
    }

    #[test]
    fn test_route_reports_expired_flow_once() {
        let (store, clock) = store();
        store.route_inbound(&InboundEvent::new("u1", "c1", "hi").mentioning());
        clock.advance_secs(120);

        let follow_up = InboundEvent::new("u1", "c1", "still there?");
        assert_eq!(store.route_inbound(&follow_up), RouteDecision::Expired);
        assert_eq!(store.route_inbound(&follow_up), RouteDecision::Ignore);
    }

    #[test]
    fn test_route_end_command() {
        let (store, _) = store();
        let end = InboundEvent::new("u1", "c1", "!stop");
        assert_eq!(store.route_inbound(&end), RouteDecision::Ignore);

        store.route_inbound(&InboundEvent::new("u1", "c1", "hi").mentioning());
        assert_eq!(store.route_inbound(&end), RouteDecision::Ended);
        assert!(!store.is_conversation_active("u1"));
        // end commands are never agent input, even in direct channels
        assert_eq!(store.route_inbound(&InboundEvent::new("u1", "d1", "end").direct()), RouteDecision::Ignore);
    }

    #[test]
    fn test_route_direct_and_thread() {
        let (store, _) = store();
        assert_eq!(
            store.route_inbound(&InboundEvent::new("u1", "d1", "hello").direct()),
            RouteDecision::Respond
        );

        let in_thread = InboundEvent::new("u1", "c1", "more").in_thread("t1");
        assert_eq!(store.route_inbound(&in_thread), RouteDecision::Ignore);

        store.get_or_create("u1", "c1", ChannelKind::Shared);
        store.set_thread_affinity("u1", "t1");
        assert_eq!(store.route_inbound(&in_thread), RouteDecision::Respond);

        let stranger = InboundEvent::new("u2", "c1", "me too").in_thread("t1");
        assert_eq!(store.route_inbound(&stranger), RouteDecision::Ignore);
    }

    #[test]
    fn test_thread_affinity_moves_between_identities() {
        let (store, _) = store();
        store.get_or_create("u1", "c1", ChannelKind::Shared);
        store.get_or_create("u2", "c1", ChannelKind::Shared);
        store.set_thread_affinity("u1", "t1");
        store.set_thread_affinity("u2", "t1");

        assert_eq!(store.thread_owner("t1").as_deref(), Some("u2"));
        assert_eq!(store.session_info("u1").unwrap().thread, None);
        assert!(store.release_thread("t1"));
        assert_eq!(store.session_info("u2").unwrap().thread, None);
        assert!(!store.release_thread("t1"));
    }

    #[test]
    fn test_sweep_removes_idle_and_ends_flows() {
        let (store, clock) = store();
        store.get_or_create("idle", "c1", ChannelKind::Direct);
        store.set_thread_affinity("idle", "t1");
        clock.advance_secs(1700);

        store.get_or_create("flowing", "c1", ChannelKind::Shared);
        store.start_conversation("flowing");
        clock.advance_secs(101);

        let report = store.sweep();
        assert_eq!(report.expired_sessions, vec!["idle".to_string()]);
        assert_eq!(report.ended_flows, vec!["flowing".to_string()]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.thread_owner("t1"), None);
        assert!(!store.is_conversation_active("flowing"));
    }

    #[test]
    fn test_stats_and_context() {
        let (store, _) = store();
        store.get_or_create("a", "d1", ChannelKind::Direct);
        store.get_or_create("b", "c1", ChannelKind::Shared);
        store.set_thread_affinity("b", "t9");
        store.update_history(
            "b",
            Conversation::from_messages(vec![
                Message::user("1"),
                Message::assistant("2"),
                Message::user("3"),
            ]),
        );

        let stats = store.stats();
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.direct_sessions, 1);
        assert_eq!(stats.indirect_sessions, 1);
        assert_eq!(stats.active_threads, 1);
        assert!(!stats.is_running);

        let context = store.conversation_context("b", 2);
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].content, "2");
        assert_eq!(store.conversation_context("b", 0).len(), 3);
        assert!(store.conversation_context("nobody", 5).is_empty());

        assert!(store.reset_conversation("b"));
        assert_eq!(store.session_info("b").unwrap().conversation_length, 0);
        assert!(!store.reset_conversation("nobody"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_runs_and_stops() {
        let (store, clock) = store_with(SessionConfig {
            sweep_interval: Duration::from_secs(60),
            ..Default::default()
        });
        store.get_or_create("u1", "c1", ChannelKind::Shared);
        store.start();
        assert!(store.stats().is_running);

        clock.advance_secs(1801);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(store.is_empty());

        store.get_or_create("u2", "c1", ChannelKind::Shared);
        store.stop().await;
        assert!(!store.is_running());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_turn_lock_serialises_identity() {
        let (store, _) = store();
        let guard = store.lock_turn("u1").await;

        let other = store.clone();
        let waiter = tokio::spawn(async move {
            let _turn = other.lock_turn("u1").await;
        });
        // a different identity is not blocked
        drop(store.lock_turn("u2").await);

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
