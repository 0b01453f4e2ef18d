//! Conversation Flow
//!
//! Decides whether an inbound message is agent input. A session starts
//! Idle; a trigger (mention) makes its flow Active so that follow-up
//! messages on the same channel need no further trigger. An Active flow
//! whose last activity is older than the flow timeout is Expired, which is
//! only noticed when the next message arrives.
//!
//! The state transitions themselves live on
//! [`SessionStore::route_inbound`](crate::session::SessionStore::route_inbound).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Conversation-flow settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowConfig {
    /// Keep listening after a trigger
    pub enabled: bool,

    /// Inactivity after which an active flow lapses
    pub flow_timeout: Duration,

    /// Direct (one-to-one) channels never need a trigger
    pub direct_always_triggers: bool,

    /// A mention of the agent is a trigger
    pub mention_triggers: bool,

    /// Words that end a flow, with or without `!` / `/` prefix
    pub end_commands: Vec<String>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flow_timeout: Duration::from_secs(90),
            direct_always_triggers: true,
            mention_triggers: true,
            end_commands: vec!["end".into(), "stop".into()],
        }
    }
}

impl FlowConfig {
    /// Whether `text` is exactly an end command
    pub fn is_end_command(&self, text: &str) -> bool {
        let text = text.trim().to_lowercase();
        let bare = text
            .strip_prefix('!')
            .or_else(|| text.strip_prefix('/'))
            .unwrap_or(&text);
        self.end_commands.iter().any(|cmd| cmd.eq_ignore_ascii_case(bare))
    }
}

/// Kind of channel a message arrived on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// One-to-one channel with the agent
    Direct,
    /// Channel shared by many identities
    #[default]
    Shared,
    /// Thread spun off a shared channel
    Thread,
}

impl ChannelKind {
    pub const fn is_direct(self) -> bool {
        matches!(self, Self::Direct)
    }
}

/// One inbound message as seen by flow routing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundEvent {
    pub identity: String,
    pub channel: String,
    #[serde(default)]
    pub channel_kind: ChannelKind,
    /// Thread reference; defaults to `channel` for thread messages
    #[serde(default)]
    pub thread: Option<String>,
    pub text: String,
    #[serde(default)]
    pub mentions_agent: bool,
}

impl InboundEvent {
    pub fn new(identity: impl Into<String>, channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            channel: channel.into(),
            channel_kind: ChannelKind::Shared,
            thread: None,
            text: text.into(),
            mentions_agent: false,
        }
    }

    #[must_use]
    pub const fn direct(mut self) -> Self {
        self.channel_kind = ChannelKind::Direct;
        self
    }

    #[must_use]
    pub const fn mentioning(mut self) -> Self {
        self.mentions_agent = true;
        self
    }

    #[must_use]
    pub fn in_thread(mut self, thread: impl Into<String>) -> Self {
        self.channel_kind = ChannelKind::Thread;
        self.thread = Some(thread.into());
        self
    }

    /// Thread this message belongs to, if any
    pub fn thread_ref(&self) -> Option<&str> {
        match self.channel_kind {
            ChannelKind::Thread => Some(self.thread.as_deref().unwrap_or(&self.channel)),
            _ => None,
        }
    }
}

/// What to do with an inbound message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    /// Hand the message to the agent
    Respond,
    /// Not addressed to the agent
    Ignore,
    /// An end command closed the active flow
    Ended,
    /// The active flow had lapsed and is now closed
    Expired,
}

impl RouteDecision {
    pub const fn should_respond(self) -> bool {
        matches!(self, Self::Respond)
    }

    /// Text to show the user, if the decision warrants one
    pub const fn notice(self) -> Option<&'static str> {
        match self {
            Self::Ended => Some("Conversation ended. Mention me again to start a new conversation!"),
            Self::Expired => {
                Some("Conversation expired due to inactivity. Mention me again to start a new conversation!")
            }
            Self::Respond | Self::Ignore => None,
        }
    }
}
