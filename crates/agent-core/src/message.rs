//! Conversation Messages
//!
//! Standard message format used across the agent system, plus the
//! append-only conversation history kept per session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::ToolCall;

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool result (injected as context)
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Text content
    pub content: String,

    /// Tool calls proposed by the assistant in this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Call this message answers (tool messages only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Optional name (tool name for tool messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message carrying tool-call descriptors
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// Create a tool result message answering `call`
    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(call.id.clone());
        msg.name = Some(call.name.clone());
        msg
    }

    /// Whether this assistant message asked for tools
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Conversation history with utility methods
///
/// Messages are only ever appended. Trimming for the provider happens on a
/// borrowed window, never on the stored history.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub const fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    pub const fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Add a message
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Append several messages in order
    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Get the last message
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Remove every message
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// The most recent messages to send to a provider.
    ///
    /// Returns roughly the last `limit` messages, but the window always starts
    /// on a turn boundary (a user message) when one is available, and never
    /// starts on a tool result: an assistant tool-call message and its tool
    /// results stay together.
    pub fn window(&self, limit: usize) -> &[Message] {
        let len = self.messages.len();
        if len <= limit {
            return &self.messages;
        }

        let candidate = len - limit;
        let tail = &self.messages[candidate..];

        let start = tail
            .iter()
            .position(|m| m.role == Role::User)
            .or_else(|| tail.iter().position(|m| m.role != Role::Tool))
            .map_or_else(
                || {
                    // Entirely tool results: walk back to the assistant that asked for them.
                    self.messages[..candidate]
                        .iter()
                        .rposition(|m| m.role != Role::Tool)
                        .unwrap_or(0)
                },
                |offset| candidate + offset,
            );

        &self.messages[start..]
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Self::from_messages(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "math__add", "{}")
    }

    fn tool_round(conv: &mut Conversation, ids: &[&str]) {
        let calls: Vec<ToolCall> = ids.iter().map(|id| call(id)).collect();
        conv.push(Message::assistant_tool_calls("", calls.clone()));
        for c in &calls {
            conv.push(Message::tool_result(c, "15"));
        }
    }

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello");
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn test_tool_result_links_call() {
        let c = call("call_1");
        let msg = Message::tool_result(&c, "15");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("math__add"));
    }

    #[test]
    fn test_window_returns_everything_when_short() {
        let mut conv = Conversation::new();
        conv.push(Message::user("Hi"));
        conv.push(Message::assistant("Hello!"));
        assert_eq!(conv.window(10).len(), 2);
    }

    #[test]
    fn test_window_drops_whole_turns_from_front() {
        let mut conv = Conversation::new();
        for i in 0..6 {
            conv.push(Message::user(format!("q{i}")));
            conv.push(Message::assistant(format!("a{i}")));
        }
        // 12 messages, limit 5 -> candidate start lands on an assistant reply,
        // so the window advances to the next user message.
        let window = conv.window(5);
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].role, Role::User);
        assert_eq!(window[0].content, "q4");
    }

    #[test]
    fn test_window_never_starts_with_tool_result() {
        let mut conv = Conversation::new();
        conv.push(Message::user("plan my week"));
        tool_round(&mut conv, &["a", "b", "c"]);
        tool_round(&mut conv, &["d", "e", "f"]);
        conv.push(Message::assistant("done"));

        for limit in 1..conv.len() {
            let window = conv.window(limit);
            assert_ne!(window[0].role, Role::Tool, "limit {limit}");
            // every tool result in the window has its assistant call in the window
            for (idx, msg) in window.iter().enumerate() {
                if msg.role == Role::Tool {
                    let id = msg.tool_call_id.clone().unwrap();
                    assert!(window[..idx]
                        .iter()
                        .any(|m| m.tool_calls.iter().any(|c| c.id == id)));
                }
            }
        }
    }

    #[test]
    fn test_window_walks_back_when_tail_is_all_tool_results() {
        let mut conv = Conversation::new();
        conv.push(Message::user("go"));
        tool_round(&mut conv, &["a", "b", "c"]);
        let window = conv.window(2);
        assert_eq!(window[0].role, Role::Assistant);
        assert_eq!(window.len(), 4);
    }

    #[test]
    fn test_conversation() {
        let mut conv = Conversation::new();
        conv.push(Message::user("Hi"));
        conv.push(Message::assistant("Hello!"));

        assert_eq!(conv.len(), 2);
        assert!(conv.last().unwrap().role == Role::Assistant);
        conv.clear();
        assert!(conv.is_empty());
    }
}
