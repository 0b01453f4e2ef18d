//! In-memory test doubles for backends, providers and time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use mockable::Clock;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::provider::{Completion, CompletionRequest, LlmProvider, ModelInfo};
use crate::registry::{BackendConfig, BackendFactory};
use crate::tool::{ToolBackend, ToolCall, ToolCallResult, ToolDefinition};

type CallHandler = Box<dyn Fn(&str, &Value) -> String + Send + Sync>;

/// Scriptable tool backend
pub struct MockBackend {
    id: String,
    tools: Vec<ToolDefinition>,
    fail_connect: bool,
    fail_list: bool,
    fail_close: bool,
    fail_calls: Option<String>,
    delay: Option<Duration>,
    handler: Option<CallHandler>,
    calls: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockBackend {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            tools: Vec::new(),
            fail_connect: false,
            fail_list: false,
            fail_close: false,
            fail_calls: None,
            delay: None,
            handler: None,
            calls: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Backend `math` whose `add` tool sums `a` and `b`
    pub fn math() -> Self {
        Self::new("math").with_tool("add").with_handler(|_, args| {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            (a + b).to_string()
        })
    }

    pub fn with_tool(mut self, name: &str) -> Self {
        self.tools.push(ToolDefinition {
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
        });
        self
    }

    pub fn with_handler(mut self, f: impl Fn(&str, &Value) -> String + Send + Sync + 'static) -> Self {
        self.handler = Some(Box::new(f));
        self
    }

    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub const fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub const fn failing_list(mut self) -> Self {
        self.fail_list = true;
        self
    }

    pub const fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn failing_calls(mut self, message: &str) -> Self {
        self.fail_calls = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolBackend for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<()> {
        if self.fail_connect {
            return Err(AgentError::Transport("connection refused".into()));
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list {
            return Err(AgentError::Transport("listing timed out".into()));
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        self.calls.lock().push(name.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(message) = &self.fail_calls {
            return Err(AgentError::Other(message.clone()));
        }
        let output = self
            .handler
            .as_ref()
            .map_or_else(|| format!("{name} ok"), |h| h(name, &arguments));
        Ok(ToolCallResult::success(self.id.clone(), output))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(AgentError::Transport("close failed".into()));
        }
        Ok(())
    }
}

/// Factory handing out pre-built mock backends by id
pub struct MockFactory {
    backends: Vec<Arc<MockBackend>>,
}

impl MockFactory {
    pub fn new(backends: Vec<MockBackend>) -> Self {
        Self {
            backends: backends.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn handles(&self) -> Vec<Arc<MockBackend>> {
        self.backends.clone()
    }
}

impl BackendFactory for MockFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn ToolBackend>> {
        self.backends
            .iter()
            .find(|b| b.id() == config.id)
            .map(|b| Arc::clone(b) as Arc<dyn ToolBackend>)
            .ok_or_else(|| AgentError::Config(format!("no mock for '{}'", config.id)))
    }
}

/// What the provider was asked on one round-trip
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
}

enum Script {
    Queue(VecDeque<Result<Completion>>),
    Forever(Vec<ToolCall>),
}

/// Provider that replays scripted completions
pub struct ScriptedProvider {
    script: Mutex<Script>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<Completion>>) -> Self {
        Self {
            script: Mutex::new(Script::Queue(responses.into())),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always proposes the same tool calls
    pub fn forever(calls: Vec<ToolCall>) -> Self {
        Self {
            script: Mutex::new(Script::Forever(calls)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn round_trips(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion> {
        self.requests.lock().push(RecordedRequest {
            system_prompt: request.system_prompt.to_string(),
            messages: request.messages.to_vec(),
            tool_names: request.tools.iter().map(|t| t.function.name.clone()).collect(),
        });

        match &mut *self.script.lock() {
            Script::Queue(queue) => queue
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::Provider("script exhausted".into()))),
            Script::Forever(calls) => Ok(Completion::tool_calls("", calls.clone())),
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc::now()),
        })
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(chrono::Duration::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
