//! Reasoning Loop
//!
//! Drives one turn: ask the provider, run every proposed tool call of the
//! batch concurrently through the registry, fold the results back into the
//! history, and repeat until the provider answers in plain text or the
//! iteration cap is hit.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::message::{Conversation, Message};
use crate::provider::{CompletionRequest, GenerationOptions, LlmProvider};
use crate::registry::BackendRegistry;
use crate::tool::{FunctionSchema, ToolCall};

/// Reply used when the iteration cap is reached
pub const ITERATION_LIMIT_REPLY: &str =
    "Task completed successfully! Is there anything else I can help you with?";

/// Reply used when the provider answers with empty text
const EMPTY_REPLY: &str = "Task completed successfully!";

/// Agent configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// System prompt
    pub system_prompt: String,

    /// Maximum provider round-trips per turn
    pub max_iterations: usize,

    /// Messages of history sent to the provider
    pub history_window: usize,

    /// Generation options
    pub generation: GenerationOptions,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_iterations: 10,
            history_window: 10,
            generation: GenerationOptions::default(),
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = r"You are a helpful AI assistant with access to tools from several services.

Tool names are prefixed with the service they belong to, e.g. `calendar__list-events`.
Call tools whenever they help answer the request; independent calls can be issued together.
If a tool fails, explain the error and suggest what the user can do instead.
Be concise and accurate.";

/// How a turn ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Provider produced a final answer
    Final,
    /// Iteration cap reached; canned reply returned
    IterationLimit,
    /// Provider call failed; apology returned
    ProviderFailed,
}

/// Result of one turn
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub reply: String,
    pub status: TurnStatus,
    /// Provider round-trips performed
    pub round_trips: usize,
    /// Tool calls dispatched
    pub tool_calls: usize,
}

/// The main Agent struct
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent
    pub fn new(provider: Arc<dyn LlmProvider>, config: AgentConfig) -> Self {
        Self { provider, config }
    }

    /// Append `user_input` to `history` and run the turn.
    ///
    /// `history` is the full, untrimmed session history; it comes back with
    /// every assistant, tool and final message appended.
    pub async fn run_turn(
        &self,
        registry: &BackendRegistry,
        history: &mut Conversation,
        user_input: &str,
    ) -> TurnOutcome {
        history.push(Message::user(user_input));
        self.run(registry, history).await
    }

    /// Run the loop over an existing history
    pub async fn run(&self, registry: &BackendRegistry, history: &mut Conversation) -> TurnOutcome {
        let catalog = registry.catalog(true).await;
        let schemas: Vec<FunctionSchema> = catalog.iter().map(FunctionSchema::from).collect();

        let mut round_trips = 0;
        let mut tool_calls = 0;

        loop {
            if round_trips >= self.config.max_iterations {
                tracing::warn!(iterations = round_trips, "Iteration limit reached");
                history.push(Message::assistant(ITERATION_LIMIT_REPLY));
                return TurnOutcome {
                    reply: ITERATION_LIMIT_REPLY.into(),
                    status: TurnStatus::IterationLimit,
                    round_trips,
                    tool_calls,
                };
            }
            round_trips += 1;

            let request = CompletionRequest {
                system_prompt: &self.config.system_prompt,
                messages: history.window(self.config.history_window),
                tools: &schemas,
                options: &self.config.generation,
            };

            let completion = match self.provider.complete(request).await {
                Ok(completion) => completion,
                Err(e) => {
                    tracing::error!(
                        iteration = round_trips,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Provider call failed"
                    );
                    let reply = apology(&e);
                    history.push(Message::assistant(reply.clone()));
                    return TurnOutcome {
                        reply,
                        status: TurnStatus::ProviderFailed,
                        round_trips,
                        tool_calls,
                    };
                }
            };

            if !completion.wants_tools() {
                let reply = if completion.content.trim().is_empty() {
                    EMPTY_REPLY.to_string()
                } else {
                    completion.content
                };
                history.push(Message::assistant(reply.clone()));
                return TurnOutcome {
                    reply,
                    status: TurnStatus::Final,
                    round_trips,
                    tool_calls,
                };
            }

            let calls: Vec<ToolCall> = completion
                .tool_calls
                .into_iter()
                .map(|mut call| {
                    if call.id.is_empty() {
                        call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
                    }
                    call
                })
                .collect();

            tracing::debug!(iteration = round_trips, calls = calls.len(), "Executing tool batch");
            let outputs = self.dispatch_batch(registry, &calls).await;
            tool_calls += calls.len();

            let results: Vec<Message> = calls
                .iter()
                .zip(outputs)
                .map(|(call, output)| Message::tool_result(call, output))
                .collect();
            history.push(Message::assistant_tool_calls(completion.content, calls));
            history.extend(results);
        }
    }

    /// Dispatch every call concurrently and wait for all of them.
    /// Output order matches `calls`.
    async fn dispatch_batch(&self, registry: &BackendRegistry, calls: &[ToolCall]) -> Vec<String> {
        join_all(calls.iter().map(|call| Self::dispatch(registry, call))).await
    }

    async fn dispatch(registry: &BackendRegistry, call: &ToolCall) -> String {
        let arguments = call.parsed_arguments();
        match registry.call_by_namespaced_name(&call.name, arguments).await {
            Ok((_, result)) => result.to_message_content(),
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "Tool call failed");
                format!("Error: {e}")
            }
        }
    }

    /// Get configuration
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Get the provider
    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }
}

fn apology(err: &AgentError) -> String {
    format!(
        "I apologize, but I encountered an error while processing your request: {}",
        err.user_message()
    )
}

/// Builder for Agent configuration
#[derive(Default)]
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    config: AgentConfig,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    #[must_use]
    pub const fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = temp;
        self
    }

    #[must_use]
    pub const fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    #[must_use]
    pub const fn history_window(mut self, messages: usize) -> Self {
        self.config.history_window = messages;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        if self.config.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }

        Ok(Agent::new(provider, self.config))
    }
}
