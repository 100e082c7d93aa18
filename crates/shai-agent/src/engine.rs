//! Conversation engine
//!
//! Runs one user turn against a provider: streams the reply, dispatches any
//! function calls the model requests, feeds the results back and repeats
//! until the model answers with plain text.

use futures::future::join_all;
use shai_llm::{
    CompletionOptions, CompletionResult, CompletionStream, FunctionCall, FunctionCallPolicy,
    FunctionResult, LlmProvider, Message, TokenSink, TokenUsage, stream,
};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::function::FunctionRegistry;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Never retry
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    fn delay_for_error(&self, error: &shai_llm::Error, attempt: u32) -> Duration {
        match error {
            shai_llm::Error::RateLimited {
                retry_after: Some(secs),
            } => Duration::from_secs(*secs).min(self.max_delay),
            _ => self.delay_for_attempt(attempt),
        }
    }
}

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model identifier passed to the provider
    pub model: String,
    /// Prepended to every request, never stored in the history
    pub system_prompt: Option<String>,
    /// Function-call rounds allowed per turn
    pub max_function_rounds: usize,
    /// Run the calls of one round concurrently
    pub parallel_function_calls: bool,
    pub retry: RetryConfig,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl EngineConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            max_function_rounds: 8,
            parallel_function_calls: false,
            retry: RetryConfig::default(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Where a turn is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingProviderResponse,
    StreamingTokens,
    FunctionCallRequested,
    DispatchingTools,
    Done,
}

/// A completed turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// The input history followed by everything this turn added
    pub history: Vec<Message>,
    /// Usage summed over every provider call of the turn
    pub usage: TokenUsage,
}

impl TurnOutcome {
    /// The final assistant reply
    pub fn reply(&self) -> Option<&str> {
        match self.history.last() {
            Some(Message::Assistant(text)) => Some(text),
            _ => None,
        }
    }
}

pub struct ConversationEngine {
    provider: Arc<dyn LlmProvider>,
    functions: FunctionRegistry,
    config: EngineConfig,
}

impl ConversationEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        functions: FunctionRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            functions,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Run a turn letting the model decide whether to call functions
    pub async fn run_turn(
        &self,
        history: &[Message],
        input: &str,
        on_token: &mut TokenSink<'_>,
    ) -> Result<TurnOutcome> {
        self.run_turn_with_policy(history, input, FunctionCallPolicy::Auto, on_token)
            .await
    }

    /// Run a turn with `policy` applied to the first provider call.
    ///
    /// Follow-up calls after function results always use
    /// [`FunctionCallPolicy::Auto`].
    pub async fn run_turn_with_policy(
        &self,
        history: &[Message],
        input: &str,
        policy: FunctionCallPolicy,
        on_token: &mut TokenSink<'_>,
    ) -> Result<TurnOutcome> {
        let mut working = history.to_vec();
        working.push(Message::user(input));

        let mut usage = TokenUsage::new(self.config.model.clone());
        let mut policy = policy;
        let mut rounds = 0usize;

        loop {
            trace_state(TurnState::AwaitingProviderResponse);
            let options = self.options(policy);
            let events = self.open_stream(&self.request_messages(&working), &options).await?;

            trace_state(TurnState::StreamingTokens);
            let result = stream::drain(events, on_token).await?;
            if let Some(call_usage) = result.usage {
                usage.record(call_usage);
            }

            if !result.has_function_calls() {
                working.push(Message::assistant(result.content));
                trace_state(TurnState::Done);
                return Ok(TurnOutcome {
                    history: working,
                    usage,
                });
            }

            trace_state(TurnState::FunctionCallRequested);
            if rounds >= self.config.max_function_rounds {
                tracing::warn!(
                    "Model still requesting functions after {} rounds, giving up",
                    rounds
                );
                return Err(Error::ToolLoopExceeded { rounds, usage });
            }
            rounds += 1;

            let CompletionResult {
                content,
                function_calls,
                ..
            } = result;
            if !content.trim().is_empty() {
                working.push(Message::assistant(content));
            }

            let calls: Vec<FunctionCall> = function_calls.into_iter().map(ensure_call_id).collect();

            trace_state(TurnState::DispatchingTools);
            let results = self.dispatch_all(&calls).await;
            for (call, result) in calls.into_iter().zip(results) {
                working.push(Message::function_call(call));
                working.push(Message::function_result(result));
            }

            policy = FunctionCallPolicy::Auto;
        }
    }

    fn options(&self, policy: FunctionCallPolicy) -> CompletionOptions {
        CompletionOptions {
            model: self.config.model.clone(),
            functions: self.functions.definitions(),
            function_call: policy,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    fn request_messages(&self, working: &[Message]) -> Vec<Message> {
        match &self.config.system_prompt {
            Some(prompt) => std::iter::once(Message::system(prompt.clone()))
                .chain(working.iter().cloned())
                .collect(),
            None => working.to_vec(),
        }
    }

    /// Start a provider stream, retrying transient failures
    async fn open_stream(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<CompletionStream> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            match self.provider.stream(messages, options).await {
                Ok(events) => return Ok(events),
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    let delay = retry.delay_for_error(&e, attempt);
                    tracing::warn!(
                        "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt + 1,
                        retry.max_retries + 1,
                        e,
                        delay
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run one round of calls; results come back in call order
    async fn dispatch_all(&self, calls: &[FunctionCall]) -> Vec<FunctionResult> {
        for call in calls {
            tracing::info!("Calling function {} ({})", call.name, call.call_id);
        }

        if self.config.parallel_function_calls {
            join_all(calls.iter().map(|call| self.functions.dispatch_call(call))).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.functions.dispatch_call(call).await);
            }
            results
        }
    }
}

fn trace_state(state: TurnState) {
    tracing::debug!("Turn state: {:?}", state);
}

fn ensure_call_id(mut call: FunctionCall) -> FunctionCall {
    if call.call_id.is_empty() {
        call.call_id = format!("call_{}", uuid::Uuid::new_v4().simple());
    }
    call
}
