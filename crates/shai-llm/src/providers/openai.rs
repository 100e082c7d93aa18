//! OpenAI Chat Completions API provider
//!
//! Also serves OpenAI-compatible endpoints (Groq, OpenRouter, Ollama) through
//! a configurable base URL.

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use super::{LlmProvider, map_sse_error, open_event_source};
use crate::{
    error::{Error, Result},
    stream::{CompletionBuilder, CompletionEvent, CompletionStream},
    types::{CompletionOptions, FunctionCallPolicy, FunctionDefinition, Message, Usage},
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI API client
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    /// Create a new OpenAI provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the client at an OpenAI-compatible endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn headers(&self) -> Result<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        if !self.api_key.is_empty() {
            let value = format!("Bearer {}", self.api_key)
                .parse()
                .map_err(|_| Error::InvalidApiKey)?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        Ok(headers)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn stream(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<CompletionStream> {
        let request = build_request(messages, options);
        let url = format!("{}/chat/completions", self.base_url);

        tracing::debug!(
            "OpenAI request to {}: model={}, {} messages, {} functions",
            url,
            options.model,
            request.messages.len(),
            options.functions.len()
        );

        let request_builder = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&request);

        let event_source = open_event_source(request_builder).await?;
        Ok(Box::pin(create_stream(event_source)))
    }
}

fn build_request(messages: &[Message], options: &CompletionOptions) -> OpenAIRequest {
    let tools: Vec<OpenAITool> = options.functions.iter().map(convert_function).collect();

    let tool_choice = if tools.is_empty() {
        None
    } else {
        Some(match &options.function_call {
            FunctionCallPolicy::Auto => serde_json::json!("auto"),
            FunctionCallPolicy::None => serde_json::json!("none"),
            FunctionCallPolicy::Forced(name) => serde_json::json!({
                "type": "function",
                "function": { "name": name }
            }),
        })
    };

    OpenAIRequest {
        model: options.model.clone(),
        messages: convert_messages(messages),
        stream: true,
        stream_options: StreamOptions {
            include_usage: true,
        },
        max_tokens: options.max_tokens,
        temperature: options.temperature,
        tools: if tools.is_empty() { None } else { Some(tools) },
        tool_choice,
    }
}

fn convert_function(definition: &FunctionDefinition) -> OpenAITool {
    OpenAITool {
        tool_type: "function".to_string(),
        function: OpenAIFunction {
            name: definition.name.clone(),
            description: Some(definition.description.clone()),
            parameters: Some(definition.json_schema()),
        },
    }
}

fn text_message(role: &str, text: &str) -> OpenAIMessage {
    OpenAIMessage {
        role: role.to_string(),
        content: Some(text.to_string()),
        tool_calls: None,
        tool_call_id: None,
    }
}

fn convert_messages(messages: &[Message]) -> Vec<OpenAIMessage> {
    let mut result: Vec<OpenAIMessage> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg {
            Message::System(text) => result.push(text_message("system", text)),
            Message::User(text) => result.push(text_message("user", text)),
            Message::Assistant(text) => result.push(text_message("assistant", text)),
            Message::FunctionCall(calls) => {
                let tool_calls: Vec<OpenAIToolCall> = calls
                    .iter()
                    .map(|call| OpenAIToolCall {
                        id: call.call_id.clone(),
                        call_type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments_value().to_string(),
                        },
                    })
                    .collect();

                // Text spoken alongside the calls belongs to the same assistant turn
                match result.last_mut() {
                    Some(last) if last.role == "assistant" && last.tool_calls.is_none() => {
                        last.tool_calls = Some(tool_calls);
                    }
                    _ => result.push(OpenAIMessage {
                        role: "assistant".to_string(),
                        content: None,
                        tool_calls: Some(tool_calls),
                        tool_call_id: None,
                    }),
                }
            }
            Message::Function(results) => {
                for function_result in results {
                    result.push(OpenAIMessage {
                        role: "tool".to_string(),
                        content: Some(function_result.model_text()),
                        tool_calls: None,
                        tool_call_id: Some(function_result.call_id.clone()),
                    });
                }
            }
        }
    }

    result
}

/// Fold one streamed chunk into the builder, returning the text it carried
fn apply_chunk(builder: &mut CompletionBuilder, chunk: StreamChunk) -> Option<String> {
    let mut text = String::new();

    for choice in chunk.choices {
        if let Some(content) = choice.delta.content {
            builder.push_text(&content);
            text.push_str(&content);
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let index = tc.index as usize;
            let (name, arguments) = match tc.function {
                Some(function) => (function.name, function.arguments),
                None => (None, None),
            };
            builder.call_start(index, tc.id.as_deref(), name.as_deref());
            if let Some(arguments) = arguments {
                builder.call_arguments(index, &arguments);
            }
        }
    }

    if let Some(usage) = chunk.usage {
        builder.set_usage(Usage::new(usage.prompt_tokens, usage.completion_tokens));
    }

    if text.is_empty() { None } else { Some(text) }
}

fn parse_chunk(data: &str) -> Result<StreamChunk> {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(data) {
        return Err(Error::api(
            envelope.error.error_type.unwrap_or_else(|| "error".to_string()),
            envelope.error.message,
        ));
    }
    Ok(serde_json::from_str::<StreamChunk>(data)?)
}

fn create_stream(
    mut event_source: EventSource,
) -> impl futures::Stream<Item = Result<CompletionEvent>> {
    stream! {
        let mut builder = CompletionBuilder::new();

        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        break;
                    }

                    match parse_chunk(&msg.data) {
                        Ok(chunk) => {
                            if let Some(text) = apply_chunk(&mut builder, chunk) {
                                yield Ok(CompletionEvent::TextDelta(text));
                            }
                        }
                        Err(e) => {
                            event_source.close();
                            yield Err(e);
                            return;
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    event_source.close();
                    yield Err(map_sse_error(e).await);
                    return;
                }
            }
        }

        event_source.close();
        yield Ok(CompletionEvent::Done(builder.build()));
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}
