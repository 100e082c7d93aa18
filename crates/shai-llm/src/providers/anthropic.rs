//! Anthropic Claude API provider

use crate::{
    error::{Error, Result},
    stream::{CompletionBuilder, CompletionEvent, CompletionStream},
    types::{CompletionOptions, FunctionCallPolicy, FunctionDefinition, Message, Usage},
};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{LlmProvider, map_sse_error, open_event_source};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Tool choice strategy
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolChoice {
    Auto,
    None,
    Tool { name: String },
}

/// Anthropic API client
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn headers(&self) -> Result<reqwest::header::HeaderMap> {
        use reqwest::header::HeaderValue;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key).map_err(|_| Error::InvalidApiKey)?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn stream(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<CompletionStream> {
        let request = build_request(messages, options);
        let url = format!("{}/v1/messages", self.base_url);

        tracing::debug!(
            "Anthropic request to {}: model={}, {} messages",
            url,
            options.model,
            request.messages.len()
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

fn build_request(messages: &[Message], options: &CompletionOptions) -> AnthropicRequest {
    let (system, messages) = convert_messages(messages);
    let tools = convert_tools(&options.functions);

    let tool_choice = if tools.is_empty() {
        None
    } else {
        Some(match &options.function_call {
            FunctionCallPolicy::Auto => ToolChoice::Auto,
            FunctionCallPolicy::None => ToolChoice::None,
            FunctionCallPolicy::Forced(name) => ToolChoice::Tool { name: name.clone() },
        })
    };

    AnthropicRequest {
        model: options.model.clone(),
        messages,
        max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        stream: true,
        system,
        temperature: options.temperature,
        tools: if tools.is_empty() { None } else { Some(tools) },
        tool_choice,
    }
}

/// Create the event stream from SSE events
fn create_stream(
    mut event_source: EventSource,
) -> impl futures::Stream<Item = Result<CompletionEvent>> {
    stream! {
        let mut builder = CompletionBuilder::new();
        let mut usage = Usage::default();

        while let Some(event_result) = event_source.next().await {
            let message = match event_result {
                Ok(Event::Open) => continue,
                Ok(Event::Message(message)) => message,
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    event_source.close();
                    yield Err(map_sse_error(e).await);
                    return;
                }
            };

            match message.event.as_str() {
                "message_start" => {
                    if let Ok(data) = serde_json::from_str::<MessageStartEvent>(&message.data) {
                        usage.input_tokens = data.message.usage.input_tokens;
                        usage.output_tokens = data.message.usage.output_tokens;
                    }
                }
                "content_block_start" => {
                    if let Ok(data) = serde_json::from_str::<ContentBlockStartEvent>(&message.data) {
                        if data.content_block.block_type == "tool_use" {
                            builder.call_start(
                                data.index as usize,
                                data.content_block.id.as_deref(),
                                data.content_block.name.as_deref(),
                            );
                        }
                    }
                }
                "content_block_delta" => {
                    if let Ok(data) = serde_json::from_str::<ContentBlockDeltaEvent>(&message.data) {
                        match data.delta.delta_type.as_str() {
                            "text_delta" => {
                                let delta = data.delta.text.unwrap_or_default();
                                if !delta.is_empty() {
                                    builder.push_text(&delta);
                                    yield Ok(CompletionEvent::TextDelta(delta));
                                }
                            }
                            "input_json_delta" => {
                                let delta = data.delta.partial_json.unwrap_or_default();
                                builder.call_arguments(data.index as usize, &delta);
                            }
                            _ => {}
                        }
                    }
                }
                "message_delta" => {
                    if let Ok(data) = serde_json::from_str::<MessageDeltaEvent>(&message.data) {
                        usage.output_tokens = data.usage.output_tokens;
                    }
                }
                "message_stop" => break,
                "error" => {
                    event_source.close();
                    let error = match serde_json::from_str::<ErrorEvent>(&message.data) {
                        Ok(data) => Error::api(data.error.error_type, data.error.message),
                        Err(_) => Error::UnexpectedResponse(message.data.clone()),
                    };
                    yield Err(error);
                    return;
                }
                _ => {}
            }
        }

        event_source.close();
        builder.set_usage(usage);
        yield Ok(CompletionEvent::Done(builder.build()));
    }
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

// ============================================================================
// Response event types
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    message: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    usage: UsageInfo,
}

#[derive(Debug, Default, Deserialize)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStartEvent {
    index: u32,
    content_block: ContentBlockInfo,
}

#[derive(Debug, Deserialize)]
struct ContentBlockInfo {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    index: u32,
    delta: DeltaInfo,
}

#[derive(Debug, Deserialize)]
struct DeltaInfo {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    #[serde(default)]
    usage: UsageInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

// ============================================================================
// Conversion functions
// ============================================================================

/// Split out the system prompt and convert the remaining turns.
///
/// The API requires alternating roles, so consecutive turns that map to the
/// same role are merged into one message.
fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut result: Vec<AnthropicMessage> = Vec::new();

    for message in messages {
        let (role, blocks): (&'static str, Vec<serde_json::Value>) = match message {
            Message::System(text) => {
                system_parts.push(text);
                continue;
            }
            Message::User(text) => ("user", vec![json!({ "type": "text", "text": text })]),
            Message::Assistant(text) => {
                if text.is_empty() {
                    continue;
                }
                ("assistant", vec![json!({ "type": "text", "text": text })])
            }
            Message::FunctionCall(calls) => (
                "assistant",
                calls
                    .iter()
                    .map(|call| {
                        json!({
                            "type": "tool_use",
                            "id": call.call_id,
                            "name": call.name,
                            "input": call.arguments_value()
                        })
                    })
                    .collect(),
            ),
            Message::Function(results) => (
                "user",
                results
                    .iter()
                    .map(|result| {
                        json!({
                            "type": "tool_result",
                            "tool_use_id": result.call_id,
                            "content": result.model_text(),
                            "is_error": result.is_error()
                        })
                    })
                    .collect(),
            ),
        };

        match result.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => result.push(AnthropicMessage {
                role,
                content: blocks,
            }),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    (system, result)
}

fn convert_tools(functions: &[FunctionDefinition]) -> Vec<AnthropicTool> {
    functions
        .iter()
        .map(|function| AnthropicTool {
            name: function.name.clone(),
            description: function.description.clone(),
            input_schema: function.json_schema(),
        })
        .collect()
}
