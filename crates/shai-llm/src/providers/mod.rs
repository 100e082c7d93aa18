//! LLM Provider implementations

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use crate::{
    CompletionOptions, CompletionResult, CompletionStream, Error, Message, Result, TokenSink,
    stream,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource, retry::Never};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Start a streaming completion over the given messages.
    ///
    /// Errors that happen before the first event (bad credentials, rate
    /// limits, unreachable endpoint) are returned here rather than inside
    /// the stream.
    async fn stream(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<CompletionStream>;

    /// Stream a completion to the end, passing every text fragment to
    /// `on_token` before returning the final result.
    async fn generate_streaming_completion(
        &self,
        messages: &[Message],
        on_token: &mut TokenSink<'_>,
        options: &CompletionOptions,
    ) -> Result<CompletionResult> {
        let events = self.stream(messages, options).await?;
        stream::drain(events, on_token).await
    }
}

/// Supported provider endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Groq,
    OpenRouter,
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Groq,
        ProviderKind::OpenRouter,
        ProviderKind::Ollama,
    ];

    /// Name used in configuration and on the command line
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Groq => "groq",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::Ollama => "http://localhost:11434/v1",
        }
    }

    /// Environment variable holding the API key, if the endpoint needs one
    pub fn api_key_env_var(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Groq => Some("GROQ_API_KEY"),
            ProviderKind::OpenRouter => Some("OPENROUTER_API_KEY"),
            ProviderKind::Ollama => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| Error::UnsupportedProvider(s.to_string()))
    }
}

/// Build a provider for `kind`.
///
/// `base_url` overrides the endpoint's default; `api_key` falls back to the
/// provider's environment variable.
pub fn create_provider(
    kind: ProviderKind,
    api_key: Option<&str>,
    base_url: Option<&str>,
) -> Result<Arc<dyn LlmProvider>> {
    let base_url = base_url
        .unwrap_or(kind.default_base_url())
        .trim_end_matches('/')
        .to_string();
    let api_key = match kind.api_key_env_var() {
        Some(env_var) => get_api_key(api_key, env_var)?,
        None => api_key.unwrap_or_default().to_string(),
    };

    tracing::debug!("Creating {} provider for {}", kind, base_url);

    let provider: Arc<dyn LlmProvider> = match kind {
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(api_key).with_base_url(base_url)),
        _ => Arc::new(OpenAiProvider::new(api_key).with_base_url(base_url)),
    };
    Ok(provider)
}

/// Get an API key from environment or provided value
pub fn get_api_key(provided: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = provided.filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }

    std::env::var(env_var)
        .ok()
        .filter(|k| !k.is_empty())
        .ok_or(Error::InvalidApiKey)
}

/// Open an SSE connection and wait for the server to accept it.
///
/// Reconnects are disabled so a failed request surfaces exactly once.
pub(crate) async fn open_event_source(request: reqwest::RequestBuilder) -> Result<EventSource> {
    let mut event_source = EventSource::new(request)
        .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;
    event_source.set_retry_policy(Box::new(Never));

    match event_source.next().await {
        Some(Ok(Event::Open)) => Ok(event_source),
        Some(Ok(Event::Message(msg))) => Err(Error::UnexpectedResponse(format!(
            "event before connection opened: {}",
            msg.event
        ))),
        Some(Err(e)) => {
            event_source.close();
            Err(map_sse_error(e).await)
        }
        None => Err(Error::Sse("connection closed before opening".to_string())),
    }
}

/// Convert an event source failure into a provider error
pub(crate) async fn map_sse_error(error: reqwest_eventsource::Error) -> Error {
    use reqwest_eventsource::Error as SseError;

    match error {
        SseError::Transport(e) => Error::Http(e),
        SseError::InvalidStatusCode(status, response) => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            tracing::debug!("Provider returned HTTP {}: {}", status, body);
            Error::from_status(status.as_u16(), &body, retry_after)
        }
        SseError::InvalidContentType(content_type, response) => {
            let body = response.text().await.unwrap_or_default();
            Error::UnexpectedResponse(format!(
                "expected an event stream, got {:?}: {}",
                content_type,
                body.trim()
            ))
        }
        other => Error::Sse(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::CompletionEvent;

    struct Scripted;

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn stream(
            &self,
            messages: &[Message],
            _options: &CompletionOptions,
        ) -> Result<CompletionStream> {
            let echo = messages
                .last()
                .and_then(|m| m.text())
                .unwrap_or_default()
                .to_string();
            Ok(Box::pin(async_stream::stream! {
                for word in echo.split_inclusive(' ') {
                    yield Ok(CompletionEvent::TextDelta(word.to_string()));
                }
                yield Ok(CompletionEvent::Done(CompletionResult::text(echo.clone())));
            }))
        }
    }

    #[tokio::test]
    async fn test_generate_streaming_completion_forwards_tokens() {
        let mut tokens = Vec::new();
        let result = Scripted
            .generate_streaming_completion(
                &[Message::user("list all files")],
                &mut |t: &str| tokens.push(t.to_string()),
                &CompletionOptions::new("test"),
            )
            .await
            .unwrap();

        assert_eq!(tokens.concat(), result.content);
        assert_eq!(tokens.len(), 3);
    }

    #[tokio::test]
    async fn test_generate_streaming_completion_through_trait_object() {
        let provider: Arc<dyn LlmProvider> = Arc::new(Scripted);
        let mut seen = String::new();
        let sink: &mut TokenSink<'_> = &mut |t: &str| seen.push_str(t);

        let result = provider
            .generate_streaming_completion(
                &[Message::user("show disk usage")],
                sink,
                &CompletionOptions::new("test"),
            )
            .await
            .unwrap();

        assert_eq!(result.content, "show disk usage");
        assert_eq!(seen, "show disk usage");
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!(" Anthropic ".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert!(matches!(
            "carrier-pigeon".parse::<ProviderKind>(),
            Err(Error::UnsupportedProvider(_))
        ));
        for kind in ProviderKind::ALL {
            assert_eq!(kind.name().parse::<ProviderKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_get_api_key_prefers_provided() {
        assert_eq!(
            get_api_key(Some("sk-test"), "SHAI_TEST_UNSET_KEY").unwrap(),
            "sk-test"
        );
        assert!(matches!(
            get_api_key(None, "SHAI_TEST_UNSET_KEY"),
            Err(Error::InvalidApiKey)
        ));
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        assert!(create_provider(ProviderKind::Ollama, None, None).is_ok());
    }
}
