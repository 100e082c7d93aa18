//! Streaming completion events and utilities

use crate::error::{Error, Result};
use crate::types::{CompletionResult, FunctionCall, Usage};
use futures::StreamExt;
use std::pin::Pin;
use tokio_stream::Stream;

/// Events emitted while a completion streams in.
///
/// A well-formed stream yields zero or more `TextDelta`s followed by exactly
/// one `Done`, and nothing after it.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    /// A fragment of visible assistant text
    TextDelta(String),
    /// The completion finished
    Done(CompletionResult),
}

/// A stream of completion events
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<CompletionEvent>> + Send>>;

/// Receives streamed text fragments in order
pub type TokenSink<'a> = dyn FnMut(&str) + Send + 'a;

/// Drain a completion stream, pushing every text fragment to `on_token` in
/// order before returning the final result.
pub async fn drain(
    mut stream: CompletionStream,
    on_token: &mut TokenSink<'_>,
) -> Result<CompletionResult> {
    while let Some(event) = stream.next().await {
        match event? {
            CompletionEvent::TextDelta(delta) => on_token(&delta),
            CompletionEvent::Done(result) => return Ok(result),
        }
    }
    Err(Error::UnexpectedResponse(
        "stream ended before the completion finished".to_string(),
    ))
}

#[derive(Debug, Default)]
struct CallBuffer {
    id: String,
    name: String,
    arguments_json: String,
}

/// Accumulates streamed fragments into a `CompletionResult`.
///
/// Function call fragments are keyed by the provider's content index so that
/// interleaved deltas for several calls land in the right buffer.
#[derive(Debug, Default)]
pub struct CompletionBuilder {
    content: String,
    calls: Vec<(usize, CallBuffer)>,
    usage: Option<Usage>,
}

impl CompletionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, delta: &str) {
        self.content.push_str(delta);
    }

    /// Record the id and/or name of a function call at `index`
    pub fn call_start(&mut self, index: usize, id: Option<&str>, name: Option<&str>) {
        let buffer = self.buffer(index);
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            buffer.id = id.to_string();
        }
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            buffer.name = name.to_string();
        }
    }

    /// Append a fragment of JSON arguments for the call at `index`
    pub fn call_arguments(&mut self, index: usize, delta: &str) {
        self.buffer(index).arguments_json.push_str(delta);
    }

    pub fn set_usage(&mut self, usage: Usage) {
        self.usage = Some(usage);
    }

    pub fn text(&self) -> &str {
        &self.content
    }

    fn buffer(&mut self, index: usize) -> &mut CallBuffer {
        let position = match self.calls.iter().position(|(i, _)| *i == index) {
            Some(position) => position,
            None => {
                self.calls.push((index, CallBuffer::default()));
                self.calls.len() - 1
            }
        };
        &mut self.calls[position].1
    }

    /// Build the final result. Calls without a name are dropped.
    pub fn build(self) -> CompletionResult {
        let mut calls = self.calls;
        calls.sort_by_key(|(index, _)| *index);

        let function_calls = calls
            .into_iter()
            .filter(|(_, buffer)| !buffer.name.is_empty())
            .map(|(_, buffer)| {
                FunctionCall::new(
                    buffer.name,
                    FunctionCall::parse_arguments(&buffer.arguments_json),
                    buffer.id,
                )
            })
            .collect();

        CompletionResult {
            content: self.content,
            function_calls,
            usage: self.usage,
        }
    }
}
