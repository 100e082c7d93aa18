//! Scripted provider and fixtures shared by the unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use shai_llm::{
    CompletionEvent, CompletionOptions, CompletionResult, CompletionStream, FunctionCall,
    FunctionDefinition, LlmProvider, Message, ParameterSchema, Usage,
};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::function::{FunctionRegistry, HandlerError, handler_fn};

pub type Script = shai_llm::Result<Vec<CompletionEvent>>;

/// Replays canned responses and records every request
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<(Vec<Message>, CompletionOptions)>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<(Vec<Message>, CompletionOptions)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn stream(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> shai_llm::Result<CompletionStream> {
        self.requests
            .lock()
            .push((messages.to_vec(), options.clone()));

        let next = self.responses.lock().pop_front();
        let events = match next {
            Some(script) => script?,
            None => {
                return Err(shai_llm::Error::UnexpectedResponse(
                    "script exhausted".to_string(),
                ));
            }
        };

        Ok(Box::pin(async_stream::stream! {
            for event in events {
                yield Ok(event);
            }
        }))
    }
}

/// A streamed text reply, split into word-sized deltas
pub fn reply(text: &str, usage: Usage) -> Script {
    let mut events: Vec<CompletionEvent> = text
        .split_inclusive(' ')
        .map(|word| CompletionEvent::TextDelta(word.to_string()))
        .collect();
    events.push(CompletionEvent::Done(CompletionResult {
        content: text.to_string(),
        function_calls: Vec::new(),
        usage: Some(usage),
    }));
    Ok(events)
}

/// A response requesting a single function call
pub fn call(name: &str, arguments: Value, call_id: &str, usage: Usage) -> Script {
    let arguments = arguments.as_object().cloned().unwrap_or_default();
    Ok(vec![CompletionEvent::Done(CompletionResult {
        content: String::new(),
        function_calls: vec![FunctionCall::new(name, arguments, call_id)],
        usage: Some(usage),
    })])
}

/// A registry with an `executeCommand` function that always prints `output`
pub fn execute_command(output: &'static str) -> FunctionRegistry {
    FunctionRegistry::new().with(
        FunctionDefinition::new("executeCommand", "Run a shell command").param(
            "command",
            ParameterSchema::string("Command to run"),
            true,
        ),
        handler_fn(move |_: Map<String, Value>| async move {
            Ok::<_, HandlerError>(output.to_string())
        }),
    )
}
