//! Function registry and dispatch
//!
//! Functions are advertised to the model by their [`FunctionDefinition`] and
//! executed through a [`FunctionHandler`]. Arguments are checked against the
//! definition's JSON schema before the handler runs.

use async_trait::async_trait;
use serde_json::{Map, Value};
use shai_llm::{FunctionCall, FunctionDefinition, FunctionResult};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Error type handlers may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Why a dispatch did not produce a result
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("{0}")]
    InvalidArguments(String),

    #[error("Function '{name}' failed: {message}")]
    Handler { name: String, message: String },
}

/// Executes one function
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, arguments: Map<String, Value>) -> Result<String, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> FunctionHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, HandlerError>> + Send,
{
    async fn call(&self, arguments: Map<String, Value>) -> Result<String, HandlerError> {
        (self.0)(arguments).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn FunctionHandler>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone)]
struct Entry {
    definition: FunctionDefinition,
    handler: Arc<dyn FunctionHandler>,
    validator: Option<Arc<jsonschema::Validator>>,
}

/// Name-keyed set of callable functions, kept in registration order
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    entries: Vec<Entry>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. A second registration under the same name
    /// replaces the first in place.
    pub fn register(&mut self, definition: FunctionDefinition, handler: Arc<dyn FunctionHandler>) {
        let validator = compile_schema(&definition);
        let entry = Entry {
            definition,
            handler,
            validator,
        };

        match self
            .entries
            .iter_mut()
            .find(|e| e.definition.name == entry.definition.name)
        {
            Some(existing) => {
                tracing::debug!("Replacing function '{}'", entry.definition.name);
                *existing = entry;
            }
            None => self.entries.push(entry),
        }
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, definition: FunctionDefinition, handler: Arc<dyn FunctionHandler>) -> Self {
        self.register(definition, handler);
        self
    }

    /// Definitions to advertise to the provider
    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        self.entries.iter().map(|e| e.definition.clone()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.definition.name.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.definition.name == name)
    }

    /// Run the named function
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String, DispatchError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| DispatchError::FunctionNotFound(name.to_string()))?;

        if let Some(validator) = &entry.validator {
            let instance = Value::Object(arguments.clone());
            if let Some(message) = validate_with_validator(&instance, validator) {
                return Err(DispatchError::InvalidArguments(message));
            }
        }

        entry
            .handler
            .call(arguments)
            .await
            .map_err(|e| DispatchError::Handler {
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    /// Run a model-requested call, folding any failure into the result
    pub async fn dispatch_call(&self, call: &FunctionCall) -> FunctionResult {
        match self.dispatch(&call.name, call.arguments.clone()).await {
            Ok(output) => FunctionResult::ok(call, output),
            Err(e) => {
                tracing::warn!("Function call '{}' failed: {}", call.name, e);
                FunctionResult::failed(call, e.to_string())
            }
        }
    }
}

fn compile_schema(definition: &FunctionDefinition) -> Option<Arc<jsonschema::Validator>> {
    match jsonschema::validator_for(&definition.json_schema()) {
        Ok(validator) => Some(Arc::new(validator)),
        Err(e) => {
            tracing::warn!(
                "Invalid parameter schema for '{}', skipping validation: {}",
                definition.name,
                e
            );
            None
        }
    }
}

/// Returns `Some(error_message)` if validation fails
fn validate_with_validator(args: &Value, validator: &jsonschema::Validator) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Function argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}
