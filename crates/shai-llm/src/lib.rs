//! shai-llm: message model and streaming provider adapters
//!
//! This crate defines the role-tagged conversation model shared by the rest of
//! shai and a uniform streaming-completion contract over remote LLM APIs.

pub mod error;
pub mod models;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use models::{ModelCatalog, ModelEntry, Pricing, ProviderModels};
pub use providers::{LlmProvider, ProviderKind};
pub use stream::{CompletionEvent, CompletionStream, TokenSink};
pub use types::*;
