//! shai-agent: conversation engine and session runtime
//!
//! This crate runs the turn loop that streams model replies, dispatches
//! function calls, and persists the resulting history as named threads.

pub mod engine;
pub mod error;
pub mod function;
pub mod session;
pub mod thread;

#[cfg(test)]
mod testing;

pub use engine::{ConversationEngine, EngineConfig, RetryConfig, TurnOutcome, TurnState};
pub use error::{Error, Result};
pub use function::{DispatchError, FunctionHandler, FunctionRegistry, HandlerError, handler_fn};
pub use session::{
    Prompter, SessionConfig, SessionDisplay, SessionLoop, SessionSummary, run_single_turn,
};
pub use thread::{
    FileThreadStore, MemoryThreadStore, StoreError, Thread, ThreadStore, derive_thread_name,
    is_default_thread_name,
};
