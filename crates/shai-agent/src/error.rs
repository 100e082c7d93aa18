//! Error types for shai-agent

use shai_llm::TokenUsage;
use thiserror::Error;

use crate::thread::StoreError;

/// Result type alias using shai-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can end a turn or a session
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the provider layer
    #[error(transparent)]
    Provider(#[from] shai_llm::Error),

    /// The model kept requesting functions past the round limit
    #[error("Function call loop exceeded {rounds} rounds")]
    ToolLoopExceeded {
        rounds: usize,
        /// Tokens spent by the abandoned turn
        usage: TokenUsage,
    },

    /// Thread state could not be stored
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl Error {
    /// Usage already billed for a turn that failed part way
    pub fn partial_usage(&self) -> Option<&TokenUsage> {
        match self {
            Error::ToolLoopExceeded { usage, .. } => Some(usage),
            _ => None,
        }
    }
}
