//! Save scheduling for editor content: debounced and interval triggers,
//! a single in-flight save per document, and exponential-backoff retry.
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod persistence;
pub use persistence::*;

mod scheduler;
pub use scheduler::*;

mod validate;
pub use validate::*;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SaveError {
    /// Content rejected by the validator. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Sink failure that may succeed on a later attempt.
    #[error("transient save failure: {0}")]
    Transient(String),

    #[error("save failed after {attempts} attempt(s): {last}")]
    Persistent { attempts: u32, last: String },
}

impl SaveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Validation(msg) | Self::Transient(msg) => msg,
            Self::Persistent { last, .. } => last,
        }
    }
}

pub type Result<T> = std::result::Result<T, SaveError>;
