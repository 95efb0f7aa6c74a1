//! Error types for model parsing.

use thiserror::Error;

/// Errors that can occur when interpreting stored or configured values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The configured `check_every` is neither `never` nor a valid duration.
    #[error("invalid check_every '{value}': {reason}")]
    InvalidCheckEvery { value: String, reason: String },

    /// A stored check state is not recognized.
    #[error("unknown check state: {0}")]
    UnknownCheckState(String),

    /// A stored checkable kind is not recognized.
    #[error("unknown checkable kind: {0}")]
    UnknownCheckableKind(String),

    /// A stored checkable ID does not match its kind.
    #[error("invalid checkable id: {0}")]
    InvalidCheckableId(#[from] lookout_id::IdError),
}
