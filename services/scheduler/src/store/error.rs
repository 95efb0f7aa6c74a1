//! Store error types.

use lookout_id::{CheckId, IdError};
use lookout_model::ModelError;
use thiserror::Error;

/// Check store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// A stored value could not be interpreted.
    #[error("invalid stored value: {0}")]
    Model(#[from] ModelError),

    /// A stored ID could not be parsed.
    #[error("invalid stored id: {0}")]
    Id(#[from] IdError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The check does not exist or is already finished.
    #[error("check not found or already finished: {0}")]
    CheckNotFound(CheckId),

    /// The store cannot serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
