//! Error types for the keelson data model.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while building or decoding core values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid announce payload: {0}")]
    InvalidAnnounce(String),

    #[error("invalid announce key '{0}': last segment is not a key name")]
    InvalidKey(String),

    #[error("announce node '{0}' has no value")]
    MissingValue(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("invalid properties payload: {0}")]
    InvalidProperties(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
