//! Error types for the membership protocol.

use keelson_store::StoreError;
use keelson_view::ViewError;

/// Errors raised while processing a protocol step or worker tick.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    View(#[from] ViewError),

    #[error("cluster identity: {0}")]
    Identity(String),

    #[error("cluster id is not resolved")]
    ClusterUndefined,

    #[error("local announce is not known")]
    LocalAnnounceMissing,
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<keelson_core::CoreError> for ProtocolError {
    fn from(error: keelson_core::CoreError) -> Self {
        Self::Store(StoreError::Core(error))
    }
}
