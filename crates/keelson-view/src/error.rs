//! Invariant violations raised while building a topology view.

use thiserror::Error;

/// Result type alias for view construction.
pub type ViewResult<T> = Result<T, ViewError>;

/// A view cannot be built from the given input. These are programming
/// errors in the caller, not transient conditions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ViewError {
    #[error("cannot build a topology view without announces")]
    NoAnnounces,

    #[error("local instance {0} is not part of the announces")]
    NoLocalInstance(String),

    #[error("found {count} local instances, expected exactly one")]
    MultipleLocalInstances { count: usize },
}
