//! Error types for coordination-store access.

use std::ops::Range;

use serde::Deserialize;
use thiserror::Error;

use keelson_core::CoreError;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

pub const KEY_NOT_FOUND: u32 = 100;
pub const TEST_FAILED: u32 = 101;
pub const NOT_FILE: u32 = 102;
pub const NOT_DIR: u32 = 104;
pub const NODE_EXIST: u32 = 105;
pub const DIR_NOT_EMPTY: u32 = 108;
pub const VALUE_REQUIRED: u32 = 200;
pub const TTL_NAN: u32 = 202;
pub const INDEX_NAN: u32 = 203;
pub const RAFT_INTERNAL: u32 = 300;
pub const LEADER_ELECT: u32 = 301;

/// Codes reported when the store's consensus layer is struggling.
pub const RAFT_ERRORS: Range<u32> = 300..400;
/// Codes reported for requests the store could not parse.
pub const MALFORMED_REQUEST_ERRORS: Range<u32> = 200..300;

/// Structured error reported by the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdError {
    #[serde(rename = "errorCode")]
    pub code: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub index: i64,
}

impl EtcdError {
    pub fn new(code: u32, message: impl Into<String>, cause: impl Into<String>, index: i64) -> Self {
        Self {
            code,
            message: message.into(),
            cause: cause.into(),
            index,
        }
    }

    pub fn is_key_not_found(&self) -> bool {
        self.code == KEY_NOT_FOUND
    }

    pub fn is_raft(&self) -> bool {
        RAFT_ERRORS.contains(&self.code)
    }

    pub fn is_malformed_request(&self) -> bool {
        MALFORMED_REQUEST_ERRORS.contains(&self.code)
    }
}

impl std::fmt::Display for EtcdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}) [{}]", self.message, self.cause, self.code)
    }
}

/// Errors surfaced by the store and its facade.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store answered with a structured error.
    #[error("store error: {0}")]
    Etcd(EtcdError),

    /// Connection failure, timeout, or an undecodable response.
    #[error("i/o error: {0}")]
    Io(String),

    /// A payload could not be encoded or decoded.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl StoreError {
    pub fn etcd(&self) -> Option<&EtcdError> {
        match self {
            StoreError::Etcd(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_key_not_found(&self) -> bool {
        self.etcd().is_some_and(EtcdError::is_key_not_found)
    }
}

impl From<EtcdError> for StoreError {
    fn from(e: EtcdError) -> Self {
        StoreError::Etcd(e)
    }
}
