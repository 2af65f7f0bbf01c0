//! The coordination-store capability consumed by the protocol.

use async_trait::async_trait;
use serde::Deserialize;

use keelson_core::Node;

use crate::error::StoreResult;

/// Options for a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub recursive: bool,
    pub sorted: bool,
}

impl GetOptions {
    pub fn recursive_sorted() -> Self {
        Self {
            recursive: true,
            sorted: true,
        }
    }
}

/// Options and preconditions for a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Seconds until the store expires the key.
    pub ttl: Option<u64>,
    pub dir: bool,
    /// Require the key to exist (`true`) or to be absent (`false`).
    pub prev_exist: Option<bool>,
    pub prev_value: Option<String>,
    pub prev_index: Option<u64>,
}

impl PutOptions {
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_prev_exist(mut self, prev_exist: bool) -> Self {
        self.prev_exist = Some(prev_exist);
        self
    }

    pub fn with_prev_value(mut self, prev_value: impl Into<String>) -> Self {
        self.prev_value = Some(prev_value.into());
        self
    }

    pub fn with_prev_index(mut self, prev_index: u64) -> Self {
        self.prev_index = Some(prev_index);
        self
    }
}

/// Options and preconditions for a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub recursive: bool,
    pub dir: bool,
    pub prev_value: Option<String>,
    pub prev_index: Option<u64>,
}

/// Successful store response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub action: String,
    #[serde(default)]
    pub node: Option<Node>,
    #[serde(default)]
    pub prev_node: Option<Node>,
}

impl Response {
    /// Leaf nodes directly below the response node.
    pub fn children(&self) -> &[Node] {
        self.node.as_ref().map(|n| n.nodes.as_slice()).unwrap_or_default()
    }
}

/// Hierarchical, TTL-aware key/value store with ordered key allocation.
///
/// Implementations report structured errors as [`StoreError::Etcd`] and
/// transport failures as [`StoreError::Io`]; request timeouts are the
/// implementation's responsibility.
///
/// [`StoreError::Etcd`]: crate::StoreError::Etcd
/// [`StoreError::Io`]: crate::StoreError::Io
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str, options: GetOptions) -> StoreResult<Response>;

    async fn put(&self, key: &str, value: Option<&str>, options: PutOptions) -> StoreResult<Response>;

    /// Create a child of `dir` under a store-allocated, increasing key name.
    async fn post(&self, dir: &str, value: &str, ttl: Option<u64>) -> StoreResult<Response>;

    async fn delete(&self, key: &str, options: DeleteOptions) -> StoreResult<Response>;
}
