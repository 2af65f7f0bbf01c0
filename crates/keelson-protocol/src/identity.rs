//! Cluster identity sources.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use keelson_core::config::{ClusterConfig, ClusterIdSource};
use keelson_store::EtcdService;

use crate::error::{ProtocolError, ProtocolResult};

static CLUSTER_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid cluster id pattern"));

pub fn is_valid_cluster_id(id: &str) -> bool {
    CLUSTER_ID_PATTERN.is_match(id)
}

/// Where the protocol learns, and if needed creates, its cluster id.
#[async_trait]
pub trait ClusterIdentitySource: Send + Sync {
    /// The existing cluster id, if one is defined.
    async fn get_cluster_id(&self) -> ProtocolResult<Option<String>>;

    /// Define the cluster id. Calling it again returns the same id.
    async fn set_cluster_id(&self) -> ProtocolResult<Option<String>>;

    fn is_supported(&self) -> bool {
        true
    }
}

/// Cluster id taken from configuration.
///
/// An id that does not match `^[A-Za-z0-9_-]+$` is replaced by the
/// default. Without a configured id `get_cluster_id` reports none and
/// `set_cluster_id` yields the default.
#[derive(Debug, Clone)]
pub struct ConfigClusterIdentity {
    configured: Option<String>,
    default_id: String,
}

impl ConfigClusterIdentity {
    pub fn new(configured: Option<&str>, default_id: &str) -> Self {
        let configured = configured.map(|id| {
            if is_valid_cluster_id(id) {
                id.to_string()
            } else {
                warn!(cluster_id = %id, default = %default_id, "invalid cluster id, using default");
                default_id.to_string()
            }
        });
        Self {
            configured,
            default_id: default_id.to_string(),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.id.as_deref(), &config.default_id)
    }
}

#[async_trait]
impl ClusterIdentitySource for ConfigClusterIdentity {
    async fn get_cluster_id(&self) -> ProtocolResult<Option<String>> {
        Ok(self.configured.clone())
    }

    async fn set_cluster_id(&self) -> ProtocolResult<Option<String>> {
        Ok(Some(self.configured.clone().unwrap_or_else(|| self.default_id.clone())))
    }
}

/// Cluster id kept in the coordination store under `{root}/cluster-id`.
///
/// The first instance to claim the key defines the cluster; everyone
/// else reads the winner back.
#[derive(Clone)]
pub struct StoreClusterIdentity {
    service: EtcdService,
    candidate: String,
}

impl StoreClusterIdentity {
    pub fn new(service: EtcdService, candidate: impl Into<String>) -> Self {
        Self {
            service,
            candidate: candidate.into(),
        }
    }

    /// Claim candidate for an instance: its sling id with characters
    /// outside the id alphabet replaced by `-`.
    pub fn candidate_for(sling_id: &str) -> String {
        let candidate: String = sling_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
            .collect();
        if candidate.is_empty() {
            "cluster".to_string()
        } else {
            candidate
        }
    }
}

#[async_trait]
impl ClusterIdentitySource for StoreClusterIdentity {
    async fn get_cluster_id(&self) -> ProtocolResult<Option<String>> {
        match self.service.get_cluster_id().await? {
            Some(id) if is_valid_cluster_id(&id) => Ok(Some(id)),
            Some(id) => Err(ProtocolError::Identity(format!("stored cluster id {id:?} is invalid"))),
            None => Ok(None),
        }
    }

    async fn set_cluster_id(&self) -> ProtocolResult<Option<String>> {
        let id = self.service.claim_cluster_id(&self.candidate).await?;
        if id == self.candidate {
            info!(cluster_id = %id, "cluster id claimed");
        } else {
            debug!(cluster_id = %id, candidate = %self.candidate, "cluster id already claimed");
        }
        Ok(Some(id))
    }
}

/// Identity source selected by `cluster.source`.
pub fn from_config(
    config: &ClusterConfig,
    service: &EtcdService,
    sling_id: &str,
) -> Box<dyn ClusterIdentitySource> {
    match config.source {
        ClusterIdSource::Config => Box::new(ConfigClusterIdentity::from_config(config)),
        ClusterIdSource::Store => {
            let candidate = config
                .id
                .clone()
                .filter(|id| is_valid_cluster_id(id))
                .unwrap_or_else(|| StoreClusterIdentity::candidate_for(sling_id));
            Box::new(StoreClusterIdentity::new(service.clone(), candidate))
        }
    }
}
