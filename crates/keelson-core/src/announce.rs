//! Announce value types and the deduplicated liveness collection.

use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::node::Node;

/// Named string properties published by one instance.
pub type Properties = BTreeMap<String, String>;

/// Decode a flat `{"name":"value"}` property document.
pub fn properties_from_json(json: &str) -> CoreResult<Properties> {
    serde_json::from_str(json).map_err(|e| CoreError::InvalidProperties(e.to_string()))
}

/// Encode a property map as a flat JSON document.
pub fn properties_to_json(properties: &Properties) -> CoreResult<String> {
    serde_json::to_string(properties).map_err(|e| CoreError::Serialize(e.to_string()))
}

// ── AnnounceData ───────────────────────────────────────────────────

/// Payload stored as the value of an announce key.
///
/// Equality covers `sling_id`, `server_info` and
/// `properties_modified_index`; the cluster id is not part of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceData {
    pub sling_id: String,
    pub server_info: String,
    pub cluster_id: String,
    /// Modified index of the instance's property document at announce time.
    pub properties_modified_index: i64,
}

impl AnnounceData {
    pub fn new(
        sling_id: impl Into<String>,
        server_info: impl Into<String>,
        cluster_id: impl Into<String>,
        properties_modified_index: i64,
    ) -> Self {
        Self {
            sling_id: sling_id.into(),
            server_info: server_info.into(),
            cluster_id: cluster_id.into(),
            properties_modified_index,
        }
    }

    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::InvalidAnnounce(e.to_string()))
    }

    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string(self).map_err(|e| CoreError::Serialize(e.to_string()))
    }
}

impl PartialEq for AnnounceData {
    fn eq(&self, other: &Self) -> bool {
        self.sling_id == other.sling_id
            && self.server_info == other.server_info
            && self.properties_modified_index == other.properties_modified_index
    }
}

impl Eq for AnnounceData {}

impl Hash for AnnounceData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sling_id.hash(state);
        self.server_info.hash(state);
        self.properties_modified_index.hash(state);
    }
}

// ── Announce ───────────────────────────────────────────────────────

/// One entry of the liveness namespace.
#[derive(Debug, Clone)]
pub struct Announce {
    key: String,
    key_name: u64,
    data: AnnounceData,
    ttl: Option<i64>,
}

impl Announce {
    /// Build an announce. The last path segment of `key` must be the
    /// numeric key name allocated by the store.
    pub fn new(key: impl Into<String>, data: AnnounceData, ttl: Option<i64>) -> CoreResult<Self> {
        let key = key.into();
        let key_name = key
            .rsplit('/')
            .next()
            .and_then(|name| name.parse::<u64>().ok())
            .ok_or_else(|| CoreError::InvalidKey(key.clone()))?;
        Ok(Self {
            key,
            key_name,
            data,
            ttl,
        })
    }

    /// Decode a store node holding an announce payload.
    pub fn from_node(node: &Node) -> CoreResult<Self> {
        let value = node
            .value
            .as_deref()
            .ok_or_else(|| CoreError::MissingValue(node.key.clone()))?;
        Self::new(node.key.clone(), AnnounceData::from_json(value)?, node.ttl)
    }

    /// Full store key of the announce.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Store-allocated ordinal; lower means older.
    pub fn key_name(&self) -> u64 {
        self.key_name
    }

    /// Decoded payload.
    pub fn data(&self) -> &AnnounceData {
        &self.data
    }

    /// Instance that wrote the announce.
    pub fn sling_id(&self) -> &str {
        &self.data.sling_id
    }

    /// Cluster the instance announced itself in.
    pub fn cluster_id(&self) -> &str {
        &self.data.cluster_id
    }

    /// Remaining TTL in seconds as reported by the store.
    pub fn ttl(&self) -> Option<i64> {
        self.ttl
    }

    /// A non-positive TTL means the store failed to expire this key.
    pub fn is_expired(&self) -> bool {
        matches!(self.ttl, Some(ttl) if ttl <= 0)
    }

    /// Same key with a new payload and TTL (after a refresh).
    pub fn refreshed(&self, data: AnnounceData, ttl: Option<i64>) -> Self {
        Self {
            key: self.key.clone(),
            key_name: self.key_name,
            data,
            ttl,
        }
    }

    /// Identity and placement only, ignoring payload indices and TTL.
    pub fn same_member(&self, other: &Announce) -> bool {
        self.key == other.key
            && self.data.sling_id == other.data.sling_id
            && self.data.server_info == other.data.server_info
            && self.data.cluster_id == other.data.cluster_id
    }
}

impl PartialEq for Announce {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.data == other.data
    }
}

impl Eq for Announce {}

impl Hash for Announce {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.data.hash(state);
    }
}

// ── Announces ──────────────────────────────────────────────────────

/// Ordered, deduplicated announce collection.
///
/// Entries are sorted by key name and keep only the first (oldest)
/// announce per sling id. The result is the same for any input order
/// of the same set, which is what makes leader election deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Announces {
    entries: Vec<Announce>,
}

impl Announces {
    pub fn new(announces: impl IntoIterator<Item = Announce>) -> Self {
        let mut sorted: Vec<Announce> = announces.into_iter().collect();
        sorted.sort_by(|a, b| {
            a.key_name
                .cmp(&b.key_name)
                .then_with(|| a.key.cmp(&b.key))
                .then_with(|| a.data.sling_id.cmp(&b.data.sling_id))
        });

        let mut seen = HashSet::new();
        let entries = sorted
            .into_iter()
            .filter(|announce| seen.insert(announce.data.sling_id.clone()))
            .collect();
        Self { entries }
    }

    /// Decode raw store nodes. Directory and value-less nodes are
    /// skipped; with `discard_expired`, non-positive TTL entries are too.
    pub fn from_nodes(nodes: &[Node], discard_expired: bool) -> CoreResult<Self> {
        let mut announces = Vec::with_capacity(nodes.len());
        for node in nodes.iter().filter(|n| !n.dir && n.value.is_some()) {
            let announce = Announce::from_node(node)?;
            if discard_expired && announce.is_expired() {
                continue;
            }
            announces.push(announce);
        }
        Ok(Self::new(announces))
    }

    pub fn get(&self, sling_id: &str) -> Option<&Announce> {
        self.entries.iter().find(|a| a.data.sling_id == sling_id)
    }

    pub fn contains(&self, sling_id: &str) -> bool {
        self.get(sling_id).is_some()
    }

    /// Everything except the announce of `sling_id`.
    pub fn without(&self, sling_id: &str) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|a| a.data.sling_id != sling_id)
                .cloned()
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Announce> {
        self.entries.iter()
    }

    pub fn sling_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|a| a.data.sling_id.as_str())
    }

    /// Membership equality: same keys, identities and clusters, ignoring
    /// property indices and TTLs.
    pub fn same_members(&self, other: &Announces) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(a, b)| a.same_member(b))
    }
}

impl<'a> IntoIterator for &'a Announces {
    type Item = &'a Announce;
    type IntoIter = std::slice::Iter<'a, Announce>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl IntoIterator for Announces {
    type Item = Announce;
    type IntoIter = std::vec::IntoIter<Announce>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<Announce> for Announces {
    fn from_iter<T: IntoIterator<Item = Announce>>(iter: T) -> Self {
        Self::new(iter)
    }
}
