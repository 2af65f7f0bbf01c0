//! EtcdService: domain facade over a [`CoordinationStore`].
//!
//! Translates raw responses into announces and property maps and keeps
//! consecutive-error statistics. Callers read the statistics to pick the
//! backoff index after a failure; a successful call clears them.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use keelson_core::announce::{properties_from_json, properties_to_json};
use keelson_core::{Announce, AnnounceData, Node, Properties};

use crate::client::{CoordinationStore, DeleteOptions, GetOptions, PutOptions};
use crate::error::{NODE_EXIST, StoreError, StoreResult};

/// Key layout of the discovery namespace below a root path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    root: String,
}

impl KeyLayout {
    pub fn new(root: &str) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn announces_dir(&self) -> String {
        format!("{}/announces", self.root)
    }

    pub fn properties_dir(&self) -> String {
        format!("{}/properties", self.root)
    }

    pub fn properties_key(&self, sling_id: &str) -> String {
        format!("{}/properties/{sling_id}", self.root)
    }

    pub fn cluster_id_key(&self) -> String {
        format!("{}/cluster-id", self.root)
    }
}

#[derive(Debug, Default)]
struct Counters {
    io: u32,
    etcd: HashMap<u32, u32>,
}

/// Consecutive failure counts, by category.
#[derive(Debug, Default)]
pub struct ErrorStats {
    counters: Mutex<Counters>,
}

impl ErrorStats {
    fn record<T>(&self, result: &StoreResult<T>) {
        let mut counters = self.counters.lock().expect("error stats lock");
        match result {
            Ok(_) => {
                counters.io = 0;
                counters.etcd.clear();
            }
            Err(StoreError::Etcd(e)) => {
                // The store answered, so the transport is fine.
                counters.io = 0;
                *counters.etcd.entry(e.code).or_default() += 1;
            }
            Err(StoreError::Io(_)) => counters.io += 1,
            Err(StoreError::Core(_)) => {}
        }
    }

    pub fn consecutive_io_errors(&self) -> u32 {
        self.counters.lock().expect("error stats lock").io
    }

    pub fn consecutive_etcd_errors(&self, code: u32) -> u32 {
        let counters = self.counters.lock().expect("error stats lock");
        counters.etcd.get(&code).copied().unwrap_or(0)
    }

    /// Sum of consecutive errors over a code range.
    pub fn consecutive_etcd_errors_in(&self, codes: Range<u32>) -> u32 {
        let counters = self.counters.lock().expect("error stats lock");
        counters
            .etcd
            .iter()
            .filter(|(code, _)| codes.contains(code))
            .map(|(_, count)| *count)
            .sum()
    }
}

/// Discovery operations on top of a coordination store.
#[derive(Clone)]
pub struct EtcdService {
    store: Arc<dyn CoordinationStore>,
    layout: KeyLayout,
    stats: Arc<ErrorStats>,
}

impl EtcdService {
    pub fn new(store: Arc<dyn CoordinationStore>, layout: KeyLayout) -> Self {
        Self {
            store,
            layout,
            stats: Arc::new(ErrorStats::default()),
        }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn stats(&self) -> &ErrorStats {
        &self.stats
    }

    fn track<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        self.stats.record(&result);
        result
    }

    /// Create a new announce under a store-allocated key.
    pub async fn create_announce(&self, data: &AnnounceData, ttl: u64) -> StoreResult<Announce> {
        let value = data.to_json()?;
        let response = self
            .track(self.store.post(&self.layout.announces_dir(), &value, Some(ttl)).await)?;
        let node = response
            .node
            .ok_or_else(|| StoreError::Io("create response without node".into()))?;
        let announce = Announce::new(node.key, data.clone(), node.ttl.or(Some(ttl as i64)))?;
        debug!(key = %announce.key(), ttl, "announce created");
        Ok(announce)
    }

    /// Every raw announce node, sorted by key. An absent namespace is empty.
    pub async fn get_announces(&self) -> StoreResult<Vec<Node>> {
        let result = self
            .store
            .get(&self.layout.announces_dir(), GetOptions::recursive_sorted())
            .await;
        match result {
            Ok(response) => {
                self.stats.record(&Ok(()));
                Ok(response.node.map(|n| n.nodes).unwrap_or_default())
            }
            Err(e) if e.is_key_not_found() => {
                self.stats.record(&Ok(()));
                trace!("announce namespace absent");
                Ok(Vec::new())
            }
            Err(e) => self.track(Err(e)),
        }
    }

    /// Renew an existing announce. Fails with key-not-found if it expired.
    pub async fn refresh_announce(
        &self,
        key: &str,
        data: &AnnounceData,
        ttl: u64,
    ) -> StoreResult<Announce> {
        let value = data.to_json()?;
        let options = PutOptions::default().with_ttl(ttl).with_prev_exist(true);
        let response = self.track(self.store.put(key, Some(&value), options).await)?;
        let ttl = response.node.and_then(|n| n.ttl).or(Some(ttl as i64));
        trace!(%key, ?ttl, "announce refreshed");
        Ok(Announce::new(key, data.clone(), ttl)?)
    }

    /// Remove an announce. A key that already expired is not an error.
    pub async fn delete_announce(&self, key: &str) -> StoreResult<()> {
        match self.store.delete(key, DeleteOptions::default()).await {
            Err(e) if e.is_key_not_found() => {
                self.stats.record(&Ok(()));
                Ok(())
            }
            result => self.track(result).map(|_| ()),
        }
    }

    /// Publish the instance's properties. Returns the modified index.
    pub async fn send_instance_properties(
        &self,
        properties: &Properties,
        sling_id: &str,
    ) -> StoreResult<i64> {
        let value = properties_to_json(properties)?;
        let key = self.layout.properties_key(sling_id);
        let response = self
            .track(self.store.put(&key, Some(&value), PutOptions::default()).await)?;
        let index = response.node.map(|n| n.modified_index as i64).unwrap_or_default();
        debug!(%sling_id, index, count = properties.len(), "instance properties sent");
        Ok(index)
    }

    /// Properties of one instance; empty if it never published any.
    pub async fn get_properties(&self, sling_id: &str) -> StoreResult<Properties> {
        let key = self.layout.properties_key(sling_id);
        match self.store.get(&key, GetOptions::default()).await {
            Ok(response) => {
                self.stats.record(&Ok(()));
                match response.node.and_then(|n| n.value) {
                    Some(value) => Ok(properties_from_json(&value)?),
                    None => Ok(Properties::new()),
                }
            }
            Err(e) if e.is_key_not_found() => {
                self.stats.record(&Ok(()));
                Ok(Properties::new())
            }
            Err(e) => self.track(Err(e)),
        }
    }

    /// Properties of every instance, in one request.
    pub async fn get_instances_properties(&self) -> StoreResult<HashMap<String, Properties>> {
        let dir = self.layout.properties_dir();
        let nodes = match self.store.get(&dir, GetOptions::recursive_sorted()).await {
            Ok(response) => {
                self.stats.record(&Ok(()));
                response.node.map(|n| n.nodes).unwrap_or_default()
            }
            Err(e) if e.is_key_not_found() => {
                self.stats.record(&Ok(()));
                Vec::new()
            }
            Err(e) => return self.track(Err(e)),
        };

        let mut properties = HashMap::with_capacity(nodes.len());
        for node in nodes.iter().filter(|n| !n.dir) {
            if let Some(value) = node.value.as_deref() {
                properties.insert(node.name().to_string(), properties_from_json(value)?);
            }
        }
        Ok(properties)
    }

    /// Cluster id stored in the namespace, if any.
    pub async fn get_cluster_id(&self) -> StoreResult<Option<String>> {
        match self.store.get(&self.layout.cluster_id_key(), GetOptions::default()).await {
            Ok(response) => {
                self.stats.record(&Ok(()));
                Ok(response.node.and_then(|n| n.value))
            }
            Err(e) if e.is_key_not_found() => {
                self.stats.record(&Ok(()));
                Ok(None)
            }
            Err(e) => self.track(Err(e)),
        }
    }

    /// Claim `candidate` as the namespace's cluster id unless another
    /// instance already did; returns the id that won.
    pub async fn claim_cluster_id(&self, candidate: &str) -> StoreResult<String> {
        let key = self.layout.cluster_id_key();
        let options = PutOptions::default().with_prev_exist(false);
        match self.store.put(&key, Some(candidate), options).await {
            Ok(_) => {
                self.stats.record(&Ok(()));
                debug!(cluster_id = %candidate, "cluster id claimed");
                Ok(candidate.to_string())
            }
            Err(StoreError::Etcd(e)) if e.code == NODE_EXIST => {
                self.stats.record(&Ok(()));
                self.get_cluster_id()
                    .await?
                    .ok_or_else(|| StoreError::Etcd(e))
            }
            Err(e) => self.track(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EtcdError, RAFT_INTERNAL};
    use crate::memory::MemoryStore;

    fn service() -> (Arc<MemoryStore>, EtcdService) {
        let store = Arc::new(MemoryStore::new());
        let service = EtcdService::new(store.clone(), KeyLayout::new("/discovery/"));
        (store, service)
    }

    fn data(sling_id: &str) -> AnnounceData {
        AnnounceData::new(sling_id, "info", "c1", 0)
    }

    #[test]
    fn layout_paths() {
        let layout = KeyLayout::new("/d/");
        assert_eq!(layout.announces_dir(), "/d/announces");
        assert_eq!(layout.properties_key("a"), "/d/properties/a");
        assert_eq!(layout.cluster_id_key(), "/d/cluster-id");
    }

    #[tokio::test]
    async fn get_announces_on_empty_namespace_is_empty() {
        let (_, service) = service();
        assert!(service.get_announces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_then_list_announces() {
        let (_, service) = service();
        let first = service.create_announce(&data("a"), 10).await.unwrap();
        let second = service.create_announce(&data("b"), 10).await.unwrap();
        assert!(first.key_name() < second.key_name());
        assert_eq!(first.ttl(), Some(10));

        let nodes = service.get_announces().await.unwrap();
        let keys: Vec<&str> = nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec![first.key(), second.key()]);
    }

    #[tokio::test]
    async fn refresh_requires_existing_key() {
        let (_, service) = service();
        let announce = service.create_announce(&data("a"), 10).await.unwrap();
        let refreshed = service
            .refresh_announce(announce.key(), &data("a"), 20)
            .await
            .unwrap();
        assert_eq!(refreshed.ttl(), Some(20));

        let err = service
            .refresh_announce("/discovery/announces/999", &data("a"), 20)
            .await
            .unwrap_err();
        assert!(err.is_key_not_found());
    }

    #[tokio::test]
    async fn properties_round_trip() {
        let (_, service) = service();
        let mut props = Properties::new();
        props.insert("role".to_string(), "worker".to_string());

        let index = service.send_instance_properties(&props, "a").await.unwrap();
        assert!(index > 0);
        assert_eq!(service.get_properties("a").await.unwrap(), props);
        assert!(service.get_properties("missing").await.unwrap().is_empty());

        service.send_instance_properties(&Properties::new(), "b").await.unwrap();
        let all = service.get_instances_properties().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"], props);
        assert!(all["b"].is_empty());
    }

    #[tokio::test]
    async fn error_stats_count_and_reset() {
        let (store, service) = service();
        store.fail_next(StoreError::Io("refused".into()));
        store.fail_next(StoreError::Io("refused".into()));
        assert!(service.get_announces().await.is_err());
        assert!(service.get_announces().await.is_err());
        assert_eq!(service.stats().consecutive_io_errors(), 2);

        store.fail_next(StoreError::Etcd(EtcdError::new(RAFT_INTERNAL, "raft", "", 0)));
        assert!(service.get_announces().await.is_err());
        assert_eq!(service.stats().consecutive_io_errors(), 0);
        assert_eq!(service.stats().consecutive_etcd_errors(RAFT_INTERNAL), 1);
        assert_eq!(service.stats().consecutive_etcd_errors_in(300..400), 1);

        service.get_announces().await.unwrap();
        assert_eq!(service.stats().consecutive_etcd_errors_in(300..400), 0);
    }

    #[tokio::test]
    async fn claim_cluster_id_keeps_first_claim() {
        let (_, service) = service();
        assert_eq!(service.get_cluster_id().await.unwrap(), None);
        assert_eq!(service.claim_cluster_id("first").await.unwrap(), "first");
        assert_eq!(service.claim_cluster_id("second").await.unwrap(), "first");
        assert_eq!(service.get_cluster_id().await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn delete_announce_tolerates_missing_key() {
        let (_, service) = service();
        let announce = service.create_announce(&data("a"), 10).await.unwrap();
        service.delete_announce(announce.key()).await.unwrap();
        service.delete_announce(announce.key()).await.unwrap();
        assert!(service.get_announces().await.unwrap().is_empty());
    }
}
