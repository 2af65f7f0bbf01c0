//! End-to-end protocol runs against the in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keelson_core::config::{ClusterIdSource, DiscoveryConfig};
use keelson_core::{AnnounceData, Announces, Node, Properties};
use keelson_protocol::{Discovery, State, StaticPropertyProvider};
use async_trait::async_trait;
use keelson_store::error::EtcdError;
use keelson_store::{
    CoordinationStore, DeleteOptions, EtcdService, GetOptions, KeyLayout, MemoryStore, PutOptions,
    Response, StoreResult,
};
use keelson_view::{TopologyEvent, TopologyEventKind, TopologyView};

fn config(sling_id: &str) -> DiscoveryConfig {
    let mut config = DiscoveryConfig::for_instance(sling_id, &format!("http://{sling_id}:4502"));
    config.cluster.id = Some("c1".to_string());
    config
}

fn props(pairs: &[(&str, &str)]) -> Properties {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn recorder(discovery: &Discovery) -> Arc<Mutex<Vec<TopologyEventKind>>> {
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = kinds.clone();
    discovery.bind_listener(Arc::new(move |event: &TopologyEvent| -> anyhow::Result<()> {
        sink.lock().unwrap().push(event.kind);
        Ok(())
    }));
    kinds
}

async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[test]
fn leader_follows_lowest_announce_key() {
    let node = |key_name: u64, sling_id: &str| Node {
        key: format!("/discovery/announces/{key_name}"),
        value: Some(AnnounceData::new(sling_id, "", "c1", 0).to_json().unwrap()),
        ttl: Some(10),
        ..Node::default()
    };
    let nodes = vec![node(7, "late"), node(3, "early")];
    let announces = Announces::from_nodes(&nodes, true).unwrap();

    for local in ["early", "late"] {
        let view = TopologyView::build(announces.clone(), &HashMap::new(), local, true).unwrap();
        let cluster = view.cluster_view("c1").unwrap();
        assert_eq!(cluster.leader().sling_id(), "early");
        assert_eq!(view.announces().get("early").unwrap().key(), "/discovery/announces/3");
    }
}

#[tokio::test(start_paused = true)]
async fn single_instance_joins() {
    let store = Arc::new(MemoryStore::new());
    let a = Discovery::new(config("a"), store.clone());
    let events = recorder(&a);
    assert!(!a.get_topology().is_current());

    a.start();
    settle(3).await;

    assert_eq!(a.state(), State::Running);
    let view = a.get_topology();
    assert!(view.is_current());
    assert_eq!(view.instances().count(), 1);
    let local = view.local_instance();
    assert!(local.is_leader());
    assert_eq!(local.cluster_id(), "c1");
    assert_eq!(local.server_info(), "http://a:4502");
    assert_eq!(*events.lock().unwrap(), vec![TopologyEventKind::Init]);
    a.stop().await;
}

#[tokio::test(start_paused = true)]
async fn oldest_announce_leads() {
    let store = Arc::new(MemoryStore::new());
    let a = Discovery::new(config("a"), store.clone());
    let b = Discovery::new(config("b"), store.clone());
    let a_events = recorder(&a);

    a.start();
    settle(5).await;
    b.start();
    settle(15).await;

    for discovery in [&a, &b] {
        let view = discovery.get_topology();
        assert!(view.is_current(), "{}", discovery.sling_id());
        let cluster = view.cluster_view("c1").unwrap();
        assert_eq!(cluster.instances().len(), 2);
        assert_eq!(cluster.leader().sling_id(), "a");
    }
    let view = a.get_topology();
    let (ka, kb) = (
        view.announces().get("a").unwrap().key_name(),
        view.announces().get("b").unwrap().key_name(),
    );
    assert!(ka < kb);
    assert_eq!(
        *a_events.lock().unwrap(),
        vec![TopologyEventKind::Init, TopologyEventKind::Changing, TopologyEventKind::Changed]
    );

    a.stop().await;
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn departed_instance_leaves_view() {
    let store = Arc::new(MemoryStore::new());
    let a = Discovery::new(config("a"), store.clone());
    let b = Discovery::new(config("b"), store.clone());
    a.start();
    b.start();
    settle(10).await;
    assert_eq!(a.get_topology().instances().count(), 2);
    let b_key = a.get_topology().announces().get("b").unwrap().key().to_string();

    b.stop().await;
    assert!(store.value(&b_key).is_none());
    assert!(!b.get_topology().is_current());
    assert_eq!(b.state(), State::Stop);

    settle(10).await;
    let view = a.get_topology();
    assert!(view.is_current());
    assert_eq!(view.instances().map(|i| i.sling_id().to_string()).collect::<Vec<_>>(), vec!["a"]);
    a.stop().await;
}

#[tokio::test(start_paused = true)]
async fn silent_peer_expires_and_quorum_loss_is_ignored() {
    let store = Arc::new(MemoryStore::new());
    let service = EtcdService::new(store.clone(), KeyLayout::new("/discovery"));
    let a = Discovery::new(config("a"), store.clone());
    a.start();
    settle(3).await;

    // Written once and never refreshed.
    service
        .create_announce(&AnnounceData::new("silent", "x", "c1", 0), 6)
        .await
        .unwrap();
    let degraded = service
        .create_announce(&AnnounceData::new("degraded", "y", "c1", 0), 600)
        .await
        .unwrap();
    assert!(store.force_ttl(degraded.key(), -5));

    settle(4).await;
    let view = a.get_topology();
    assert!(view.instance("silent").is_some());
    assert!(view.instance("degraded").is_none());

    settle(10).await;
    let view = a.get_topology();
    assert!(view.instance("silent").is_none());
    assert_eq!(view.instances().count(), 1);
    a.stop().await;
}

#[tokio::test(start_paused = true)]
async fn leftover_announce_is_waited_out() {
    let store = Arc::new(MemoryStore::new());
    let service = EtcdService::new(store.clone(), KeyLayout::new("/discovery"));
    let leftover = service
        .create_announce(&AnnounceData::new("a", "http://a:4502", "c1", 0), 3)
        .await
        .unwrap();

    let a = Discovery::new(config("a"), store.clone());
    a.start();
    settle(1).await;
    assert_eq!(a.state(), State::ClearAnnounce);

    settle(5).await;
    assert_eq!(a.state(), State::Running);
    let view = a.get_topology();
    assert!(view.is_current());
    assert!(view.announces().get("a").unwrap().key_name() > leftover.key_name());
    a.stop().await;
}

/// Memory store whose ordered-key creation takes a second.
struct SlowCreate(Arc<MemoryStore>);

#[async_trait]
impl CoordinationStore for SlowCreate {
    async fn get(&self, key: &str, options: GetOptions) -> StoreResult<Response> {
        self.0.get(key, options).await
    }

    async fn put(&self, key: &str, value: Option<&str>, options: PutOptions) -> StoreResult<Response> {
        self.0.put(key, value, options).await
    }

    async fn post(&self, dir: &str, value: &str, ttl: Option<u64>) -> StoreResult<Response> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.0.post(dir, value, ttl).await
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> StoreResult<Response> {
        self.0.delete(key, options).await
    }
}

#[tokio::test(start_paused = true)]
async fn stop_during_announce_leaves_no_entry() {
    let store = Arc::new(MemoryStore::new());
    let service = EtcdService::new(store.clone(), KeyLayout::new("/discovery"));
    let a = Discovery::new(config("a"), Arc::new(SlowCreate(store.clone())));
    a.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.state(), State::Announce);

    a.stop().await;
    assert_eq!(a.state(), State::Stop);
    assert!(service.get_announces().await.unwrap().is_empty());
    assert!(!a.get_topology().is_current());
}

#[tokio::test(start_paused = true)]
async fn rejected_request_stops_protocol() {
    let store = Arc::new(MemoryStore::new());
    store.fail_next(EtcdError::new(209, "Invalid field", "", 0).into());
    let a = Discovery::new(config("a"), store.clone());
    a.start();
    settle(5).await;

    assert_eq!(a.state(), State::Stop);
    assert!(!a.get_topology().is_current());
    a.stop().await;
}

#[tokio::test(start_paused = true)]
async fn transient_store_errors_recover() {
    let store = Arc::new(MemoryStore::new());
    store.fail_next(EtcdError::new(300, "Raft Internal Error", "", 0).into());
    store.fail_next(keelson_store::StoreError::Io("connection refused".to_string()));
    let a = Discovery::new(config("a"), store.clone());
    a.start();
    settle(10).await;

    assert_eq!(a.state(), State::Running);
    assert!(a.get_topology().is_current());
    a.stop().await;
}

#[tokio::test(start_paused = true)]
async fn properties_reach_peers() {
    let store = Arc::new(MemoryStore::new());
    let mut a_config = config("a");
    a_config.properties.insert("zone".to_string(), "eu-1".to_string());
    let a = Discovery::new(a_config, store.clone());
    let b = Discovery::new(config("b"), store.clone());
    a.start();
    b.start();
    settle(10).await;

    let seen = b.get_topology();
    assert_eq!(seen.instance("a").unwrap().property("zone"), Some("eu-1"));

    let b_events = recorder(&b);
    let provider = a.bind_property_provider(Arc::new(
        StaticPropertyProvider::new(props(&[("zone", "eu-2"), ("role", "web")])).with_priority(10),
    ));
    settle(20).await;

    let seen = b.get_topology();
    let instance = seen.instance("a").unwrap();
    assert_eq!(instance.property("zone"), Some("eu-2"));
    assert_eq!(instance.property("role"), Some("web"));
    let kinds = b_events.lock().unwrap().clone();
    assert_eq!(kinds.first(), Some(&TopologyEventKind::Init));
    assert!(kinds.contains(&TopologyEventKind::PropertiesChanged));
    assert!(!kinds.contains(&TopologyEventKind::Changed));

    assert!(a.unbind_property_provider(provider));
    settle(20).await;
    assert_eq!(b.get_topology().instance("a").unwrap().property("zone"), Some("eu-1"));

    a.stop().await;
    b.stop().await;
}

#[tokio::test(start_paused = true)]
async fn store_backed_cluster_id_is_shared() {
    let store = Arc::new(MemoryStore::new());
    let mut a_config = DiscoveryConfig::for_instance("a", "http://a");
    a_config.cluster.source = ClusterIdSource::Store;
    let mut b_config = DiscoveryConfig::for_instance("b", "http://b");
    b_config.cluster.source = ClusterIdSource::Store;

    let a = Discovery::new(a_config, store.clone());
    let b = Discovery::new(b_config, store.clone());
    a.start();
    settle(2).await;
    b.start();
    settle(10).await;

    assert_eq!(a.cluster_id().as_deref(), Some("a"));
    assert_eq!(b.cluster_id().as_deref(), Some("a"));
    assert_eq!(store.value("/discovery/cluster-id").as_deref(), Some("a"));
    assert_eq!(b.get_topology().cluster_view("a").unwrap().instances().len(), 2);

    a.stop().await;
    b.stop().await;
}
