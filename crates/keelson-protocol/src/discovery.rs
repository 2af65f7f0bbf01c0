//! Discovery service: wires the protocol together and exposes the
//! topology API.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use keelson_core::backoff::ttl_for;
use keelson_core::config::DiscoveryConfig;
use keelson_store::{CoordinationStore, EtcdService, KeyLayout};
use keelson_view::view::UNDEFINED_CLUSTER_ID;
use keelson_view::{ListenerId, TopologyEventListener, TopologyView, ViewManager};

use crate::context::Context;
use crate::identity::{self, ClusterIdentitySource, ConfigClusterIdentity};
use crate::phases::Phases;
use crate::providers::{PropertyProvider, PropertyProviders, ProviderId, StaticPropertyProvider};
use crate::shared::{AnnouncesMap, LocalInstance, PropertiesMap};
use crate::shutdown::Shutdown;
use crate::state::State;
use crate::workers::{self, Announcer, LocalUpdater, RemoteUpdater};

/// One instance's membership in the discovery namespace.
///
/// Created idle; [`Discovery::start`] spawns the protocol tasks on the
/// current tokio runtime and [`Discovery::stop`] withdraws the instance.
pub struct Discovery {
    config: DiscoveryConfig,
    local: LocalInstance,
    service: EtcdService,
    context: Arc<Context>,
    views: Arc<ViewManager>,
    providers: Arc<PropertyProviders>,
    announces: Arc<AnnouncesMap>,
    properties: Arc<PropertiesMap>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    /// Discovery with the identity source selected by configuration.
    pub fn new(config: DiscoveryConfig, store: Arc<dyn CoordinationStore>) -> Self {
        let service = EtcdService::new(store, KeyLayout::new(&config.store.root));
        let identity: Arc<dyn ClusterIdentitySource> =
            identity::from_config(&config.cluster, &service, &config.instance.sling_id).into();
        Self::with_service(config, service, identity)
    }

    pub fn with_identity(
        config: DiscoveryConfig,
        store: Arc<dyn CoordinationStore>,
        identity: Arc<dyn ClusterIdentitySource>,
    ) -> Self {
        let service = EtcdService::new(store, KeyLayout::new(&config.store.root));
        Self::with_service(config, service, identity)
    }

    fn with_service(
        config: DiscoveryConfig,
        service: EtcdService,
        identity: Arc<dyn ClusterIdentitySource>,
    ) -> Self {
        let identity = if identity.is_supported() {
            identity
        } else {
            warn!("cluster identity source unsupported, using configured id");
            Arc::new(ConfigClusterIdentity::from_config(&config.cluster))
        };

        let local = LocalInstance::new(
            config.instance.sling_id.as_str(),
            config.instance.server_info.as_str(),
        );
        let announces = Arc::new(AnnouncesMap::new());
        let properties = Arc::new(PropertiesMap::new(local.sling_id.as_str()));
        let providers = Arc::new(PropertyProviders::new());
        if !config.properties.is_empty() {
            providers.bind(Arc::new(StaticPropertyProvider::new(config.properties.clone())));
        }

        let max_ttl = ttl_for(config.backoff.announcer().max());
        let phases = Phases::new(
            service.clone(),
            identity,
            announces.clone(),
            properties.clone(),
            local.clone(),
            max_ttl,
            config.backoff.etcd_error(),
            config.backoff.io_error(),
        );
        let context = Context::new(Arc::new(phases));
        let views = Arc::new(ViewManager::new(TopologyView::undefined(&local.sling_id)));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            local,
            service,
            context,
            views,
            providers,
            announces,
            properties,
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the workers and start the state machine. Later calls are
    /// ignored.
    pub fn start(&self) {
        let mut handles = self.workers.lock().expect("discovery workers lock");
        if !handles.is_empty() || *self.shutdown.borrow() {
            return;
        }
        let shutdown = || Shutdown::new(self.shutdown.subscribe());
        let backoff = &self.config.backoff;

        let announcer = Announcer::new(
            self.context.clone(),
            self.service.clone(),
            self.announces.clone(),
            self.properties.clone(),
            self.local.clone(),
            backoff.announcer(),
        );
        let remote = RemoteUpdater::new(
            self.context.clone(),
            self.service.clone(),
            self.announces.clone(),
            self.properties.clone(),
            self.local.sling_id.as_str(),
            backoff.remote_updater(),
        );
        let local = LocalUpdater::new(
            self.context.clone(),
            self.announces.clone(),
            self.properties.clone(),
            self.providers.clone(),
            self.views.clone(),
            self.local.clone(),
            backoff.local_updater(),
        );
        handles.push(tokio::spawn(workers::run(local, shutdown())));
        handles.push(tokio::spawn(workers::run(announcer, shutdown())));
        handles.push(tokio::spawn(workers::run(remote, shutdown())));

        self.context.start();
        info!(
            sling_id = %self.local.sling_id,
            root = %self.service.layout().root(),
            "discovery started"
        );
    }

    /// Stop every task and withdraw the local announce.
    pub async fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.context.stop();
        // A step still in the store may yet set the local announce.
        self.context.join_runners().await;
        let handles: Vec<_> = self
            .workers
            .lock()
            .expect("discovery workers lock")
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task failed");
            }
        }

        if let Some(local) = self.announces.local() {
            match self.service.delete_announce(local.key()).await {
                Ok(()) => info!(key = local.key(), "announce withdrawn"),
                Err(e) => warn!(key = local.key(), error = %e, "failed to withdraw announce"),
            }
            self.announces.set_local(None);
        }
        let cluster_id = self
            .context
            .cluster_id()
            .unwrap_or_else(|| UNDEFINED_CLUSTER_ID.to_string());
        let data = self
            .local
            .announce_data(&cluster_id, self.properties.local_modified_index());
        self.views
            .update_view(TopologyView::isolated(&data, self.properties.local()));
        info!(sling_id = %self.local.sling_id, "discovery stopped");
    }

    /// The latest view. Never absent, but only current while the
    /// instance is joined.
    pub fn get_topology(&self) -> Arc<TopologyView> {
        self.views.get_topology()
    }

    pub fn bind_listener(&self, listener: Arc<dyn TopologyEventListener>) -> ListenerId {
        self.views.bind_listener(listener)
    }

    pub fn unbind_listener(&self, id: ListenerId) -> bool {
        self.views.unbind_listener(id)
    }

    pub fn bind_property_provider(&self, provider: Arc<dyn PropertyProvider>) -> ProviderId {
        self.providers.bind(provider)
    }

    pub fn unbind_property_provider(&self, id: ProviderId) -> bool {
        self.providers.unbind(id)
    }

    pub fn state(&self) -> State {
        self.context.state()
    }

    pub fn cluster_id(&self) -> Option<String> {
        self.context.cluster_id()
    }

    pub fn sling_id(&self) -> &str {
        &self.local.sling_id
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        // Workers and the step runner only exit on shutdown.
        self.shutdown.send_replace(true);
        self.context.stop();
    }
}
