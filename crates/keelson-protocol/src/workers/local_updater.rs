//! LocalUpdater: collects local properties and recomputes the topology
//! view.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::error;

use keelson_core::BackOff;
use keelson_view::view::UNDEFINED_CLUSTER_ID;
use keelson_view::{TopologyView, ViewManager};

use crate::context::Context;
use crate::providers::PropertyProviders;
use crate::shared::{self, AnnouncesMap, LocalInstance, PropertiesMap};
use crate::state::State;
use crate::workers::Worker;

pub struct LocalUpdater {
    context: Arc<Context>,
    announces: Arc<AnnouncesMap>,
    properties: Arc<PropertiesMap>,
    providers: Arc<PropertyProviders>,
    views: Arc<ViewManager>,
    local: LocalInstance,
    backoff: BackOff,
}

impl LocalUpdater {
    pub fn new(
        context: Arc<Context>,
        announces: Arc<AnnouncesMap>,
        properties: Arc<PropertiesMap>,
        providers: Arc<PropertyProviders>,
        views: Arc<ViewManager>,
        local: LocalInstance,
        backoff: BackOff,
    ) -> Self {
        Self {
            context,
            announces,
            properties,
            providers,
            views,
            local,
            backoff,
        }
    }

    /// The view matching the current protocol state, if one can be built.
    pub fn compute_view(&self) -> Option<TopologyView> {
        let local_properties = self.providers.collect();
        self.properties.set_local(local_properties.clone());

        if self.context.is(State::Running) {
            let (announces, properties) = shared::snapshot(&self.announces, &self.properties);
            match TopologyView::build(announces, &properties, &self.local.sling_id, true) {
                Ok(view) => Some(view),
                Err(e) => {
                    error!(error = %e, "cannot build topology view");
                    None
                }
            }
        } else {
            let cluster_id = self
                .context
                .cluster_id()
                .unwrap_or_else(|| UNDEFINED_CLUSTER_ID.to_string());
            let data = self
                .local
                .announce_data(&cluster_id, self.properties.local_modified_index());
            Some(TopologyView::isolated(&data, local_properties))
        }
    }
}

#[async_trait]
impl Worker for LocalUpdater {
    fn name(&self) -> &'static str {
        "local-updater"
    }

    async fn tick(&mut self) -> Duration {
        if let Some(view) = self.compute_view() {
            self.views.update_view(view);
        }
        self.backoff.increment();
        self.backoff.current()
    }
}
