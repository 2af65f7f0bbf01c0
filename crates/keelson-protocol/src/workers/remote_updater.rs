//! RemoteUpdater: mirrors the other instances' announces and properties.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use keelson_core::{Announces, BackOff, Properties};
use keelson_store::EtcdService;

use crate::context::Context;
use crate::error::ProtocolResult;
use crate::shared::{self, AnnouncesMap, PropertiesMap};
use crate::state::{Event, State};
use crate::workers::Worker;

/// Classification of a new remote snapshot against the previous one.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AnnouncesDiff {
    /// Sling ids that were not in the previous snapshot.
    pub added: Vec<String>,
    /// Retained sling ids whose properties index moved.
    pub modified: Vec<String>,
    pub unchanged: Vec<String>,
}

impl AnnouncesDiff {
    pub fn compute(previous: &Announces, current: &Announces) -> Self {
        let mut diff = Self::default();
        for announce in current {
            let sling_id = announce.sling_id().to_string();
            match previous.get(announce.sling_id()) {
                None => diff.added.push(sling_id),
                Some(old)
                    if old.data().properties_modified_index
                        != announce.data().properties_modified_index =>
                {
                    diff.modified.push(sling_id)
                }
                Some(_) => diff.unchanged.push(sling_id),
            }
        }
        diff
    }

    /// Sling ids whose properties must be fetched.
    pub fn to_fetch(&self) -> Vec<&str> {
        self.added
            .iter()
            .chain(&self.modified)
            .map(String::as_str)
            .collect()
    }
}

pub struct RemoteUpdater {
    context: Arc<Context>,
    service: EtcdService,
    announces: Arc<AnnouncesMap>,
    properties: Arc<PropertiesMap>,
    local_sling_id: String,
    backoff: BackOff,
    discard_expired: bool,
}

impl RemoteUpdater {
    pub fn new(
        context: Arc<Context>,
        service: EtcdService,
        announces: Arc<AnnouncesMap>,
        properties: Arc<PropertiesMap>,
        local_sling_id: impl Into<String>,
        backoff: BackOff,
    ) -> Self {
        Self {
            context,
            service,
            announces,
            properties,
            local_sling_id: local_sling_id.into(),
            backoff,
            discard_expired: true,
        }
    }

    /// Keep entries with a non-positive TTL instead of dropping them.
    pub fn keep_expired(mut self) -> Self {
        self.discard_expired = false;
        self
    }

    /// Fetch the remote announces and publish them if they changed.
    /// Returns whether anything changed.
    pub async fn update(&self) -> ProtocolResult<bool> {
        let nodes = self.service.get_announces().await?;
        let remote = Announces::from_nodes(&nodes, self.discard_expired)?.without(&self.local_sling_id);
        let previous = self.announces.remote();
        if remote == previous {
            return Ok(false);
        }

        let diff = AnnouncesDiff::compute(&previous, &remote);
        let to_fetch = diff.to_fetch();
        let fetched = match to_fetch.as_slice() {
            [] => HashMap::new(),
            [sling_id] => {
                let properties = self.service.get_properties(sling_id).await?;
                HashMap::from([(sling_id.to_string(), properties)])
            }
            _ => self.service.get_instances_properties().await?,
        };

        let mut properties: HashMap<String, Properties> = self.properties.remote();
        properties.retain(|sling_id, _| remote.contains(sling_id));
        for sling_id in &to_fetch {
            let value = fetched.get(*sling_id).cloned().unwrap_or_default();
            properties.insert(sling_id.to_string(), value);
        }

        if !remote.same_members(&previous) {
            info!(
                instances = remote.len(),
                added = diff.added.len(),
                removed = previous.len().saturating_sub(diff.modified.len() + diff.unchanged.len()),
                "remote instances changed"
            );
        } else {
            debug!(modified = diff.modified.len(), "remote properties changed");
        }
        shared::publish_remote(&self.announces, &self.properties, remote, properties);
        Ok(true)
    }
}

#[async_trait]
impl Worker for RemoteUpdater {
    fn name(&self) -> &'static str {
        "remote-updater"
    }

    async fn tick(&mut self) -> Duration {
        if !self.context.is(State::Running) {
            self.backoff.reset();
            return self.backoff.current();
        }
        match self.update().await {
            Ok(true) => {
                self.backoff.reset();
            }
            Ok(false) => {
                self.backoff.increment();
            }
            Err(error) => {
                self.backoff.reset();
                warn!(error = %error, "remote update failed");
                self.context.next_if(State::Running, Event::Reset);
            }
        }
        self.backoff.current()
    }
}
