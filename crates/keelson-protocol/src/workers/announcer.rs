//! Announcer: keeps the local announce alive and publishes local
//! properties.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use keelson_core::backoff::ttl_for;
use keelson_core::{BackOff, Properties};
use keelson_store::{EtcdService, StoreError};

use crate::context::Context;
use crate::error::{ProtocolError, ProtocolResult};
use crate::shared::{AnnouncesMap, LocalInstance, PropertiesMap};
use crate::state::{Event, State};
use crate::workers::Worker;

pub struct Announcer {
    context: Arc<Context>,
    service: EtcdService,
    announces: Arc<AnnouncesMap>,
    properties: Arc<PropertiesMap>,
    local: LocalInstance,
    backoff: BackOff,
    /// Local properties as last written to the store.
    sent: Option<Properties>,
}

impl Announcer {
    pub fn new(
        context: Arc<Context>,
        service: EtcdService,
        announces: Arc<AnnouncesMap>,
        properties: Arc<PropertiesMap>,
        local: LocalInstance,
        backoff: BackOff,
    ) -> Self {
        Self {
            context,
            service,
            announces,
            properties,
            local,
            backoff,
            sent: None,
        }
    }

    async fn send_properties(&mut self) -> ProtocolResult<()> {
        let local = self.properties.local();
        if self.sent.as_ref() == Some(&local) {
            return Ok(());
        }
        let index = self
            .service
            .send_instance_properties(&local, &self.local.sling_id)
            .await?;
        self.properties.set_local_modified_index(index);
        self.sent = Some(local);
        Ok(())
    }

    async fn refresh(&mut self) -> ProtocolResult<()> {
        self.send_properties().await?;

        let current = self
            .announces
            .local()
            .ok_or(ProtocolError::LocalAnnounceMissing)?;
        let data = self
            .local
            .announce_data(current.cluster_id(), self.properties.local_modified_index());
        let ttl = ttl_for(self.backoff.next());
        let refreshed = self.service.refresh_announce(current.key(), &data, ttl).await?;
        self.announces.replace_local_if(current.key(), refreshed);
        debug!(key = current.key(), ttl, "announce refreshed");
        Ok(())
    }

    fn failure_event(error: &ProtocolError) -> Event {
        match error {
            ProtocolError::Store(StoreError::Etcd(e)) if e.is_key_not_found() => {
                Event::AnnounceRefreshFailedWithNoKey
            }
            ProtocolError::Store(StoreError::Etcd(_)) => Event::AnnounceRefreshFailedWithKey,
            ProtocolError::LocalAnnounceMissing => Event::AnnounceLocalInstanceNotFound,
            _ => Event::Reset,
        }
    }
}

#[async_trait]
impl Worker for Announcer {
    fn name(&self) -> &'static str {
        "announcer"
    }

    async fn tick(&mut self) -> Duration {
        if !self.context.is(State::Running) {
            self.backoff.reset();
            self.sent = None;
            return self.backoff.current();
        }
        match self.refresh().await {
            Ok(()) => {
                self.backoff.increment();
            }
            Err(error) => {
                self.backoff.reset();
                let event = Self::failure_event(&error);
                warn!(error = %error, %event, "announce refresh failed");
                self.context.next_if(State::Running, event);
            }
        }
        self.backoff.current()
    }
}
