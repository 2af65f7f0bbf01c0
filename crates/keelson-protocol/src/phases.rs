//! Processing steps of the active protocol states.
//!
//! Each step talks to the store once or twice and answers with the event
//! that drives the next transition. Failures are mapped to a wait and an
//! event by [`Phases::recover`]:
//!
//! | failure                         | wait                               | event     |
//! |---------------------------------|------------------------------------|-----------|
//! | store error 300..400 (raft)     | etcd backoff at consecutive count  | `RESET`   |
//! | store error 200..300 (request)  | none                               | `STOPPED` |
//! | other store error               | 1 s                                | `RESET`   |
//! | transport error                 | io backoff at consecutive count    | `RESET`   |
//! | anything else                   | 60 s                               | `RESET`   |

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use keelson_core::{Announces, BackOff};
use keelson_store::error::RAFT_ERRORS;
use keelson_store::{EtcdService, StoreError};

use crate::context::{Context, StateProcessor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::identity::ClusterIdentitySource;
use crate::shared::{AnnouncesMap, LocalInstance, PropertiesMap};
use crate::shutdown::Shutdown;
use crate::state::{Event, State};

const CREATE_CLUSTER_RETRY: Duration = Duration::from_secs(1);
const STORE_ERROR_WAIT: Duration = Duration::from_secs(1);
const UNEXPECTED_ERROR_WAIT: Duration = Duration::from_secs(60);
const IDLE_TICK: Duration = Duration::from_secs(1);
/// A conflicting announce's TTL plus 15%, in milliseconds per second.
const CLEAR_MILLIS_PER_TTL_SECOND: u64 = 1150;

/// Shared handles used by the processing steps.
pub struct Phases {
    service: EtcdService,
    identity: Arc<dyn ClusterIdentitySource>,
    announces: Arc<AnnouncesMap>,
    properties: Arc<PropertiesMap>,
    local: LocalInstance,
    /// TTL in seconds for newly created announces.
    max_ttl: u64,
    etcd_backoff: BackOff,
    io_backoff: BackOff,
    /// TTL in seconds that `CLEAR_ANNOUNCE` waits out.
    clear_ttl: Mutex<u64>,
}

impl Phases {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: EtcdService,
        identity: Arc<dyn ClusterIdentitySource>,
        announces: Arc<AnnouncesMap>,
        properties: Arc<PropertiesMap>,
        local: LocalInstance,
        max_ttl: u64,
        etcd_backoff: BackOff,
        io_backoff: BackOff,
    ) -> Self {
        Self {
            service,
            identity,
            announces,
            properties,
            local,
            max_ttl,
            etcd_backoff,
            io_backoff,
            clear_ttl: Mutex::new(max_ttl),
        }
    }

    fn remember_clear_ttl(&self, ttl: u64) {
        *self.clear_ttl.lock().expect("clear ttl lock") = ttl;
    }

    /// How long `CLEAR_ANNOUNCE` waits for the conflicting entry to expire.
    pub fn clear_wait(&self) -> Duration {
        let ttl = *self.clear_ttl.lock().expect("clear ttl lock");
        Duration::from_millis(ttl.saturating_mul(CLEAR_MILLIS_PER_TTL_SECOND))
    }

    async fn get_cluster(&self, context: &Context) -> ProtocolResult<Option<Event>> {
        match self.identity.get_cluster_id().await? {
            Some(cluster_id) => {
                info!(%cluster_id, "cluster id defined");
                context.set_cluster_id(Some(cluster_id));
                Ok(Some(Event::ClusterDefined))
            }
            None => {
                info!("cluster id undefined");
                Ok(Some(Event::ClusterUndefined))
            }
        }
    }

    /// Never fails: a failed claim waits and retries in place.
    async fn create_cluster(&self, context: &Context, shutdown: &mut Shutdown) -> Option<Event> {
        match self.identity.set_cluster_id().await {
            Ok(Some(cluster_id)) => {
                info!(%cluster_id, "cluster id created");
                context.set_cluster_id(Some(cluster_id));
                return Some(Event::ClusterCreated);
            }
            Ok(None) => warn!("cluster id source returned no id"),
            Err(e) => warn!(error = %e, "failed to create cluster id"),
        }
        shutdown.sleep(CREATE_CLUSTER_RETRY).await;
        None
    }

    async fn announce(&self, context: &Context) -> ProtocolResult<Option<Event>> {
        self.announces.set_local(None);
        let cluster_id = context.cluster_id().ok_or(ProtocolError::ClusterUndefined)?;
        let sling_id = self.local.sling_id.as_str();

        // Expired entries count here: a degraded store may still hold ours.
        let existing = Announces::from_nodes(&self.service.get_announces().await?, false)?;
        if let Some(found) = existing.get(sling_id) {
            let ttl = match found.ttl() {
                Some(ttl) if ttl > 0 => ttl as u64,
                _ => self.max_ttl,
            };
            warn!(key = found.key(), ttl, "announce for this instance already present");
            self.remember_clear_ttl(ttl);
            return Ok(Some(Event::AnnounceDuplicated));
        }

        let data = self
            .local
            .announce_data(&cluster_id, self.properties.local_modified_index());
        let created = self.service.create_announce(&data, self.max_ttl).await?;

        let current = Announces::from_nodes(&self.service.get_announces().await?, false)?;
        match current.get(sling_id) {
            Some(lowest) if lowest.key() == created.key() => {
                info!(key = lowest.key(), %cluster_id, "announced");
                self.announces.set_local(Some(lowest.clone()));
                Ok(Some(Event::Announced))
            }
            Some(lowest) => {
                warn!(
                    created = created.key(),
                    existing = lowest.key(),
                    "older announce for this instance won, waiting for it to expire"
                );
                self.remember_clear_ttl(self.max_ttl);
                Ok(Some(Event::AnnounceDuplicated))
            }
            None => {
                warn!(created = created.key(), "created announce not visible yet");
                Ok(Some(Event::AnnounceLocalInstanceNotFound))
            }
        }
    }

    async fn clear_announce(&self, shutdown: &mut Shutdown) -> Option<Event> {
        let wait = self.clear_wait();
        info!(wait_ms = wait.as_millis() as u64, "waiting for conflicting announce to expire");
        shutdown.sleep(wait).await.then_some(Event::AnnounceCleared)
    }

    /// Wait and pick the event that follows a failed step.
    pub async fn recover(&self, state: State, error: ProtocolError, shutdown: &mut Shutdown) -> Option<Event> {
        let stats = self.service.stats();
        let wait = match &error {
            ProtocolError::Store(StoreError::Etcd(e)) if e.is_malformed_request() => {
                error!(%state, error = %e, "store rejected request, stopping protocol");
                return Some(Event::Stopped);
            }
            ProtocolError::Store(StoreError::Etcd(e)) if e.is_raft() => {
                let count = stats.consecutive_etcd_errors_in(RAFT_ERRORS);
                let wait = self.etcd_backoff.value(count);
                warn!(%state, error = %e, count, wait_ms = wait.as_millis() as u64, "store consensus error");
                wait
            }
            ProtocolError::Store(StoreError::Etcd(e)) => {
                warn!(%state, error = %e, "store error");
                STORE_ERROR_WAIT
            }
            ProtocolError::Store(StoreError::Io(e)) => {
                let count = stats.consecutive_io_errors();
                let wait = self.io_backoff.value(count);
                warn!(%state, error = %e, count, wait_ms = wait.as_millis() as u64, "store unreachable");
                wait
            }
            other => {
                error!(%state, error = %other, "unexpected failure");
                UNEXPECTED_ERROR_WAIT
            }
        };
        shutdown.sleep(wait).await.then_some(Event::Reset)
    }
}

#[async_trait]
impl StateProcessor for Phases {
    async fn process(&self, context: &Context, state: State, shutdown: &mut Shutdown) -> Option<Event> {
        let result = match state {
            State::GetCluster => self.get_cluster(context).await,
            State::CreateCluster => return self.create_cluster(context, shutdown).await,
            State::Announce => self.announce(context).await,
            State::ClearAnnounce => return self.clear_announce(shutdown).await,
            State::Running | State::Stop => {
                shutdown.sleep(IDLE_TICK).await;
                return None;
            }
        };
        match result {
            Ok(event) => event,
            Err(error) => self.recover(state, error, shutdown).await,
        }
    }
}
