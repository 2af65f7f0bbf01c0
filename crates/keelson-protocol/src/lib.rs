//! keelson-protocol: the membership protocol.
//!
//! A state machine joins the local instance to the discovery namespace,
//! and three periodic workers keep it there once it is `RUNNING`:
//!
//! ```text
//!                    ┌──────────── Context (state, cluster id) ◀───── events
//!                    │                   │
//!  step runner ──────┤  GET_CLUSTER … ANNOUNCE … CLEAR_ANNOUNCE
//!                    │
//!  Announcer ────────┼── refresh own announce, publish properties ──▶ store
//!  RemoteUpdater ────┼── read peers' announces and properties ◀────── store
//!  LocalUpdater ─────┴── AnnouncesMap + PropertiesMap ──▶ TopologyView ──▶ ViewManager
//! ```
//!
//! [`Discovery`] owns all of it and is the entry point for embedders.

pub mod context;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod phases;
pub mod providers;
pub mod shared;
pub mod shutdown;
pub mod state;
pub mod workers;

#[cfg(test)]
mod testing;

pub use context::{Context, StateProcessor};
pub use discovery::Discovery;
pub use error::{ProtocolError, ProtocolResult};
pub use identity::{ClusterIdentitySource, ConfigClusterIdentity, StoreClusterIdentity};
pub use providers::{PropertyProvider, PropertyProviders, ProviderId, StaticPropertyProvider};
pub use shared::{AnnouncesMap, LocalInstance, PropertiesMap};
pub use shutdown::Shutdown;
pub use state::{Event, State};
