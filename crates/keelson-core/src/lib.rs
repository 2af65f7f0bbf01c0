//! keelson-core: data model shared by every keelson crate.
//!
//! Holds the announce value types that make up the liveness namespace,
//! the raw coordination-store node shape they are decoded from, the
//! backoff policies that pace every loop, and the TOML configuration.
//!
//! # Liveness namespace
//!
//! ```text
//! {root}/announces/
//!   ├── 3   {"slingId":"a","serverInfo":..,"clusterId":"c1","propertiesModifiedIndex":12}
//!   ├── 7   {"slingId":"b", ...}
//!   └── 9   {"slingId":"a", ...}   ← duplicate of 3, dropped by `Announces`
//! {root}/properties/
//!   ├── a   {"org.example.role":"worker"}
//!   └── b   {...}
//! ```
//!
//! Key names are allocated by the store in increasing order, so the lowest
//! key name of a cluster identifies its leader.

pub mod announce;
pub mod backoff;
pub mod config;
pub mod error;
pub mod node;

pub use announce::{Announce, AnnounceData, Announces, Properties};
pub use backoff::BackOff;
pub use config::DiscoveryConfig;
pub use error::{CoreError, CoreResult};
pub use node::Node;
