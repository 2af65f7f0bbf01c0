//! keelson-store: access to the TTL-keyed coordination store.
//!
//! The protocol only talks to the store through [`EtcdService`], which
//! wraps any [`CoordinationStore`] implementation, turns raw responses
//! into announces and property maps, and counts consecutive failures so
//! the callers can pick a backoff.
//!
//! # Architecture
//!
//! ```text
//! EtcdService
//!   ├── create_announce()        POST  {root}/announces        (ordered key + TTL)
//!   ├── get_announces()          GET   {root}/announces        (recursive, sorted)
//!   ├── refresh_announce()       PUT   {key} prevExist=true    (TTL renewal)
//!   ├── send_instance_properties PUT   {root}/properties/{id}
//!   ├── get_properties()         GET   {root}/properties/{id}
//!   └── get_instances_properties GET   {root}/properties       (recursive)
//!        │
//!        ▼
//! dyn CoordinationStore ── HttpStore (etcd v2 keys API over hyper)
//!                       └─ MemoryStore (in-process, for tests)
//! ```

pub mod client;
pub mod error;
pub mod http;
pub mod memory;
pub mod service;

pub use client::{CoordinationStore, DeleteOptions, GetOptions, PutOptions, Response};
pub use error::{EtcdError, StoreError, StoreResult};
pub use http::HttpStore;
pub use memory::MemoryStore;
pub use service::{ErrorStats, EtcdService, KeyLayout};
