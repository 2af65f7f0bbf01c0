//! keelson-view: derived topology snapshots and listener notification.
//!
//! A [`TopologyView`] is rebuilt from scratch on every local update out of
//! an announce snapshot and the property maps. The [`ViewManager`] keeps
//! the current one, diffs each replacement against it and tells bound
//! listeners what changed.
//!
//! # Events
//!
//! ```text
//! first current view      → INIT (to listeners not yet initialized)
//! members or clusters     → CHANGING(old) then CHANGED(new)
//! properties only         → CHANGING(old) then PROPERTIES_CHANGED(new)
//! view stops being current → CHANGING(old)
//! ```

pub mod error;
pub mod manager;
pub mod view;

pub use error::{ViewError, ViewResult};
pub use manager::{ListenerId, TopologyEvent, TopologyEventKind, TopologyEventListener, ViewManager};
pub use view::{ClusterView, InstanceDescription, TopologyView};
