//! Announce and property maps shared between the protocol tasks.
//!
//! Each map guards its local and remote halves with one mutex. When both
//! maps are locked together the announce map is always taken first.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use keelson_core::{Announce, AnnounceData, Announces, Properties};

/// Identity of the instance running the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInstance {
    pub sling_id: String,
    pub server_info: String,
}

impl LocalInstance {
    pub fn new(sling_id: impl Into<String>, server_info: impl Into<String>) -> Self {
        Self {
            sling_id: sling_id.into(),
            server_info: server_info.into(),
        }
    }

    /// Announce payload for this instance.
    pub fn announce_data(&self, cluster_id: &str, properties_modified_index: i64) -> AnnounceData {
        AnnounceData::new(
            self.sling_id.as_str(),
            self.server_info.as_str(),
            cluster_id,
            properties_modified_index,
        )
    }
}

#[derive(Debug, Default)]
struct AnnouncesInner {
    local: Option<Announce>,
    remote: Announces,
}

impl AnnouncesInner {
    fn all(&self) -> Announces {
        Announces::new(self.remote.iter().cloned().chain(self.local.clone()))
    }
}

/// The accepted local announce plus the latest remote snapshot.
#[derive(Debug, Default)]
pub struct AnnouncesMap {
    inner: Mutex<AnnouncesInner>,
}

impl AnnouncesMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AnnouncesInner> {
        self.inner.lock().expect("announces map lock")
    }

    pub fn local(&self) -> Option<Announce> {
        self.lock().local.clone()
    }

    pub fn set_local(&self, local: Option<Announce>) {
        self.lock().local = local;
    }

    /// Replace the local announce only if it still has `key`.
    ///
    /// A refresh racing with a re-announce must not resurrect the old key.
    pub fn replace_local_if(&self, key: &str, announce: Announce) -> bool {
        let mut inner = self.lock();
        match &inner.local {
            Some(current) if current.key() == key => {
                inner.local = Some(announce);
                true
            }
            _ => false,
        }
    }

    pub fn remote(&self) -> Announces {
        self.lock().remote.clone()
    }

    pub fn set_remote(&self, remote: Announces) {
        self.lock().remote = remote;
    }

    /// Local and remote announces merged under one lock acquisition.
    pub fn get_all(&self) -> Announces {
        self.lock().all()
    }
}

#[derive(Debug, Default)]
struct PropertiesInner {
    local: Properties,
    local_modified_index: i64,
    remote: HashMap<String, Properties>,
}

/// Local properties with their store index, plus remote properties by
/// sling id.
#[derive(Debug)]
pub struct PropertiesMap {
    local_sling_id: String,
    inner: Mutex<PropertiesInner>,
}

impl PropertiesMap {
    pub fn new(local_sling_id: impl Into<String>) -> Self {
        Self {
            local_sling_id: local_sling_id.into(),
            inner: Mutex::new(PropertiesInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PropertiesInner> {
        self.inner.lock().expect("properties map lock")
    }

    pub fn local(&self) -> Properties {
        self.lock().local.clone()
    }

    pub fn set_local(&self, properties: Properties) {
        self.lock().local = properties;
    }

    /// Store index of the last local properties write, 0 before the first.
    pub fn local_modified_index(&self) -> i64 {
        self.lock().local_modified_index
    }

    pub fn set_local_modified_index(&self, index: i64) {
        self.lock().local_modified_index = index;
    }

    pub fn remote(&self) -> HashMap<String, Properties> {
        self.lock().remote.clone()
    }

    pub fn set_remote(&self, remote: HashMap<String, Properties>) {
        self.lock().remote = remote;
    }

    /// Remote properties plus the local ones under the local sling id.
    pub fn get_all(&self) -> HashMap<String, Properties> {
        let inner = self.lock();
        self.merge(&inner)
    }

    fn merge(&self, inner: &PropertiesInner) -> HashMap<String, Properties> {
        let mut all = inner.remote.clone();
        all.insert(self.local_sling_id.clone(), inner.local.clone());
        all
    }
}

/// Publish a remote snapshot to both maps so that no reader sees new
/// announces with old properties.
pub fn publish_remote(
    announces: &AnnouncesMap,
    properties: &PropertiesMap,
    remote_announces: Announces,
    remote_properties: HashMap<String, Properties>,
) {
    let mut a = announces.lock();
    let mut p = properties.lock();
    a.remote = remote_announces;
    p.remote = remote_properties;
}

/// Consistent merged view of both maps.
pub fn snapshot(
    announces: &AnnouncesMap,
    properties: &PropertiesMap,
) -> (Announces, HashMap<String, Properties>) {
    let a = announces.lock();
    let p = properties.lock();
    (a.all(), properties.merge(&p))
}
