//! In-process coordination store.
//!
//! Mirrors the etcd v2 key semantics the protocol relies on: ordered
//! key allocation, TTL expiry, conditional writes and the same error
//! codes. Expiry runs on `tokio::time::Instant`, so tests with paused
//! time can fast-forward TTLs. Used by tests and single-process setups.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use keelson_core::Node;

use crate::client::{CoordinationStore, DeleteOptions, GetOptions, PutOptions, Response};
use crate::error::{
    DIR_NOT_EMPTY, EtcdError, KEY_NOT_FOUND, NODE_EXIST, NOT_FILE, StoreError, StoreResult,
    TEST_FAILED,
};

#[derive(Debug, Clone)]
struct Entry {
    value: Option<String>,
    dir: bool,
    expires_at: Option<Instant>,
    /// TTL reported verbatim and never expired, see [`MemoryStore::force_ttl`].
    pinned_ttl: Option<i64>,
    modified_index: u64,
    created_index: u64,
}

impl Entry {
    fn ttl(&self, now: Instant) -> Option<i64> {
        if let Some(pinned) = self.pinned_ttl {
            return Some(pinned);
        }
        self.expires_at.map(|at| {
            let remaining = at.saturating_duration_since(now).as_secs_f64();
            remaining.ceil() as i64
        })
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.pinned_ttl.is_none() && self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    index: u64,
    failures: VecDeque<StoreError>,
}

impl Inner {
    fn purge(&mut self, now: Instant) {
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    fn not_found(&self, key: &str) -> StoreError {
        StoreError::Etcd(EtcdError::new(KEY_NOT_FOUND, "Key not found", key, self.index as i64))
    }

    fn has_children(&self, key: &str) -> bool {
        let prefix = format!("{key}/");
        self.entries
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    fn is_dir(&self, key: &str) -> bool {
        key.is_empty()
            || self.entries.get(key).is_some_and(|e| e.dir)
            || (!self.entries.contains_key(key) && self.has_children(key))
    }

    fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key) || self.has_children(key)
    }

    fn node(&self, key: &str, recursive: bool, depth: usize, now: Instant) -> Node {
        if let Some(entry) = self.entries.get(key).filter(|e| !e.dir) {
            return Node {
                key: key.to_string(),
                value: entry.value.clone(),
                ttl: entry.ttl(now),
                modified_index: entry.modified_index,
                created_index: entry.created_index,
                ..Default::default()
            };
        }

        let prefix = format!("{key}/");
        let children: BTreeSet<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                rest.split('/').next().map(|name| format!("{prefix}{name}"))
            })
            .collect();

        let nodes = if depth == 0 || recursive {
            children
                .iter()
                .map(|child| {
                    if recursive {
                        self.node(child, true, depth + 1, now)
                    } else {
                        self.shallow(child, now)
                    }
                })
                .collect()
        } else {
            Vec::new()
        };

        let (modified_index, created_index, ttl) = self
            .entries
            .get(key)
            .map(|e| (e.modified_index, e.created_index, e.ttl(now)))
            .unwrap_or((0, 0, None));
        Node {
            key: key.to_string(),
            dir: true,
            ttl,
            modified_index,
            created_index,
            nodes,
            ..Default::default()
        }
    }

    fn shallow(&self, key: &str, now: Instant) -> Node {
        if self.is_dir(key) {
            let mut node = self.node(key, false, 1, now);
            node.nodes.clear();
            node
        } else {
            self.node(key, false, 1, now)
        }
    }

    fn write(&mut self, key: &str, value: Option<&str>, ttl: Option<u64>, dir: bool, now: Instant) -> Node {
        self.index += 1;
        let created_index = self
            .entries
            .get(key)
            .map(|e| e.created_index)
            .unwrap_or(self.index);
        let entry = Entry {
            value: value.map(str::to_string),
            dir,
            expires_at: ttl.map(|secs| now + Duration::from_secs(secs)),
            pinned_ttl: None,
            modified_index: self.index,
            created_index,
        };
        self.entries.insert(key.to_string(), entry);
        self.node(key, false, 1, now)
    }
}

/// Coordination store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next operation fail with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, error: StoreError) {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.failures.push_back(error);
    }

    /// Pin the reported TTL of `key`, as a store that lost write quorum
    /// does. The key stops expiring until it is written again.
    pub fn force_ttl(&self, key: &str, ttl: i64) -> bool {
        let mut inner = self.inner.lock().expect("memory store lock");
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.pinned_ttl = Some(ttl);
                true
            }
            None => false,
        }
    }

    /// Current value of a leaf key, bypassing the client interface.
    pub fn value(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.purge(Instant::now());
        inner.entries.get(key).and_then(|e| e.value.clone())
    }

    fn begin(&self) -> StoreResult<std::sync::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().expect("memory store lock");
        if let Some(error) = inner.failures.pop_front() {
            return Err(error);
        }
        inner.purge(Instant::now());
        Ok(inner)
    }
}

fn normalize(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    if trimmed.starts_with('/') || trimmed.is_empty() {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str, options: GetOptions) -> StoreResult<Response> {
        let key = normalize(key);
        let inner = self.begin()?;
        if !key.is_empty() && !inner.exists(&key) {
            return Err(inner.not_found(&key));
        }
        let node = inner.node(&key, options.recursive, 0, Instant::now());
        Ok(Response {
            action: "get".to_string(),
            node: Some(node),
            prev_node: None,
        })
    }

    async fn put(&self, key: &str, value: Option<&str>, options: PutOptions) -> StoreResult<Response> {
        let key = normalize(key);
        let mut inner = self.begin()?;
        let now = Instant::now();
        let existing = inner.entries.get(&key).cloned();
        let exists = inner.exists(&key);

        match options.prev_exist {
            Some(true) if !exists => return Err(inner.not_found(&key)),
            Some(false) if exists => {
                return Err(StoreError::Etcd(EtcdError::new(
                    NODE_EXIST,
                    "Key already exists",
                    &key,
                    inner.index as i64,
                )));
            }
            _ => {}
        }
        if options.prev_value.is_some() || options.prev_index.is_some() {
            let Some(current) = existing.as_ref() else {
                return Err(inner.not_found(&key));
            };
            let value_matches = options
                .prev_value
                .as_deref()
                .is_none_or(|prev| current.value.as_deref() == Some(prev));
            let index_matches = options
                .prev_index
                .is_none_or(|prev| current.modified_index == prev);
            if !value_matches || !index_matches {
                return Err(StoreError::Etcd(EtcdError::new(
                    TEST_FAILED,
                    "Compare failed",
                    &key,
                    inner.index as i64,
                )));
            }
        }
        if inner.is_dir(&key) && !options.dir {
            return Err(StoreError::Etcd(EtcdError::new(
                NOT_FILE,
                "Not a file",
                &key,
                inner.index as i64,
            )));
        }

        let prev_node = existing.is_some().then(|| inner.node(&key, false, 1, now));
        let value = if options.dir { None } else { value.or(Some("")) };
        let node = inner.write(&key, value, options.ttl, options.dir, now);
        Ok(Response {
            action: if prev_node.is_some() { "update" } else { "set" }.to_string(),
            node: Some(node),
            prev_node,
        })
    }

    async fn post(&self, dir: &str, value: &str, ttl: Option<u64>) -> StoreResult<Response> {
        let dir = normalize(dir);
        let mut inner = self.begin()?;
        if inner.entries.get(&dir).is_some_and(|e| !e.dir) {
            return Err(StoreError::Etcd(EtcdError::new(
                NOT_FILE,
                "Not a directory",
                &dir,
                inner.index as i64,
            )));
        }
        let key = format!("{dir}/{:020}", inner.index + 1);
        let node = inner.write(&key, Some(value), ttl, false, Instant::now());
        Ok(Response {
            action: "create".to_string(),
            node: Some(node),
            prev_node: None,
        })
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> StoreResult<Response> {
        let key = normalize(key);
        let mut inner = self.begin()?;
        let now = Instant::now();
        if !inner.exists(&key) {
            return Err(inner.not_found(&key));
        }
        let prev = inner.node(&key, false, 1, now);
        if prev.dir && !options.dir && !options.recursive {
            return Err(StoreError::Etcd(EtcdError::new(
                NOT_FILE,
                "Not a file",
                &key,
                inner.index as i64,
            )));
        }
        if prev.dir && !options.recursive && inner.has_children(&key) {
            return Err(StoreError::Etcd(EtcdError::new(
                DIR_NOT_EMPTY,
                "Directory not empty",
                &key,
                inner.index as i64,
            )));
        }
        if let Some(expected) = options.prev_value.as_deref() {
            if prev.value.as_deref() != Some(expected) {
                return Err(StoreError::Etcd(EtcdError::new(
                    TEST_FAILED,
                    "Compare failed",
                    &key,
                    inner.index as i64,
                )));
            }
        }
        if let Some(expected) = options.prev_index {
            if prev.modified_index != expected {
                return Err(StoreError::Etcd(EtcdError::new(
                    TEST_FAILED,
                    "Compare failed",
                    &key,
                    inner.index as i64,
                )));
            }
        }

        let prefix = format!("{key}/");
        inner.entries.retain(|k, _| k != &key && !k.starts_with(&prefix));
        inner.index += 1;
        Ok(Response {
            action: "delete".to_string(),
            node: Some(Node {
                key: key.clone(),
                dir: prev.dir,
                modified_index: inner.index,
                created_index: prev.created_index,
                ..Default::default()
            }),
            prev_node: Some(prev),
        })
    }
}
