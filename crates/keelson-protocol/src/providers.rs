//! Property providers and their registry.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use tracing::error;

use keelson_core::Properties;

/// Contributes named properties for the local instance.
pub trait PropertyProvider: Send + Sync {
    /// Providers are merged by ascending priority, so a higher priority
    /// wins on a shared key.
    fn priority(&self) -> i32 {
        0
    }

    fn properties(&self) -> Properties;
}

/// A fixed set of properties.
#[derive(Debug, Clone, Default)]
pub struct StaticPropertyProvider {
    priority: i32,
    properties: Properties,
}

impl StaticPropertyProvider {
    pub fn new(properties: Properties) -> Self {
        Self {
            priority: 0,
            properties,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl PropertyProvider for StaticPropertyProvider {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn properties(&self) -> Properties {
        self.properties.clone()
    }
}

/// Handle returned by [`PropertyProviders::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    providers: Vec<(ProviderId, Arc<dyn PropertyProvider>)>,
}

/// Bound providers, in bind order.
#[derive(Default)]
pub struct PropertyProviders {
    registry: Mutex<Registry>,
}

impl PropertyProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, provider: Arc<dyn PropertyProvider>) -> ProviderId {
        let mut registry = self.registry.lock().expect("property providers lock");
        registry.next_id += 1;
        let id = ProviderId(registry.next_id);
        registry.providers.push((id, provider));
        id
    }

    pub fn unbind(&self, id: ProviderId) -> bool {
        let mut registry = self.registry.lock().expect("property providers lock");
        let before = registry.providers.len();
        registry.providers.retain(|(bound, _)| *bound != id);
        registry.providers.len() != before
    }

    pub fn len(&self) -> usize {
        self.registry.lock().expect("property providers lock").providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge every provider's properties. Providers are called outside
    /// the registry lock; one that panics contributes nothing.
    pub fn collect(&self) -> Properties {
        let bound: Vec<(ProviderId, Arc<dyn PropertyProvider>)> = {
            let registry = self.registry.lock().expect("property providers lock");
            registry.providers.clone()
        };
        let mut ranked: Vec<(i32, ProviderId, Arc<dyn PropertyProvider>)> = bound
            .into_iter()
            .filter_map(|(id, provider)| {
                let priority = guarded(id, || provider.priority())?;
                Some((priority, id, provider))
            })
            .collect();
        // Stable sort keeps bind order among equal priorities.
        ranked.sort_by_key(|(priority, _, _)| *priority);
        ranked.iter().fold(Properties::new(), |mut merged, (_, id, provider)| {
            if let Some(properties) = guarded(*id, || provider.properties()) {
                merged.extend(properties);
            }
            merged
        })
    }
}

fn guarded<T>(id: ProviderId, call: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(value) => Some(value),
        Err(_) => {
            error!(provider = id.0, "property provider panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(priority: i32, pairs: &[(&str, &str)]) -> Arc<dyn PropertyProvider> {
        let properties = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Arc::new(StaticPropertyProvider::new(properties).with_priority(priority))
    }

    #[test]
    fn empty_registry_yields_nothing() {
        let providers = PropertyProviders::new();
        assert!(providers.is_empty());
        assert!(providers.collect().is_empty());
    }

    #[test]
    fn higher_priority_overwrites() {
        let providers = PropertyProviders::new();
        providers.bind(provider(10, &[("role", "high"), ("zone", "eu")]));
        providers.bind(provider(-1, &[("role", "low"), ("rack", "r1")]));

        let merged = providers.collect();
        assert_eq!(merged["role"], "high");
        assert_eq!(merged["zone"], "eu");
        assert_eq!(merged["rack"], "r1");
    }

    #[test]
    fn equal_priority_later_bind_wins() {
        let providers = PropertyProviders::new();
        providers.bind(provider(0, &[("k", "first")]));
        providers.bind(provider(0, &[("k", "second")]));
        assert_eq!(providers.collect()["k"], "second");
    }

    #[test]
    fn unbind_removes_contribution() {
        let providers = PropertyProviders::new();
        let keep = providers.bind(provider(0, &[("a", "1")]));
        let gone = providers.bind(provider(0, &[("b", "2")]));

        assert!(providers.unbind(gone));
        assert!(!providers.unbind(gone));
        assert_eq!(providers.len(), 1);
        assert!(!providers.collect().contains_key("b"));
        assert_ne!(keep, gone);
    }

    struct Exploding;

    impl PropertyProvider for Exploding {
        fn properties(&self) -> Properties {
            panic!("provider failed");
        }
    }

    #[test]
    fn panicking_provider_is_skipped() {
        let providers = PropertyProviders::new();
        providers.bind(provider(0, &[("a", "1")]));
        providers.bind(Arc::new(Exploding));
        providers.bind(provider(5, &[("b", "2")]));

        let merged = providers.collect();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["a"], "1");
        assert_eq!(merged["b"], "2");
        assert_eq!(providers.len(), 3);
    }
}
