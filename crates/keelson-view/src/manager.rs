//! ViewManager: holds the current topology view and notifies listeners.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::view::TopologyView;

/// Kind of topology change delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyEventKind {
    /// First current view seen by this listener.
    Init,
    /// The current view is about to be replaced.
    Changing,
    /// Members, leaders or clusters changed.
    Changed,
    /// Only instance properties changed.
    PropertiesChanged,
}

/// A notification carrying the views it refers to.
#[derive(Debug, Clone)]
pub struct TopologyEvent {
    pub kind: TopologyEventKind,
    pub old_view: Option<Arc<TopologyView>>,
    pub new_view: Option<Arc<TopologyView>>,
}

impl TopologyEvent {
    fn init(view: Arc<TopologyView>) -> Self {
        Self {
            kind: TopologyEventKind::Init,
            old_view: None,
            new_view: Some(view),
        }
    }

    fn changing(old: Arc<TopologyView>) -> Self {
        Self {
            kind: TopologyEventKind::Changing,
            old_view: Some(old),
            new_view: None,
        }
    }

    fn changed(kind: TopologyEventKind, old: Arc<TopologyView>, new: Arc<TopologyView>) -> Self {
        Self {
            kind,
            old_view: Some(old),
            new_view: Some(new),
        }
    }
}

/// Receives topology events.
///
/// Errors and panics raised by a listener are logged and do not affect
/// other listeners or the protocol. Listeners must not bind or unbind
/// listeners from inside the callback.
pub trait TopologyEventListener: Send + Sync {
    fn handle_topology_event(&self, event: &TopologyEvent) -> anyhow::Result<()>;
}

impl<F> TopologyEventListener for F
where
    F: Fn(&TopologyEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn handle_topology_event(&self, event: &TopologyEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle returned by [`ViewManager::bind_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Binding {
    id: ListenerId,
    listener: Arc<dyn TopologyEventListener>,
    /// Whether INIT was delivered.
    initialized: bool,
}

struct State {
    view: Arc<TopologyView>,
    bindings: Vec<Binding>,
    next_id: u64,
}

type Delivery = (ListenerId, Arc<dyn TopologyEventListener>, TopologyEvent);

/// Keeps exactly one current view and emits change events.
pub struct ViewManager {
    state: Mutex<State>,
    /// Serializes notification so listeners see events in order.
    dispatch: Mutex<()>,
}

impl ViewManager {
    /// Start with a non-current placeholder view.
    pub fn new(initial: TopologyView) -> Self {
        Self {
            state: Mutex::new(State {
                view: Arc::new(initial),
                bindings: Vec::new(),
                next_id: 0,
            }),
            dispatch: Mutex::new(()),
        }
    }

    /// The view held right now; current or not, never absent.
    pub fn get_topology(&self) -> Arc<TopologyView> {
        self.state.lock().expect("view state lock").view.clone()
    }

    /// Bind a listener. It receives INIT right away if a current view
    /// exists, otherwise as soon as one does.
    pub fn bind_listener(&self, listener: Arc<dyn TopologyEventListener>) -> ListenerId {
        let _dispatch = self.dispatch.lock().expect("view dispatch lock");
        let (id, delivery) = {
            let mut state = self.state.lock().expect("view state lock");
            let id = ListenerId(state.next_id);
            state.next_id += 1;
            let initialized = state.view.is_current();
            let delivery = initialized
                .then(|| (id, listener.clone(), TopologyEvent::init(state.view.clone())));
            state.bindings.push(Binding {
                id,
                listener,
                initialized,
            });
            (id, delivery)
        };
        debug!(listener = id.0, initialized = delivery.is_some(), "topology listener bound");
        deliver(delivery);
        id
    }

    pub fn unbind_listener(&self, id: ListenerId) -> bool {
        let _dispatch = self.dispatch.lock().expect("view dispatch lock");
        let mut state = self.state.lock().expect("view state lock");
        let before = state.bindings.len();
        state.bindings.retain(|b| b.id != id);
        let removed = state.bindings.len() != before;
        if removed {
            debug!(listener = id.0, "topology listener unbound");
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().expect("view state lock").bindings.len()
    }

    /// Replace the held view if it differs and notify listeners.
    ///
    /// Returns false when the new view is equivalent and was dropped.
    pub fn update_view(&self, new_view: TopologyView) -> bool {
        let _dispatch = self.dispatch.lock().expect("view dispatch lock");
        let deliveries = {
            let mut state = self.state.lock().expect("view state lock");
            let old = state.view.clone();

            let members_changed = old.members_differ(&new_view);
            let properties_changed = old.properties_differ(&new_view);
            let clusters_changed = old.cluster_ids_differ(&new_view);
            let current_changed = old.is_current() != new_view.is_current();
            if !(members_changed || properties_changed || clusters_changed || current_changed) {
                return false;
            }

            let new = Arc::new(new_view);
            state.view = new.clone();
            let was_current = old.mark_old();

            info!(
                members_changed,
                properties_changed,
                clusters_changed,
                current = new.is_current(),
                instances = new.instances().count(),
                "topology view updated"
            );

            let mut changes = Vec::new();
            if was_current {
                changes.push(TopologyEvent::changing(old.clone()));
            }
            if new.is_current() {
                // Rejoining after isolation is a membership change even with the same members.
                let kind = if members_changed || clusters_changed || !was_current {
                    TopologyEventKind::Changed
                } else {
                    TopologyEventKind::PropertiesChanged
                };
                changes.push(TopologyEvent::changed(kind, old, new.clone()));
            }

            let mut deliveries: Vec<Delivery> = Vec::new();
            for binding in state.bindings.iter().filter(|b| b.initialized) {
                for event in &changes {
                    deliveries.push((binding.id, binding.listener.clone(), event.clone()));
                }
            }
            if new.is_current() {
                for binding in state.bindings.iter_mut().filter(|b| !b.initialized) {
                    binding.initialized = true;
                    deliveries.push((
                        binding.id,
                        binding.listener.clone(),
                        TopologyEvent::init(new.clone()),
                    ));
                }
            }
            deliveries
        };

        for delivery in deliveries {
            deliver(Some(delivery));
        }
        true
    }
}

fn deliver(delivery: Option<Delivery>) {
    let Some((id, listener, event)) = delivery else {
        return;
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| listener.handle_topology_event(&event)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(listener = id.0, kind = ?event.kind, error = %e, "topology listener failed");
        }
        Err(_) => {
            error!(listener = id.0, kind = ?event.kind, "topology listener panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use keelson_core::{Announce, AnnounceData, Announces, Properties};

    use super::*;

    /// Listener that records the kinds it receives.
    #[derive(Default)]
    struct Recorder {
        kinds: Mutex<Vec<TopologyEventKind>>,
    }

    impl Recorder {
        fn kinds(&self) -> Vec<TopologyEventKind> {
            self.kinds.lock().unwrap().clone()
        }
    }

    impl TopologyEventListener for Recorder {
        fn handle_topology_event(&self, event: &TopologyEvent) -> anyhow::Result<()> {
            self.kinds.lock().unwrap().push(event.kind);
            Ok(())
        }
    }

    fn announce(key_name: u64, sling_id: &str) -> Announce {
        let data = AnnounceData::new(sling_id, "info", "c1", 0);
        Announce::new(format!("/d/announces/{key_name}"), data, Some(10)).unwrap()
    }

    fn view(members: &[(u64, &str)], properties: &[(&str, &str, &str)], current: bool) -> TopologyView {
        let announces = Announces::new(members.iter().map(|(k, id)| announce(*k, id)));
        let mut props: HashMap<String, Properties> = HashMap::new();
        for (id, k, v) in properties {
            props
                .entry(id.to_string())
                .or_default()
                .insert(k.to_string(), v.to_string());
        }
        TopologyView::build(announces, &props, "a", current).unwrap()
    }

    fn manager_with(recorder: &Arc<Recorder>) -> ViewManager {
        let manager = ViewManager::new(TopologyView::undefined("a"));
        manager.bind_listener(recorder.clone());
        manager
    }

    use TopologyEventKind::*;

    #[test]
    fn placeholder_is_not_current() {
        let manager = ViewManager::new(TopologyView::undefined("a"));
        assert!(!manager.get_topology().is_current());
    }

    #[test]
    fn first_current_view_sends_only_init() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager_with(&recorder);
        assert!(recorder.kinds().is_empty());

        assert!(manager.update_view(view(&[(1, "a")], &[], true)));
        assert_eq!(recorder.kinds(), vec![Init]);
        assert!(manager.get_topology().is_current());
    }

    #[test]
    fn membership_change_sends_changing_then_changed() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager_with(&recorder);
        manager.update_view(view(&[(1, "a")], &[], true));
        let first = manager.get_topology();

        manager.update_view(view(&[(1, "a"), (2, "b")], &[], true));
        assert_eq!(recorder.kinds(), vec![Init, Changing, Changed]);
        assert!(!first.is_current());
    }

    #[test]
    fn property_change_sends_properties_changed() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager_with(&recorder);
        manager.update_view(view(&[(1, "a"), (2, "b")], &[], true));
        manager.update_view(view(&[(1, "a"), (2, "b")], &[("b", "k", "v")], true));
        assert_eq!(recorder.kinds(), vec![Init, Changing, PropertiesChanged]);
    }

    #[test]
    fn identical_view_is_ignored() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager_with(&recorder);
        manager.update_view(view(&[(1, "a")], &[], true));
        let held = manager.get_topology();

        assert!(!manager.update_view(view(&[(1, "a")], &[], true)));
        assert_eq!(recorder.kinds(), vec![Init]);
        assert!(Arc::ptr_eq(&held, &manager.get_topology()));
        assert!(held.is_current());
    }

    #[test]
    fn losing_current_sends_only_changing() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager_with(&recorder);
        manager.update_view(view(&[(1, "a")], &[], true));

        let local = AnnounceData::new("a", "info", "c1", 0);
        manager.update_view(TopologyView::isolated(&local, Properties::new()));
        assert_eq!(recorder.kinds(), vec![Init, Changing]);

        manager.update_view(view(&[(1, "a")], &[], true));
        assert_eq!(recorder.kinds(), vec![Init, Changing, Changed]);
    }

    #[test]
    fn regaining_current_with_same_members_is_changed() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager_with(&recorder);
        manager.update_view(view(&[(1, "a"), (2, "b")], &[], true));
        manager.update_view(view(&[(1, "a"), (2, "b")], &[], false));
        assert_eq!(recorder.kinds(), vec![Init, Changing]);

        assert!(manager.update_view(view(&[(1, "a"), (2, "b")], &[], true)));
        assert_eq!(recorder.kinds(), vec![Init, Changing, Changed]);
    }

    #[test]
    fn listener_bound_after_current_gets_init_immediately() {
        let manager = ViewManager::new(TopologyView::undefined("a"));
        manager.update_view(view(&[(1, "a")], &[], true));

        let recorder = Arc::new(Recorder::default());
        manager.bind_listener(recorder.clone());
        assert_eq!(recorder.kinds(), vec![Init]);

        manager.update_view(view(&[(1, "a"), (2, "b")], &[], true));
        assert_eq!(recorder.kinds(), vec![Init, Changing, Changed]);
    }

    #[test]
    fn late_listener_gets_init_while_early_gets_changes() {
        let early = Arc::new(Recorder::default());
        let manager = manager_with(&early);
        manager.update_view(view(&[(1, "a")], &[], true));

        let local = AnnounceData::new("a", "info", "c1", 0);
        manager.update_view(TopologyView::isolated(&local, Properties::new()));
        let late = Arc::new(Recorder::default());
        manager.bind_listener(late.clone());
        assert!(late.kinds().is_empty());

        manager.update_view(view(&[(1, "a"), (2, "b")], &[], true));
        assert_eq!(early.kinds(), vec![Init, Changing, Changed]);
        assert_eq!(late.kinds(), vec![Init]);
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let manager = ViewManager::new(TopologyView::undefined("a"));
        manager.bind_listener(Arc::new(|_: &TopologyEvent| -> anyhow::Result<()> {
            anyhow::bail!("listener broke")
        }));
        manager.bind_listener(Arc::new(|_: &TopologyEvent| -> anyhow::Result<()> {
            panic!("listener exploded")
        }));
        let recorder = Arc::new(Recorder::default());
        manager.bind_listener(recorder.clone());

        manager.update_view(view(&[(1, "a")], &[], true));
        assert_eq!(recorder.kinds(), vec![Init]);
    }

    #[test]
    fn unbound_listener_receives_nothing() {
        let recorder = Arc::new(Recorder::default());
        let manager = ViewManager::new(TopologyView::undefined("a"));
        let id = manager.bind_listener(recorder.clone());
        assert!(manager.unbind_listener(id));
        assert!(!manager.unbind_listener(id));
        assert_eq!(manager.listener_count(), 0);

        manager.update_view(view(&[(1, "a")], &[], true));
        assert!(recorder.kinds().is_empty());
    }

    #[test]
    fn events_carry_views() {
        let seen: Arc<Mutex<Vec<TopologyEvent>>> = Arc::default();
        let sink = seen.clone();
        let manager = ViewManager::new(TopologyView::undefined("a"));
        manager.bind_listener(Arc::new(move |event: &TopologyEvent| -> anyhow::Result<()> {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        }));
        manager.update_view(view(&[(1, "a")], &[], true));
        manager.update_view(view(&[(1, "a"), (2, "b")], &[], true));

        let events = seen.lock().unwrap();
        assert!(events[0].old_view.is_none());
        assert_eq!(events[0].new_view.as_ref().unwrap().instances().count(), 1);
        assert!(events[1].new_view.is_none());
        assert_eq!(events[2].new_view.as_ref().unwrap().instances().count(), 2);
        assert_eq!(events[2].old_view.as_ref().unwrap().instances().count(), 1);
    }
}
