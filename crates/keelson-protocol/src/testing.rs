//! Test helpers shared by the unit tests of this crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::{Context, StateProcessor};
use crate::shutdown::Shutdown;
use crate::state::{Event, State};

/// Processor that never produces an event.
pub struct Idle;

#[async_trait]
impl StateProcessor for Idle {
    async fn process(&self, _: &Context, _: State, shutdown: &mut Shutdown) -> Option<Event> {
        shutdown.sleep(Duration::from_secs(3600)).await;
        None
    }
}

/// Unstarted context already in `RUNNING` with cluster id `c1`.
pub fn running_context() -> Arc<Context> {
    let context = Context::new(Arc::new(Idle));
    context.set_cluster_id(Some("c1".to_string()));
    context.next(Event::ClusterDefined);
    context.next(Event::Announced);
    context
}
