//! Periodic workers serving the `RUNNING` state.
//!
//! Each worker does one tick, then sleeps for the period its backoff
//! returns. Sleeps end early on shutdown.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::shutdown::Shutdown;

pub mod announcer;
pub mod local_updater;
pub mod remote_updater;

pub use announcer::Announcer;
pub use local_updater::LocalUpdater;
pub use remote_updater::{AnnouncesDiff, RemoteUpdater};

#[async_trait]
pub trait Worker: Send + 'static {
    fn name(&self) -> &'static str;

    /// Run one iteration and return how long to wait before the next.
    async fn tick(&mut self) -> Duration;
}

/// Drive `worker` until shutdown.
pub async fn run<W: Worker>(mut worker: W, mut shutdown: Shutdown) {
    let name = worker.name();
    info!(worker = name, "worker started");
    while !shutdown.is_triggered() {
        let period = worker.tick().await;
        if !shutdown.sleep(period).await {
            break;
        }
    }
    info!(worker = name, "worker stopped");
}
