//! Protocol context: current state, resolved cluster id, and the step
//! runner that serves the active states.
//!
//! Every transition goes through one mutex. After applying the table the
//! context supervises the runner: entering an active state makes sure a
//! runner is alive, entering `Running` or `Stop` signals it to exit.
//!
//! ```text
//!   GET_CLUSTER ──▶ CREATE_CLUSTER ──▶ ANNOUNCE ◀──▶ CLEAR_ANNOUNCE
//!        ▲                                │
//!        └──────────── RESET ───────── RUNNING        (any) ── STOPPED ──▶ STOP
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::shutdown::Shutdown;
use crate::state::{self, Event, State};

/// Executes one processing step for an active state.
///
/// Returning `None` re-runs the step for the same state, which is how a
/// step retries without an event. Long waits must go through `shutdown`
/// so the runner can be superseded promptly.
#[async_trait]
pub trait StateProcessor: Send + Sync + 'static {
    async fn process(&self, context: &Context, state: State, shutdown: &mut Shutdown) -> Option<Event>;
}

struct Runner {
    generation: u64,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Runner {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished() && !*self.shutdown.borrow()
    }
}

struct Inner {
    state: State,
    started: bool,
    generation: u64,
    runner: Option<Runner>,
    /// Signalled runners that may still be inside a step.
    retired: Vec<JoinHandle<()>>,
}

pub struct Context {
    inner: Mutex<Inner>,
    cluster_id: Mutex<Option<String>>,
    processor: Arc<dyn StateProcessor>,
}

impl Context {
    pub fn new(processor: Arc<dyn StateProcessor>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: State::GetCluster,
                started: false,
                generation: 0,
                runner: None,
                retired: Vec::new(),
            }),
            cluster_id: Mutex::new(None),
            processor,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("context lock")
    }

    /// Begin processing from the current state. Must be called from
    /// within a tokio runtime; later calls are ignored.
    pub fn start(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.started {
            return;
        }
        inner.started = true;
        info!(state = %inner.state, "protocol started");
        self.supervise(&mut inner);
    }

    /// The current protocol state.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Whether the protocol is currently in `state`.
    pub fn is(&self, state: State) -> bool {
        self.state() == state
    }

    /// Cluster id resolved by `GET_CLUSTER` or `CREATE_CLUSTER`, if any.
    pub fn cluster_id(&self) -> Option<String> {
        self.cluster_id.lock().expect("cluster id lock").clone()
    }

    pub fn set_cluster_id(&self, cluster_id: Option<String>) {
        *self.cluster_id.lock().expect("cluster id lock") = cluster_id;
    }

    /// Apply `event` to the current state and return the new state.
    pub fn next(self: &Arc<Self>, event: Event) -> State {
        let mut inner = self.lock();
        self.apply(&mut inner, event)
    }

    /// Apply `event` only while in `expected`. Used by the periodic
    /// workers so that a late failure cannot disturb a state they do not
    /// own.
    pub fn next_if(self: &Arc<Self>, expected: State, event: Event) -> bool {
        let mut inner = self.lock();
        if inner.state != expected {
            debug!(state = %inner.state, %expected, %event, "event ignored in unexpected state");
            return false;
        }
        self.apply(&mut inner, event);
        true
    }

    /// Enter the terminal state and stop the runner.
    pub fn stop(self: &Arc<Self>) -> State {
        self.next(Event::Stopped)
    }

    /// Wait for every signalled runner to leave its current step. A step
    /// blocked on the store only sees the stop signal once the call returns.
    pub async fn join_runners(&self) {
        let retired = std::mem::take(&mut self.lock().retired);
        for handle in retired {
            if let Err(e) = handle.await {
                warn!(error = %e, "step runner failed");
            }
        }
    }

    /// Event raised by the runner of `generation`; dropped if that runner
    /// has been superseded in the meantime.
    fn next_from(self: &Arc<Self>, generation: u64, event: Event) {
        let mut inner = self.lock();
        if inner.runner.as_ref().map(|r| r.generation) != Some(generation) {
            debug!(generation, %event, "event from superseded runner dropped");
            return;
        }
        self.apply(&mut inner, event);
    }

    fn apply(self: &Arc<Self>, inner: &mut Inner, event: Event) -> State {
        let from = inner.state;
        let to = state::next(from, event);
        inner.state = to;
        if from != to {
            info!(%from, %to, %event, "state transition");
        } else {
            debug!(state = %from, %event, "state unchanged");
        }
        if inner.started {
            self.supervise(inner);
        }
        to
    }

    fn supervise(self: &Arc<Self>, inner: &mut Inner) {
        if inner.state.is_active() {
            if inner.runner.as_ref().is_some_and(Runner::is_alive) {
                // The live runner reads the new state on its next pass.
                return;
            }
            inner.generation += 1;
            let generation = inner.generation;
            let (tx, shutdown) = Shutdown::channel();
            let handle = tokio::spawn(run(Arc::clone(self), generation, shutdown));
            debug!(generation, state = %inner.state, "step runner started");
            inner.runner = Some(Runner {
                generation,
                shutdown: tx,
                handle,
            });
        } else if let Some(runner) = inner.runner.take() {
            let _ = runner.shutdown.send(true);
            debug!(generation = runner.generation, state = %inner.state, "step runner stopped");
            inner.retired.retain(|handle| !handle.is_finished());
            inner.retired.push(runner.handle);
        }
    }
}

async fn run(context: Arc<Context>, generation: u64, mut shutdown: Shutdown) {
    loop {
        if shutdown.is_triggered() {
            break;
        }
        let state = context.state();
        if !state.is_active() {
            break;
        }
        let event = context.processor.process(&context, state, &mut shutdown).await;
        if shutdown.is_triggered() {
            break;
        }
        if let Some(event) = event {
            context.next_from(generation, event);
        }
    }
    debug!(generation, "step runner exited");
}
