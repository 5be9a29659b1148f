//! Liveness/readiness predicates for an external probe handler.
//!
//! Readiness reflects real controller state (Running plus every registered
//! watch currently established) rather than a trivial ping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::LifecycleState;

#[derive(Clone)]
pub struct Health {
    state: watch::Receiver<LifecycleState>,
    watches_established: Arc<AtomicUsize>,
    watches_total: usize,
}

impl Health {
    pub(crate) fn new(
        state: watch::Receiver<LifecycleState>,
        watches_established: Arc<AtomicUsize>,
        watches_total: usize,
    ) -> Self {
        Self { state, watches_established, watches_total }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// The controller is live from creation until it has stopped.
    pub fn live(&self) -> bool {
        self.state() != LifecycleState::Stopped
    }

    /// Ready once running with every registered watch established; draining
    /// and stopped controllers are not ready.
    pub fn ready(&self) -> bool {
        self.state() == LifecycleState::Running
            && self.watches_established.load(Ordering::SeqCst) == self.watches_total
    }
}
