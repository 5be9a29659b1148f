//! Fleetsweep reconciliation engine.
//!
//! Wires the watch adapter, work queue, concurrency limiter, reconcile
//! dispatcher and periodic resync trigger under one lifecycle controller.
//! The garbage decision itself is a [`Reconciler`] registered per kind; this
//! crate only owns the scheduling and execution discipline around it.

#![forbid(unsafe_code)]

mod dispatch;
mod health;
mod resync;
mod watch;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::Result;
use fleetsweep_core::{ConfigError, GcConfig, Lister, Reconciler, ResourceKind, WatchSource};
use fleetsweep_queue::WorkQueue;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{watch as state_watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use health::Health;

/// Lifecycle of the controller. `Draining` means the cancellation signal was
/// seen and in-flight dispatches are being given a chance to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Binds one resource kind to its subscription source and decision function.
/// Created at build time, immutable afterwards.
pub struct WatchRegistration {
    pub kind: ResourceKind,
    pub source: Arc<dyn WatchSource>,
    pub reconciler: Arc<dyn Reconciler>,
}

/// Builder for the controller. Validates the configuration surface before
/// anything starts; every validation failure here is fatal by design.
pub struct Builder {
    config: GcConfig,
    lister: Option<Arc<dyn Lister>>,
    registrations: Vec<WatchRegistration>,
}

impl Builder {
    pub fn new(config: GcConfig) -> Self {
        Self { config, lister: None, registrations: Vec::new() }
    }

    /// Full-state enumerator used by the periodic resync trigger.
    pub fn lister(mut self, lister: Arc<dyn Lister>) -> Self {
        self.lister = Some(lister);
        self
    }

    /// Watch `kind` via `source` and dispatch its keys to `reconciler`.
    pub fn register(
        mut self,
        kind: ResourceKind,
        source: Arc<dyn WatchSource>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        self.registrations.push(WatchRegistration { kind, source, reconciler });
        self
    }

    pub fn build(self) -> Result<Controller, ConfigError> {
        self.config.validate()?;
        if self.registrations.is_empty() {
            return Err(ConfigError::NoRegistrations);
        }
        let mut seen: FxHashSet<&ResourceKind> = FxHashSet::default();
        for reg in &self.registrations {
            if !seen.insert(&reg.kind) {
                return Err(ConfigError::DuplicateKind(reg.kind.to_string()));
            }
        }
        let lister = self.lister.ok_or(ConfigError::MissingLister)?;

        let (state_tx, state_rx) = state_watch::channel(LifecycleState::Created);
        let watches_established = Arc::new(AtomicUsize::new(0));
        let health = Health::new(state_rx, Arc::clone(&watches_established), self.registrations.len());
        Ok(Controller {
            config: self.config,
            registrations: self.registrations,
            lister,
            queue: Arc::new(WorkQueue::new()),
            state_tx,
            watches_established,
            health,
        })
    }
}

/// The lifecycle controller: owns startup, the worker pool, and graceful
/// drain on cancellation.
pub struct Controller {
    config: GcConfig,
    registrations: Vec<WatchRegistration>,
    lister: Arc<dyn Lister>,
    queue: Arc<WorkQueue>,
    state_tx: state_watch::Sender<LifecycleState>,
    watches_established: Arc<AtomicUsize>,
    health: Health,
}

impl Controller {
    /// Liveness/readiness predicates for an external probe handler.
    pub fn health(&self) -> Health {
        self.health.clone()
    }

    fn set_state(&self, state: LifecycleState) {
        let _ = self.state_tx.send(state);
    }

    /// Run until `token` is cancelled: start watch subscriptions, the resync
    /// ticker and the dispatcher workers, then supervise. On cancellation the
    /// queue stops handing out work, in-flight dispatches get `drain_grace`
    /// to finish, and the controller transitions to `Stopped`.
    pub async fn start(self, token: CancellationToken) -> Result<()> {
        self.set_state(LifecycleState::Starting);
        info!(
            kinds = self.registrations.len(),
            max_concurrent = self.config.max_concurrent_reconcile,
            sync_period_secs = self.config.sync_period.as_secs(),
            "starting fleet garbage collector"
        );

        let mut tasks = Vec::new();

        for reg in &self.registrations {
            tasks.push(tokio::spawn(watch::run_pump(
                reg.kind.clone(),
                Arc::clone(&reg.source),
                Arc::clone(&self.queue),
                Arc::clone(&self.watches_established),
                token.clone(),
            )));
        }

        tasks.push(tokio::spawn(resync::run(
            self.registrations.iter().map(|r| r.kind.clone()).collect(),
            Arc::clone(&self.lister),
            Arc::clone(&self.queue),
            self.config.sync_period,
            self.config.resync_jitter,
            token.clone(),
        )));

        let reconcilers: FxHashMap<ResourceKind, Arc<dyn Reconciler>> = self
            .registrations
            .iter()
            .map(|r| (r.kind.clone(), Arc::clone(&r.reconciler)))
            .collect();
        let ctx = Arc::new(dispatch::DispatchCtx {
            queue: Arc::clone(&self.queue),
            limiter: Arc::new(Semaphore::new(self.config.max_concurrent_reconcile)),
            reconcilers,
            backoff_base: self.config.backoff_base,
            backoff_cap: self.config.backoff_cap,
            token: token.clone(),
        });
        for worker in 0..self.config.max_concurrent_reconcile {
            tasks.push(tokio::spawn(dispatch::run_worker(Arc::clone(&ctx), worker)));
        }

        self.set_state(LifecycleState::Running);
        token.cancelled().await;

        self.set_state(LifecycleState::Draining);
        info!("shutdown signal received; draining in-flight reconciles");
        // From here no new dispatch begins: workers observe the token and the
        // closed queue unblocks any parked dequeue.
        self.queue.close().await;

        let drain = futures::future::join_all(tasks);
        if tokio::time::timeout(self.config.drain_grace, drain).await.is_err() {
            warn!(
                grace_secs = self.config.drain_grace.as_secs(),
                "drain grace elapsed with dispatches still in flight"
            );
        }

        self.set_state(LifecycleState::Stopped);
        info!("fleet garbage collector stopped");
        Ok(())
    }
}
