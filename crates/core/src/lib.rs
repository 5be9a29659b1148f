//! Fleetsweep core types: work-item keys, reconcile results, trait seams.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// A watched resource kind, addressed by its GVK key
/// (e.g. "agones.dev/v1/Fleet" or "v1/ConfigMap").
///
/// The set of kinds is open: kinds exist by being registered at build time,
/// there is no closed enum to extend when a new kind is watched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind(String);

impl ResourceKind {
    pub fn new(gvk_key: impl Into<String>) -> Self {
        Self(gvk_key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to one object of a watched kind, as yielded by watch sources
/// and listers. Namespace is `None` for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }
}

/// Identity of one reconcilable object: the deduplication key of the work
/// queue. Two notifications for the same object collapse to one queued item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl WorkItemKey {
    pub fn new(kind: ResourceKind, object: ObjectRef) -> Self {
        Self { kind, namespace: object.namespace, name: object.name }
    }

    /// Stable FNV-1a hash of the key, used for deterministic jitter spreading.
    pub fn stable_hash(&self) -> u64 {
        let mut h: u64 = 0xcbf29ce484222325;
        let mut eat = |bytes: &[u8]| {
            for b in bytes {
                h ^= *b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
        };
        eat(self.kind.as_str().as_bytes());
        eat(b"/");
        if let Some(ns) = &self.namespace {
            eat(ns.as_bytes());
        }
        eat(b"/");
        eat(self.name.as_bytes());
        h
    }
}

impl fmt::Display for WorkItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}:{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}:{}", self.kind, self.name),
        }
    }
}

/// Kind of change notification delivered by a watch source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// One change notification. Deletions are delivered like any other event;
/// whether a deletion needs follow-up work is the decision function's call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub object: ObjectRef,
}

/// Outcome of one dispatch of the decision function.
#[derive(Debug)]
pub enum ReconcileResult {
    /// Object is settled; drop the item and forget its retry history.
    Done,
    /// Revisit the object after the given delay.
    RequeueAfter(Duration),
    /// Revisit as soon as possible (e.g. an optimistic-concurrency conflict
    /// expected to clear on the next attempt).
    RequeueImmediate,
    /// The attempt failed; the dispatcher requeues with bounded backoff.
    Error(anyhow::Error),
}

impl ReconcileResult {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileResult::Done => "done",
            ReconcileResult::RequeueAfter(_) => "requeue_after",
            ReconcileResult::RequeueImmediate => "requeue",
            ReconcileResult::Error(_) => "error",
        }
    }
}

/// The pluggable garbage-collection decision function, registered per kind.
/// The core never inspects what cluster mutations it performs.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: WorkItemKey) -> ReconcileResult;
}

/// Subscription to change notifications for one kind.
///
/// `watch` delivers events into `events` until the subscription drops;
/// returning (with or without an error) signals a disconnect and the caller
/// re-invokes to reconnect. `established` must be fired exactly once, as soon
/// as the subscription is actually delivering from the backing store; a
/// session that never connects never fires it, and readiness stays false.
/// Implementations must not buffer state across calls that a reconnect would
/// invalidate.
#[async_trait::async_trait]
pub trait WatchSource: Send + Sync {
    async fn watch(
        &self,
        kind: &ResourceKind,
        events: mpsc::Sender<WatchEvent>,
        established: oneshot::Sender<()>,
    ) -> Result<()>;
}

/// Full-state enumeration for the periodic resync trigger.
#[async_trait::async_trait]
pub trait Lister: Send + Sync {
    async fn list(&self, kind: &ResourceKind) -> Result<Vec<ObjectRef>>;
}

/// Configuration surface handed to the controller at construction.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Interval between full resyncs of every registered kind.
    pub sync_period: Duration,
    /// Ceiling on simultaneously running decision-function invocations.
    pub max_concurrent_reconcile: usize,
    /// First retry delay after a failed dispatch; doubles per retry.
    pub backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub backoff_cap: Duration,
    /// Window over which resync enqueues are spread to avoid a reconcile
    /// spike at every tick.
    pub resync_jitter: Duration,
    /// How long shutdown waits for in-flight dispatches before giving up.
    pub drain_grace: Duration,
}

impl GcConfig {
    pub fn new(sync_period: Duration, max_concurrent_reconcile: usize) -> Self {
        Self {
            sync_period,
            max_concurrent_reconcile,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(300),
            resync_jitter: Duration::from_secs(2),
            drain_grace: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_period.is_zero() {
            return Err(ConfigError::ZeroSyncPeriod);
        }
        if self.max_concurrent_reconcile == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.backoff_base.is_zero() || self.backoff_cap < self.backoff_base {
            return Err(ConfigError::InvalidBackoff);
        }
        Ok(())
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(15), 5)
    }
}

/// Configuration errors, fatal at build time before any watch starts.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sync period must be positive")]
    ZeroSyncPeriod,
    #[error("max concurrent reconcile must be positive")]
    ZeroConcurrency,
    #[error("backoff base must be positive and no larger than the cap")]
    InvalidBackoff,
    #[error("at least one watch registration is required")]
    NoRegistrations,
    #[error("duplicate registration for kind {0}")]
    DuplicateKind(String),
    #[error("a lister is required for periodic resync")]
    MissingLister,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_covers_both_scopes() {
        let kind = ResourceKind::new("agones.dev/v1/Fleet");
        let namespaced = WorkItemKey::new(kind.clone(), ObjectRef::new(Some("game"), "lobby"));
        assert_eq!(namespaced.to_string(), "agones.dev/v1/Fleet:game/lobby");
        let cluster = WorkItemKey::new(kind, ObjectRef::new(None, "lobby"));
        assert_eq!(cluster.to_string(), "agones.dev/v1/Fleet:lobby");
    }

    #[test]
    fn stable_hash_distinguishes_namespace_from_name() {
        let kind = ResourceKind::new("v1/ConfigMap");
        let a = WorkItemKey::new(kind.clone(), ObjectRef::new(Some("ab"), "c"));
        let b = WorkItemKey::new(kind, ObjectRef::new(Some("a"), "bc"));
        assert_ne!(a.stable_hash(), b.stable_hash());
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        assert_eq!(
            GcConfig::new(Duration::ZERO, 5).validate(),
            Err(ConfigError::ZeroSyncPeriod)
        );
        assert_eq!(
            GcConfig::new(Duration::from_secs(15), 0).validate(),
            Err(ConfigError::ZeroConcurrency)
        );
        let mut cfg = GcConfig::default();
        cfg.backoff_cap = Duration::from_millis(1);
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidBackoff));
        assert!(GcConfig::default().validate().is_ok());
    }
}
