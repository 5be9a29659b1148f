//! Periodic resync trigger: full re-enumeration of every registered kind.

use std::sync::Arc;
use std::time::Duration;

use fleetsweep_core::{Lister, ResourceKind, WorkItemKey};
use fleetsweep_queue::WorkQueue;
use metrics::counter;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// On every sync-period tick, list all known objects of each kind and enqueue
/// them with a deterministic per-key delay inside the jitter window, so a
/// tick never lands the whole cluster on the queue at the same instant.
///
/// The first tick fires immediately: startup primes the queue with the full
/// current state instead of waiting one period.
pub(crate) async fn run(
    kinds: Vec<ResourceKind>,
    lister: Arc<dyn Lister>,
    queue: Arc<WorkQueue>,
    sync_period: Duration,
    jitter: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(sync_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for kind in &kinds {
            match lister.list(kind).await {
                Ok(objects) => {
                    debug!(kind = %kind, count = objects.len(), "resync enumerated objects");
                    counter!(
                        "fleetsweep_resync_objects_total",
                        objects.len() as u64,
                        "kind" => kind.to_string()
                    );
                    for object in objects {
                        let key = WorkItemKey::new(kind.clone(), object);
                        let delay = jitter_for(&key, jitter);
                        queue.enqueue_after(key, delay).await;
                    }
                }
                Err(err) => {
                    // Next tick retries; the watch stream keeps covering the gap.
                    warn!(kind = %kind, error = %err, "resync list failed");
                    counter!("fleetsweep_resync_errors_total", 1u64, "kind" => kind.to_string());
                }
            }
        }
    }
    debug!("resync trigger stopped");
}

/// Deterministic spread over the jitter window, keyed by the item itself so
/// repeated resyncs give each object a stable slot.
fn jitter_for(key: &WorkItemKey, window: Duration) -> Duration {
    let nanos = window.as_nanos() as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(key.stable_hash() % nanos)
}

#[cfg(test)]
mod tests {
    use super::jitter_for;
    use fleetsweep_core::{ObjectRef, ResourceKind, WorkItemKey};
    use std::time::Duration;

    #[test]
    fn jitter_stays_inside_window_and_is_stable() {
        let window = Duration::from_secs(2);
        for i in 0..100 {
            let key = WorkItemKey::new(
                ResourceKind::new("agones.dev/v1/Fleet"),
                ObjectRef::new(Some("ns"), &format!("fleet-{i}")),
            );
            let a = jitter_for(&key, window);
            assert!(a < window);
            assert_eq!(a, jitter_for(&key, window));
        }
    }

    #[test]
    fn zero_window_means_no_delay() {
        let key = WorkItemKey::new(ResourceKind::new("v1/ConfigMap"), ObjectRef::new(None, "x"));
        assert_eq!(jitter_for(&key, Duration::ZERO), Duration::ZERO);
    }
}
