//! Reconcile dispatcher: permit, dequeue, invoke, interpret.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use fleetsweep_core::{Reconciler, ReconcileResult, ResourceKind};
use fleetsweep_queue::{WorkItem, WorkQueue};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) struct DispatchCtx {
    pub queue: Arc<WorkQueue>,
    pub limiter: Arc<Semaphore>,
    pub reconcilers: FxHashMap<ResourceKind, Arc<dyn Reconciler>>,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub token: CancellationToken,
}

/// One dispatcher worker: acquire a permit, pop a key, run the decision
/// function, resolve the item. The permit brackets the whole dispatch so the
/// number of simultaneously running decision functions never exceeds the
/// semaphore size regardless of queue depth or worker count.
pub(crate) async fn run_worker(ctx: Arc<DispatchCtx>, worker: usize) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            permit = ctx.limiter.acquire() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let item = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            item = ctx.queue.dequeue() => match item {
                Some(i) => i,
                None => break,
            },
        };
        dispatch_one(&ctx, item).await;
        drop(permit);
    }
    debug!(worker, "dispatcher worker stopped");
}

async fn dispatch_one(ctx: &DispatchCtx, item: WorkItem) {
    let Some(reconciler) = ctx.reconcilers.get(&item.key.kind) else {
        // Only registered kinds produce keys, so this is a wiring bug.
        warn!(key = %item.key, "no reconciler registered for kind; dropping item");
        ctx.queue.done(&item.key).await;
        return;
    };

    let started = Instant::now();
    let reconciler = Arc::clone(reconciler);
    let key = item.key.clone();
    // A dedicated task contains abrupt failures inside the decision function;
    // a panicking reconcile must not take the worker down with it.
    let outcome = tokio::spawn(async move { reconciler.reconcile(key).await }).await;
    let result = outcome.unwrap_or_else(|join_err| {
        if join_err.is_panic() {
            ReconcileResult::Error(anyhow!("decision function panicked: {join_err}"))
        } else {
            ReconcileResult::Error(anyhow!("decision function task aborted"))
        }
    });

    let took = started.elapsed();
    histogram!(
        "fleetsweep_reconcile_duration_seconds",
        took.as_secs_f64(),
        "result" => result.label()
    );
    counter!("fleetsweep_reconcile_total", 1u64, "result" => result.label());

    match result {
        ReconcileResult::Done => {
            debug!(key = %item.key, took_ms = took.as_millis() as u64, retries = item.retries, "reconcile done");
            ctx.queue.done(&item.key).await;
        }
        ReconcileResult::RequeueAfter(delay) => {
            debug!(
                key = %item.key,
                delay_ms = delay.as_millis() as u64,
                took_ms = took.as_millis() as u64,
                retries = item.retries,
                "reconcile requeued"
            );
            ctx.queue.requeue(&item.key, delay).await;
        }
        ReconcileResult::RequeueImmediate => {
            debug!(
                key = %item.key,
                took_ms = took.as_millis() as u64,
                retries = item.retries,
                "reconcile requeued immediately"
            );
            ctx.queue.requeue(&item.key, Duration::ZERO).await;
        }
        ReconcileResult::Error(cause) => {
            let delay = backoff_delay(ctx.backoff_base, ctx.backoff_cap, item.retries);
            warn!(
                key = %item.key,
                error = %cause,
                retries = item.retries,
                delay_ms = delay.as_millis() as u64,
                took_ms = took.as_millis() as u64,
                "reconcile failed; requeueing with backoff"
            );
            ctx.queue.requeue_failed(&item.key, delay).await;
        }
    }
}

/// Doubling delay from `base`, capped at `cap`. `retries` counts the failed
/// attempts that already happened for the key.
pub(crate) fn backoff_delay(base: Duration, cap: Duration, retries: u32) -> Duration {
    let factor = 2u32.saturating_pow(retries.min(20));
    base.saturating_mul(factor).min(cap)
}

#[cfg(test)]
mod tests {
    use super::backoff_delay;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_and_saturates_at_cap() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_delay(base, cap, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, cap, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, cap, 10), Duration::from_secs(300));
        // Huge retry counts must not overflow or regress below the cap.
        assert_eq!(backoff_delay(base, cap, u32::MAX), cap);
    }

    #[test]
    fn backoff_is_non_decreasing() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(300);
        let mut last = Duration::ZERO;
        for retries in 0..64 {
            let d = backoff_delay(base, cap, retries);
            assert!(d >= last);
            last = d;
        }
    }
}
