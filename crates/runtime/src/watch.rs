//! Watch adapter: turns change notifications into work-item keys.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetsweep_core::{ResourceKind, WatchEvent, WatchSource, WorkItemKey};
use fleetsweep_queue::WorkQueue;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const EVENT_BUFFER: usize = 256;
const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
// A session that survives this long resets the reconnect delay.
const STABLE_SESSION: Duration = Duration::from_secs(10);

/// Pump one registered kind: hold the subscription open, map every event to a
/// key, enqueue it. A disconnect is never fatal; the source is re-established
/// with growing delay and the periodic resync repairs anything missed in
/// between. Deletions are enqueued like any other event.
pub(crate) async fn run_pump(
    kind: ResourceKind,
    source: Arc<dyn WatchSource>,
    queue: Arc<WorkQueue>,
    established: Arc<AtomicUsize>,
    token: CancellationToken,
) {
    let mut reconnect = RECONNECT_BASE;
    loop {
        if token.is_cancelled() {
            break;
        }
        let (tx, mut rx) = mpsc::channel::<WatchEvent>(EVENT_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let session_started = Instant::now();
        // Set once the source fires its readiness signal; a session that
        // never connects never counts toward readiness.
        let connected = AtomicBool::new(false);

        let consume = async {
            // Ends when the source returns and drops its sender.
            while let Some(ev) = rx.recv().await {
                let key = WorkItemKey::new(kind.clone(), ev.object);
                trace!(key = %key, event = ?ev.kind, "watch event enqueued");
                queue.enqueue(key).await;
            }
        };
        let mark = async {
            if ready_rx.await.is_ok() {
                established.fetch_add(1, Ordering::SeqCst);
                connected.store(true, Ordering::SeqCst);
                info!(kind = %kind, "watch subscription established");
            }
        };
        let session = futures::future::join3(source.watch(&kind, tx, ready_tx), consume, mark);

        let disconnected = tokio::select! {
            _ = token.cancelled() => None,
            (res, (), ()) = session => Some(res),
        };
        if connected.load(Ordering::SeqCst) {
            established.fetch_sub(1, Ordering::SeqCst);
        }

        match disconnected {
            None => break,
            Some(res) => {
                if session_started.elapsed() >= STABLE_SESSION {
                    reconnect = RECONNECT_BASE;
                }
                match res {
                    Ok(()) => warn!(kind = %kind, "watch stream ended; reconnecting"),
                    Err(err) => warn!(kind = %kind, error = %err, "watch failed; reconnecting"),
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(reconnect) => {}
                }
                reconnect = (reconnect * 2).min(RECONNECT_MAX);
            }
        }
    }
    debug!(kind = %kind, "watch pump stopped");
}
