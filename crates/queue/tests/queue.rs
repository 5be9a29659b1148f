#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use fleetsweep_core::{ObjectRef, ResourceKind, WorkItemKey};
use fleetsweep_queue::WorkQueue;
use tokio::time::timeout;

fn key(name: &str) -> WorkItemKey {
    WorkItemKey::new(
        ResourceKind::new("agones.dev/v1/Fleet"),
        ObjectRef::new(Some("default"), name),
    )
}

#[tokio::test(start_paused = true)]
async fn enqueue_deduplicates_idle_keys() {
    let q = WorkQueue::new();
    for _ in 0..5 {
        q.enqueue(key("lobby")).await;
    }
    assert_eq!(q.len().await, 1);

    let item = q.dequeue().await.expect("one visible item");
    assert_eq!(item.key, key("lobby"));
    assert_eq!(item.retries, 0);

    // Nothing else is queued; a second dequeue must block.
    assert!(timeout(Duration::from_secs(1), q.dequeue()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn visible_items_come_out_fifo() {
    let q = WorkQueue::new();
    q.enqueue(key("a")).await;
    q.enqueue(key("b")).await;
    q.enqueue(key("c")).await;

    let names: Vec<String> = [
        q.dequeue().await.expect("a"),
        q.dequeue().await.expect("b"),
        q.dequeue().await.expect("c"),
    ]
    .into_iter()
    .map(|i| i.key.name)
    .collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn delayed_items_stay_invisible_until_due() {
    let q = WorkQueue::new();
    q.enqueue_after(key("later"), Duration::from_millis(100)).await;
    assert_eq!(q.len().await, 1);

    assert!(timeout(Duration::from_millis(50), q.dequeue()).await.is_err());

    let item = timeout(Duration::from_millis(100), q.dequeue())
        .await
        .expect("became visible at the 100ms mark")
        .expect("queue open");
    assert_eq!(item.key, key("later"));
}

#[tokio::test(start_paused = true)]
async fn in_flight_key_gets_exactly_one_follow_up() {
    let q = WorkQueue::new();
    q.enqueue(key("dirty")).await;
    let item = q.dequeue().await.expect("first dispatch");

    // Several events land while the key is in flight.
    q.enqueue(key("dirty")).await;
    q.enqueue(key("dirty")).await;
    assert_eq!(q.len().await, 0, "dirty mark must not queue a second entry");

    q.done(&item.key).await;
    let follow_up = q.dequeue().await.expect("exactly one follow-up");
    assert_eq!(follow_up.key, key("dirty"));
    q.done(&follow_up.key).await;

    assert!(timeout(Duration::from_secs(1), q.dequeue()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn retry_counter_grows_on_failure_and_resets_on_done() {
    let q = WorkQueue::new();
    q.enqueue(key("flaky")).await;

    let first = q.dequeue().await.expect("attempt 1");
    assert_eq!(first.retries, 0);
    q.requeue_failed(&first.key, Duration::from_millis(10)).await;

    let second = q.dequeue().await.expect("attempt 2");
    assert_eq!(second.retries, 1);
    q.requeue_failed(&second.key, Duration::from_millis(10)).await;

    let third = q.dequeue().await.expect("attempt 3");
    assert_eq!(third.retries, 2);
    q.done(&third.key).await;

    q.enqueue(key("flaky")).await;
    let fresh = q.dequeue().await.expect("history forgotten");
    assert_eq!(fresh.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn dirty_mark_overrides_requeue_delay() {
    let q = WorkQueue::new();
    q.enqueue(key("hot")).await;
    let item = q.dequeue().await.expect("in flight");

    q.enqueue(key("hot")).await; // arrives mid-dispatch
    q.requeue(&item.key, Duration::from_secs(600)).await;

    // The new event wins over the long delay.
    let again = timeout(Duration::from_millis(1), q.dequeue())
        .await
        .expect("visible immediately")
        .expect("queue open");
    assert_eq!(again.key, key("hot"));
}

#[tokio::test(start_paused = true)]
async fn close_unblocks_waiters_and_rejects_enqueues() {
    let q = Arc::new(WorkQueue::new());

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let q = Arc::clone(&q);
        waiters.push(tokio::spawn(async move { q.dequeue().await }));
    }
    // Let every waiter park on the empty queue first.
    tokio::time::sleep(Duration::from_millis(1)).await;

    q.close().await;
    for w in waiters {
        assert_eq!(w.await.expect("waiter not cancelled"), None);
    }

    q.enqueue(key("late")).await;
    assert_eq!(q.len().await, 0, "enqueue after close is a no-op");
    assert_eq!(q.dequeue().await, None);
}

#[tokio::test(start_paused = true)]
async fn close_does_not_hand_out_remaining_items() {
    let q = WorkQueue::new();
    q.enqueue(key("leftover")).await;
    q.close().await;
    assert_eq!(q.dequeue().await, None);
}
