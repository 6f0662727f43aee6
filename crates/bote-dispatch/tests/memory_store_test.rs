//! Tests for the in-memory outbox store.
//!
//! Exercises the claim semantics the dispatcher relies on through the
//! `OutboxStore` trait: FIFO ordering, claim visibility, the stale-claim
//! boundary, and disjoint batches under concurrent claimers.

use std::{sync::Arc, time::Duration};

use bote_core::{Clock, NewEvent, OutboxStatus, TestClock};
use bote_dispatch::{storage::memory::MemoryOutboxStore, OutboxStore};
use chrono::Duration as ChronoDuration;

const STALE: Duration = Duration::from_secs(30);

fn test_store() -> (Arc<MemoryOutboxStore>, Arc<TestClock>) {
    let clock = Arc::new(TestClock::new());
    let store = Arc::new(MemoryOutboxStore::new(clock.clone()));
    (store, clock)
}

/// Claims hand out events oldest first and honor the batch limit.
#[tokio::test]
async fn claims_are_fifo_and_bounded() {
    let (store, clock) = test_store();
    let first = store.enqueue(NewEvent::new("orders", "o-1", b"a".to_vec())).await;
    clock.advance(Duration::from_millis(1));
    let second = store.enqueue(NewEvent::new("orders", "o-2", b"b".to_vec())).await;
    clock.advance(Duration::from_millis(1));
    let third = store.enqueue(NewEvent::new("orders", "o-3", b"c".to_vec())).await;

    let batch = store.claim_batch(2, STALE).await.expect("claim should succeed");
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].id, first);
    assert_eq!(batch[1].id, second);

    let rest = store.claim_batch(2, STALE).await.expect("claim should succeed");
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, third);
}

/// A claimed event is invisible to later claims while its claim is fresh.
#[tokio::test]
async fn claimed_events_are_not_handed_out_twice() {
    let (store, _clock) = test_store();
    let event_id = store.enqueue(NewEvent::new("orders", "o-1", b"payload".to_vec())).await;

    let batch = store.claim_batch(10, STALE).await.expect("claim should succeed");
    assert_eq!(batch.len(), 1);
    assert_eq!(store.event_status(event_id).await, Some(OutboxStatus::InFlight));

    assert!(store.claim_batch(10, STALE).await.expect("claim should succeed").is_empty());
}

/// Claims return the attempts count from before the claim; claiming itself
/// never increments it.
#[tokio::test]
async fn claims_carry_pre_claim_attempts() {
    let (store, clock) = test_store();
    store.enqueue(NewEvent::new("orders", "o-1", b"payload".to_vec())).await;

    let batch = store.claim_batch(10, STALE).await.expect("claim should succeed");
    assert_eq!(batch[0].attempts, 0);

    store
        .mark_failed(batch[0].id, 1, Duration::from_millis(400), "boom".to_string())
        .await
        .expect("mark_failed should succeed");

    clock.advance(Duration::from_millis(400));
    let reclaimed = store.claim_batch(10, STALE).await.expect("claim should succeed");
    assert_eq!(reclaimed[0].attempts, 1);
}

/// An in-flight claim becomes reclaimable only once it is strictly older
/// than the stale timeout.
#[tokio::test]
async fn stale_claims_are_reclaimed_after_the_timeout() {
    let (store, clock) = test_store();
    let event_id = store.enqueue(NewEvent::new("orders", "o-1", b"payload".to_vec())).await;

    let batch = store.claim_batch(10, STALE).await.expect("claim should succeed");
    assert_eq!(batch.len(), 1);

    // 29s in, the claim is fresh.
    clock.advance(Duration::from_secs(29));
    assert!(store.claim_batch(10, STALE).await.expect("claim should succeed").is_empty());

    // At exactly the stale timeout the claim still holds.
    clock.advance(Duration::from_secs(1));
    assert!(store.claim_batch(10, STALE).await.expect("claim should succeed").is_empty());

    // Strictly past the timeout the event is handed out again.
    clock.advance(Duration::from_millis(1));
    let reclaimed = store.claim_batch(10, STALE).await.expect("claim should succeed");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, event_id);
    assert_eq!(reclaimed[0].attempts, 0, "a stale reclaim is not a failure");
}

/// Dispatched is terminal; no amount of elapsed time makes the event
/// claimable again.
#[tokio::test]
async fn dispatched_events_are_never_reclaimed() {
    let (store, clock) = test_store();
    let event_id = store.enqueue(NewEvent::new("orders", "o-1", b"payload".to_vec())).await;

    let batch = store.claim_batch(10, STALE).await.expect("claim should succeed");
    store.mark_dispatched(batch[0].id).await.expect("mark_dispatched should succeed");

    let event = store.find_event(event_id).await.expect("event should exist");
    assert_eq!(event.status, OutboxStatus::Dispatched);
    assert!(event.dispatched_at.is_some());

    clock.advance(Duration::from_secs(3600));
    assert!(store.claim_batch(10, STALE).await.expect("claim should succeed").is_empty());
}

/// Recording a failure schedules the next cycle at now plus the backoff.
#[tokio::test]
async fn failed_events_wait_out_their_backoff() {
    let (store, clock) = test_store();
    let event_id = store.enqueue(NewEvent::new("orders", "o-1", b"payload".to_vec())).await;

    let batch = store.claim_batch(10, STALE).await.expect("claim should succeed");
    store
        .mark_failed(batch[0].id, 1, Duration::from_millis(400), "bus unreachable".to_string())
        .await
        .expect("mark_failed should succeed");

    let event = store.find_event(event_id).await.expect("event should exist");
    assert_eq!(event.status, OutboxStatus::Failed);
    assert_eq!(event.attempts, 1);
    assert_eq!(event.last_error.as_deref(), Some("bus unreachable"));
    assert_eq!(event.next_attempt_at, clock.now_utc() + ChronoDuration::milliseconds(400));

    // Inside the window the event stays parked.
    clock.advance(Duration::from_millis(399));
    assert!(store.claim_batch(10, STALE).await.expect("claim should succeed").is_empty());

    clock.advance(Duration::from_millis(1));
    assert_eq!(store.claim_batch(10, STALE).await.expect("claim should succeed").len(), 1);
}

/// Two concurrent claimers split the backlog without sharing any event.
#[tokio::test]
async fn concurrent_claimers_never_share_an_event() {
    let (store, _clock) = test_store();
    for n in 0..10 {
        store.enqueue(NewEvent::new("orders", format!("o-{n}"), b"payload".to_vec())).await;
    }

    let first_task = {
        let store = store.clone();
        tokio::spawn(async move { store.claim_batch(5, STALE).await })
    };
    let second_task = {
        let store = store.clone();
        tokio::spawn(async move { store.claim_batch(5, STALE).await })
    };

    let first = first_task.await.expect("task should join").expect("claim should succeed");
    let second = second_task.await.expect("task should join").expect("claim should succeed");

    assert_eq!(first.len() + second.len(), 10);

    let mut ids: Vec<_> = first.iter().chain(second.iter()).map(|event| event.id.0).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10, "no event may be claimed by both claimers");
}

/// An injected claim error is returned once, then claims work again.
#[tokio::test]
async fn injected_claim_errors_are_one_shot() {
    let (store, _clock) = test_store();
    store.enqueue(NewEvent::new("orders", "o-1", b"payload".to_vec())).await;

    store.inject_claim_error("deadlock detected").await;
    assert!(store.claim_batch(10, STALE).await.is_err());

    assert_eq!(store.claim_batch(10, STALE).await.expect("claim should succeed").len(), 1);
}
