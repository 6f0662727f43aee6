//! End-to-end relay tests.
//!
//! Runs the full dispatcher loop against the in-memory store and a wiremock
//! bus endpoint, covering the happy path, recovery from a bus outage, and
//! pickup of events enqueued while the loop is running.

use std::{sync::Arc, time::Duration};

use bote_core::{NewEvent, OutboxStatus, RealClock};
use bote_dispatch::{
    storage::memory::MemoryOutboxStore, Dispatcher, DispatcherConfig, HttpBus, HttpBusConfig,
};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(2),
        ..DispatcherConfig::default()
    }
}

async fn wait_until_dispatched(store: &MemoryOutboxStore, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.count_by_status(OutboxStatus::Dispatched).await < expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "events were not dispatched before deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Pending events drain to the bus and end up dispatched.
#[tokio::test]
async fn outbox_events_flow_to_the_bus() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/topics/orders"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&mock_server)
        .await;

    let clock = Arc::new(RealClock::new());
    let store = Arc::new(MemoryOutboxStore::new(clock.clone()));
    for n in 0..3 {
        store
            .enqueue(NewEvent::new("orders", format!("o-{n}"), format!("payload {n}").into_bytes()))
            .await;
    }

    let bus =
        Arc::new(HttpBus::new(HttpBusConfig::new(mock_server.uri())).expect("bus should build"));
    let mut dispatcher = Dispatcher::new(store.clone(), bus, fast_config());
    dispatcher.start().await.expect("start should succeed");

    wait_until_dispatched(&store, 3).await;

    dispatcher.shutdown().await.expect("shutdown should succeed");
    mock_server.verify().await;
}

/// A bus outage parks the event as failed; once the bus recovers the event
/// is retried and delivered.
#[tokio::test]
async fn bus_outage_is_retried_until_delivery() {
    let mock_server = MockServer::start().await;

    // The first three publishes hit the outage, exhausting one cycle's
    // inline retries.
    Mock::given(method("POST"))
        .and(path("/topics/orders"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .up_to_n_times(3)
        .with_priority(1)
        .expect(3)
        .mount(&mock_server)
        .await;
    // After that the bus is healthy again.
    Mock::given(method("POST"))
        .and(path("/topics/orders"))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(2)
        .expect(1)
        .mount(&mock_server)
        .await;

    let clock = Arc::new(RealClock::new());
    let store = Arc::new(MemoryOutboxStore::new(clock.clone()));
    let event_id = store.enqueue(NewEvent::new("orders", "o-1", b"payload".to_vec())).await;

    let bus =
        Arc::new(HttpBus::new(HttpBusConfig::new(mock_server.uri())).expect("bus should build"));
    let mut dispatcher = Dispatcher::new(store.clone(), bus, fast_config());
    dispatcher.start().await.expect("start should succeed");

    wait_until_dispatched(&store, 1).await;
    dispatcher.shutdown().await.expect("shutdown should succeed");

    let event = store.find_event(event_id).await.expect("event should exist");
    assert_eq!(event.status, OutboxStatus::Dispatched);
    assert_eq!(event.attempts, 1, "one failed cycle was recorded");
    assert_eq!(event.last_error, None, "dispatch clears the recorded error");
    mock_server.verify().await;
}

/// The loop keeps polling, so events enqueued after startup still go out.
#[tokio::test]
async fn events_enqueued_while_running_are_picked_up() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/topics/billing"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let clock = Arc::new(RealClock::new());
    let store = Arc::new(MemoryOutboxStore::new(clock.clone()));

    let bus =
        Arc::new(HttpBus::new(HttpBusConfig::new(mock_server.uri())).expect("bus should build"));
    let mut dispatcher = Dispatcher::new(store.clone(), bus, fast_config());
    dispatcher.start().await.expect("start should succeed");

    // Let the loop run a few idle polls before the event arrives.
    tokio::time::sleep(Duration::from_millis(30)).await;
    store.enqueue(NewEvent::new("billing", "inv-7", b"invoice".to_vec())).await;

    wait_until_dispatched(&store, 1).await;

    dispatcher.shutdown().await.expect("shutdown should succeed");
    mock_server.verify().await;
}
