//! Dispatch loop draining the outbox into the event bus.
//!
//! The [`Dispatcher`] owns a background task that repeatedly claims a batch
//! of eligible events from the store, publishes each one to the bus, and
//! records the outcome per event. Publish failures reschedule the event with
//! exponential backoff; it stays in the outbox and is picked up again on a
//! later cycle. The loop runs until cancelled through [`Dispatcher::shutdown`].

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bote_core::{ClaimedEvent, Clock, RealClock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    bus::{EventBus, OutboundMessage},
    config::DispatcherConfig,
    error::Result,
    storage::OutboxStore,
};

/// Outbox dispatcher with a managed background loop.
///
/// Storage and bus are injected as trait objects, so the dispatcher runs
/// unchanged against PostgreSQL plus HTTP in production and against
/// in-memory doubles in tests. All timing flows through the injected clock.
pub struct Dispatcher {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
}

/// State shared between the handle and the spawned loop.
struct Inner {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    tick_busy: AtomicBool,
}

/// Clears the busy flag when a cycle finishes, even on early return.
struct TickPermit<'a> {
    busy: &'a AtomicBool,
}

impl Drop for TickPermit<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

impl Dispatcher {
    /// Creates a dispatcher reading time from the system clock.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        config: DispatcherConfig,
    ) -> Self {
        Self::with_clock(store, bus, config, Arc::new(RealClock::new()))
    }

    /// Creates a dispatcher with an injected clock.
    ///
    /// This constructor allows tests to control poll intervals, inline retry
    /// delays, and backoff timestamps deterministically.
    pub fn with_clock(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                config,
                clock,
                cancellation_token: CancellationToken::new(),
                tick_busy: AtomicBool::new(false),
            }),
            handle: None,
        }
    }

    /// Connects the bus and starts the background dispatch loop.
    ///
    /// Returns immediately after spawning the loop. Use [`shutdown`] to stop
    /// gracefully, or drop the dispatcher to cancel the loop outright.
    /// Calling `start` on a running dispatcher is a no-op.
    ///
    /// [`shutdown`]: Dispatcher::shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the bus connection cannot be established.
    pub async fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            debug!("dispatcher already running");
            return Ok(());
        }

        self.inner.bus.connect().await?;

        info!(
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            batch_size = self.inner.config.batch_size,
            "starting outbox dispatcher"
        );

        let inner = Arc::clone(&self.inner);
        self.handle = Some(tokio::spawn(async move { inner.run_loop().await }));

        info!("outbox dispatcher started");
        Ok(())
    }

    /// Gracefully shuts down the dispatcher.
    ///
    /// Signals the loop to stop and waits for the cycle in flight to
    /// complete, up to the configured shutdown timeout. On timeout the loop
    /// task is aborted; any events it had claimed stay in flight and are
    /// reclaimed once their claim goes stale. The bus is closed last.
    ///
    /// # Errors
    ///
    /// Returns error if closing the bus fails.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down outbox dispatcher");

        self.inner.cancellation_token.cancel();

        if let Some(mut handle) = self.handle.take() {
            match tokio::time::timeout(self.inner.config.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => {},
                Ok(Err(join_error)) => {
                    error!(error = %join_error, "dispatch loop task failed during shutdown");
                },
                Err(_elapsed) => {
                    warn!(
                        timeout_seconds = self.inner.config.shutdown_timeout.as_secs(),
                        "dispatch loop did not stop within shutdown timeout"
                    );
                    handle.abort();
                },
            }
        } else {
            info!("dispatcher was not started, shutdown completed immediately");
        }

        self.inner.bus.close().await?;

        info!("outbox dispatcher stopped");
        Ok(())
    }

    /// Runs a single claim-and-publish cycle.
    ///
    /// Claims up to `batch_size` eligible events, publishes each one, and
    /// records the outcome. Returns the number of events claimed. If a cycle
    /// is already in flight, returns `Ok(0)` without touching the store, so
    /// a manual tick never overlaps the background loop.
    ///
    /// This method is designed for testing and controlled batch processing;
    /// the loop spawned by [`Dispatcher::start`] calls it on every poll.
    ///
    /// # Errors
    ///
    /// Returns error if claiming from the store fails. Publish failures are
    /// recorded per event and do not fail the cycle.
    pub async fn tick(&self) -> Result<usize> {
        self.inner.tick().await
    }

    /// Returns true while the background loop is running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.inner.cancellation_token.cancel();
            warn!("dispatcher dropped without shutdown, cancelling dispatch loop");
        }
    }
}

impl Inner {
    /// Polls the outbox until cancelled.
    async fn run_loop(&self) {
        info!("dispatch loop started");

        loop {
            // Bail out before claiming if shutdown was already signalled.
            if self.cancellation_token.is_cancelled() {
                info!("dispatch loop received shutdown signal");
                break;
            }

            match self.tick().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {
                            // No eligible events, wait before polling again
                        }
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(dispatched) => {
                    debug!(dispatched, "dispatch cycle completed");
                },
                Err(error) => {
                    error!(error = %error, "dispatch cycle failed");
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {
                            // Wait before retrying to avoid tight error loops
                        }
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!("dispatch loop stopped");
    }

    /// Runs one cycle unless another is already in flight.
    async fn tick(&self) -> Result<usize> {
        if self.tick_busy.swap(true, Ordering::AcqRel) {
            debug!("dispatch cycle already in flight, skipping");
            return Ok(0);
        }
        let _permit = TickPermit { busy: &self.tick_busy };

        self.run_tick().await
    }

    /// Claims and dispatches one batch of eligible events.
    async fn run_tick(&self) -> Result<usize> {
        let events =
            self.store.claim_batch(self.config.batch_size, self.config.stale_timeout).await?;
        if events.is_empty() {
            return Ok(0);
        }

        let batch_size = events.len();
        debug!(batch_size, "processing claimed events");

        for event in events {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            self.dispatch_event(event).await;
        }

        Ok(batch_size)
    }

    /// Publishes a single claimed event and records the outcome.
    ///
    /// Failures recording the outcome are logged and swallowed. The row
    /// stays in flight and is reclaimed once its claim goes stale, which
    /// can deliver the event again. That duplicate is the at-least-once
    /// trade; the event is never lost.
    async fn dispatch_event(&self, event: ClaimedEvent) {
        let event_id = event.id;
        let message = OutboundMessage::from_claimed(&event);

        match self.publish_with_retry(&message).await {
            Ok(()) => {
                debug!(event_id = %event_id, topic = %event.topic, "event dispatched");
                if let Err(error) = self.store.mark_dispatched(event_id).await {
                    warn!(
                        event_id = %event_id,
                        error = %error,
                        "failed to mark event dispatched"
                    );
                }
            },
            Err(error) => {
                let attempts = event.attempts.saturating_add(1);
                let backoff = self.config.backoff.delay_for(attempts);
                warn!(
                    event_id = %event_id,
                    topic = %event.topic,
                    attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "publish failed, event rescheduled"
                );
                if let Err(mark_error) =
                    self.store.mark_failed(event_id, attempts, backoff, error.to_string()).await
                {
                    warn!(
                        event_id = %event_id,
                        error = %mark_error,
                        "failed to record publish failure"
                    );
                }
            },
        }
    }

    /// Publishes with bounded inline retries.
    ///
    /// Makes up to `publish_attempts` calls, sleeping `publish_retry_delay`
    /// times the attempt number between them. Returns the last error once
    /// attempts are exhausted; the caller reschedules from there.
    async fn publish_with_retry(&self, message: &OutboundMessage) -> Result<()> {
        let max_attempts = self.config.publish_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.bus.publish(message.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < max_attempts => {
                    debug!(
                        topic = %message.topic,
                        key = %message.key,
                        attempt,
                        error = %error,
                        "publish attempt failed, retrying"
                    );
                    let delay = self.config.publish_retry_delay.saturating_mul(attempt);
                    self.clock.sleep(delay).await;
                },
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bote_core::{NewEvent, OutboxStatus, TestClock};

    use super::*;
    use crate::{bus::mock::MockBus, storage::memory::MemoryOutboxStore};

    fn test_dispatcher(
        config: DispatcherConfig,
    ) -> (Dispatcher, Arc<MemoryOutboxStore>, Arc<MockBus>, Arc<TestClock>) {
        let clock = Arc::new(TestClock::new());
        let store = Arc::new(MemoryOutboxStore::new(clock.clone()));
        let bus = Arc::new(MockBus::new());
        let dispatcher =
            Dispatcher::with_clock(store.clone(), bus.clone(), config, clock.clone());
        (dispatcher, store, bus, clock)
    }

    #[tokio::test]
    async fn tick_returns_zero_on_empty_outbox() {
        let (dispatcher, _store, bus, _clock) = test_dispatcher(DispatcherConfig::default());

        let dispatched = dispatcher.tick().await.expect("tick should succeed");

        assert_eq!(dispatched, 0);
        assert_eq!(bus.publish_calls(), 0);
    }

    #[tokio::test]
    async fn tick_publishes_claimed_events_in_order() {
        let (dispatcher, store, bus, _clock) = test_dispatcher(DispatcherConfig::default());
        store.enqueue(NewEvent::new("orders", "o-1", b"first".to_vec())).await;
        store.enqueue(NewEvent::new("orders", "o-2", b"second".to_vec())).await;

        let dispatched = dispatcher.tick().await.expect("tick should succeed");

        assert_eq!(dispatched, 2);
        assert_eq!(store.count_by_status(OutboxStatus::Dispatched).await, 2);

        let published = bus.published().await;
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].key, "o-1");
        assert_eq!(published[1].key, "o-2");
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let (dispatcher, store, bus, _clock) = test_dispatcher(DispatcherConfig::default());
        store.enqueue(NewEvent::new("orders", "o-1", b"payload".to_vec())).await;

        dispatcher.inner.tick_busy.store(true, Ordering::Release);
        assert_eq!(dispatcher.tick().await.expect("tick should succeed"), 0);
        assert_eq!(bus.publish_calls(), 0);

        dispatcher.inner.tick_busy.store(false, Ordering::Release);
        assert_eq!(dispatcher.tick().await.expect("tick should succeed"), 1);
    }

    #[tokio::test]
    async fn busy_flag_clears_after_failed_tick() {
        let (dispatcher, store, _bus, _clock) = test_dispatcher(DispatcherConfig::default());
        store.enqueue(NewEvent::new("orders", "o-1", b"payload".to_vec())).await;

        store.inject_claim_error("connection reset").await;
        assert!(dispatcher.tick().await.is_err());

        // Next cycle must run normally after the error.
        assert_eq!(dispatcher.tick().await.expect("tick should succeed"), 1);
    }

    #[tokio::test]
    async fn start_processes_events_in_background() {
        let config = DispatcherConfig {
            poll_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(1),
            ..DispatcherConfig::default()
        };
        let clock = Arc::new(RealClock::new());
        let store = Arc::new(MemoryOutboxStore::new(clock.clone()));
        let bus = Arc::new(MockBus::new());
        store.enqueue(NewEvent::new("orders", "o-1", b"payload".to_vec())).await;

        let mut dispatcher =
            Dispatcher::with_clock(store.clone(), bus.clone(), config, clock);
        dispatcher.start().await.expect("start should succeed");
        assert!(dispatcher.is_running());
        assert!(bus.is_connected());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while store.count_by_status(OutboxStatus::Dispatched).await < 1 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "event was not dispatched before deadline"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        dispatcher.shutdown().await.expect("shutdown should succeed");
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn shutdown_without_start_closes_bus() {
        let (dispatcher, _store, bus, _clock) = test_dispatcher(DispatcherConfig::default());

        dispatcher.shutdown().await.expect("shutdown should succeed");

        assert!(bus.is_closed());
    }
}
