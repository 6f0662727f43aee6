//! Storage abstraction layer for the dispatcher.
//!
//! Provides a trait-based seam over outbox operations so dispatch logic can
//! be tested without a database. Production wraps the concrete
//! `bote_core::OutboxRepository`; tests use the in-memory store in
//! [`memory`], which implements the same claim semantics.

use std::{future::Future, pin::Pin, time::Duration};

use bote_core::{error::Result, storage::OutboxRepository, ClaimedEvent, EventId};

/// Outbox operations required by the dispatcher.
///
/// This trait abstracts the three storage touch points of a dispatch cycle:
/// claiming a batch, recording success, and recording failure. Implementors
/// must keep claims atomic so concurrent dispatchers never hand out the
/// same row twice.
pub trait OutboxStore: Send + Sync + 'static {
    /// Claims a batch of eligible events for dispatch.
    ///
    /// Eligible rows are pending or failed with `next_attempt_at` due, plus
    /// in-flight rows whose claim is older than `stale_timeout`. Claimed
    /// rows transition to in-flight and return with their pre-claim
    /// attempts counts, oldest first. An empty batch is the normal
    /// outbox-drained outcome, not an error.
    fn claim_batch(
        &self,
        limit: usize,
        stale_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ClaimedEvent>>> + Send + '_>>;

    /// Marks an event as successfully published.
    ///
    /// Terminal transition: sets the dispatch timestamp and clears any
    /// recorded error.
    fn mark_dispatched(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Records a failed dispatch cycle.
    ///
    /// Stores the new attempts count and error text, and schedules the next
    /// cycle at now plus `backoff`. The event stays claimable indefinitely.
    fn mark_failed(
        &self,
        event_id: EventId,
        attempts: i32,
        backoff: Duration,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Production store implementation using PostgreSQL.
///
/// Wraps the concrete repository to implement the `OutboxStore` trait. All
/// claim atomicity comes from the repository's `FOR UPDATE SKIP LOCKED`
/// transaction.
pub struct PostgresOutboxStore {
    repository: OutboxRepository,
}

impl PostgresOutboxStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(repository: OutboxRepository) -> Self {
        Self { repository }
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn claim_batch(
        &self,
        limit: usize,
        stale_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ClaimedEvent>>> + Send + '_>> {
        let repository = self.repository.clone();
        Box::pin(async move { repository.claim_batch(limit, stale_timeout).await })
    }

    fn mark_dispatched(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let repository = self.repository.clone();
        Box::pin(async move { repository.mark_dispatched(event_id).await })
    }

    fn mark_failed(
        &self,
        event_id: EventId,
        attempts: i32,
        backoff: Duration,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let repository = self.repository.clone();
        Box::pin(async move { repository.mark_failed(event_id, attempts, backoff, &error).await })
    }
}

pub mod memory {
    //! In-memory outbox store for testing.
    //!
    //! Implements the same eligibility and claim transition rules as the
    //! PostgreSQL repository against a plain vector, with an injected clock
    //! so tests control when backoff windows and stale timeouts elapse.

    use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

    use bote_core::{
        error::{CoreError, Result},
        models::{ClaimedEvent, EventId, NewEvent, OutboxEvent, OutboxStatus},
        time::{chrono_duration, Clock},
    };
    use chrono::{DateTime, Utc};
    use tokio::sync::RwLock;

    use super::OutboxStore;

    /// In-memory store mirroring the outbox claim semantics.
    ///
    /// Events live in insertion order; claims scan for eligibility, sort by
    /// creation time, and flip status under a single write lock, which
    /// serializes concurrent claimers the way row locks do in PostgreSQL.
    pub struct MemoryOutboxStore {
        events: Arc<RwLock<Vec<OutboxEvent>>>,
        claim_error: Arc<RwLock<Option<String>>>,
        clock: Arc<dyn Clock>,
    }

    impl MemoryOutboxStore {
        /// Creates an empty store reading time from the given clock.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                events: Arc::new(RwLock::new(Vec::new())),
                claim_error: Arc::new(RwLock::new(None)),
                clock,
            }
        }

        /// Enqueues an event as a fresh pending row.
        ///
        /// Mirrors the repository insert: status pending, zero attempts,
        /// eligible immediately. Returns the event's ID for verification.
        pub async fn enqueue(&self, event: NewEvent) -> EventId {
            let now = self.clock.now_utc();
            let id = event.id;

            self.events.write().await.push(OutboxEvent {
                id,
                topic: event.topic,
                key: event.key,
                value: event.value,
                headers: sqlx::types::Json(event.headers),
                status: OutboxStatus::Pending,
                attempts: 0,
                created_at: now,
                updated_at: now,
                dispatched_at: None,
                next_attempt_at: now,
                last_error: None,
            });

            id
        }

        /// Returns a copy of the stored event, if present.
        pub async fn find_event(&self, event_id: EventId) -> Option<OutboxEvent> {
            self.events.read().await.iter().find(|event| event.id == event_id).cloned()
        }

        /// Returns the current status of an event, if present.
        pub async fn event_status(&self, event_id: EventId) -> Option<OutboxStatus> {
            self.events.read().await.iter().find(|event| event.id == event_id).map(|e| e.status)
        }

        /// Counts stored events with the given status.
        pub async fn count_by_status(&self, status: OutboxStatus) -> usize {
            self.events.read().await.iter().filter(|event| event.status == status).count()
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            *self.claim_error.write().await = Some(error.into());
        }
    }

    /// Claim eligibility, matching the repository's SQL predicate.
    fn is_eligible(event: &OutboxEvent, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        match event.status {
            OutboxStatus::Pending | OutboxStatus::Failed => event.next_attempt_at <= now,
            OutboxStatus::InFlight => event.updated_at < stale_before,
            OutboxStatus::Dispatched => false,
        }
    }

    impl OutboxStore for MemoryOutboxStore {
        fn claim_batch(
            &self,
            limit: usize,
            stale_timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<ClaimedEvent>>> + Send + '_>> {
            let events = self.events.clone();
            let claim_error = self.claim_error.clone();
            let clock = self.clock.clone();

            Box::pin(async move {
                // Check for injected errors
                let error = claim_error.write().await.take();
                if let Some(error) = error {
                    return Err(CoreError::Database(error));
                }

                let now = clock.now_utc();
                let stale_before = now
                    .checked_sub_signed(chrono_duration(stale_timeout))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);

                let mut events = events.write().await;

                let mut eligible: Vec<usize> = events
                    .iter()
                    .enumerate()
                    .filter(|(_, event)| is_eligible(event, now, stale_before))
                    .map(|(index, _)| index)
                    .collect();
                // Stable sort keeps insertion order for equal timestamps.
                eligible.sort_by_key(|&index| events[index].created_at);
                eligible.truncate(limit);

                let mut claimed = Vec::with_capacity(eligible.len());
                for index in eligible {
                    let event = &mut events[index];
                    let pre_claim_attempts = event.attempts;

                    event.status = OutboxStatus::InFlight;
                    event.updated_at = now;

                    claimed.push(ClaimedEvent {
                        id: event.id,
                        topic: event.topic.clone(),
                        key: event.key.clone(),
                        value: event.value.clone(),
                        headers: event.headers.clone(),
                        attempts: pre_claim_attempts,
                    });
                }

                Ok(claimed)
            })
        }

        fn mark_dispatched(
            &self,
            event_id: EventId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let events = self.events.clone();
            let clock = self.clock.clone();

            Box::pin(async move {
                let now = clock.now_utc();
                if let Some(event) =
                    events.write().await.iter_mut().find(|event| event.id == event_id)
                {
                    event.status = OutboxStatus::Dispatched;
                    event.dispatched_at = Some(now);
                    event.last_error = None;
                    event.updated_at = now;
                }
                Ok(())
            })
        }

        fn mark_failed(
            &self,
            event_id: EventId,
            attempts: i32,
            backoff: Duration,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let events = self.events.clone();
            let clock = self.clock.clone();

            Box::pin(async move {
                let now = clock.now_utc();
                let next_attempt_at = now
                    .checked_add_signed(chrono_duration(backoff))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);

                if let Some(event) =
                    events.write().await.iter_mut().find(|event| event.id == event_id)
                {
                    event.status = OutboxStatus::Failed;
                    event.attempts = attempts;
                    event.next_attempt_at = next_attempt_at;
                    event.last_error = Some(error);
                    event.updated_at = now;
                }
                Ok(())
            })
        }
    }
}
