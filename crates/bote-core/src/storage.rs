//! Repository for outbox event database operations.
//!
//! Provides type-safe access to the outbox table with support for
//! transactional enqueue, concurrent claiming, and dispatch bookkeeping.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{ClaimedEvent, EventId, NewEvent, OutboxEvent, OutboxStatus},
    time::chrono_duration,
};

/// Repository for outbox event database operations.
///
/// Handles all database interactions for outbox events including enqueue,
/// lock-free claiming for concurrent dispatchers, and status transitions.
#[derive(Debug, Clone)]
pub struct OutboxRepository {
    pool: PgPool,
}

impl OutboxRepository {
    /// Creates a new repository instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueues an event inside the caller's transaction.
    ///
    /// The row commits or rolls back atomically with the caller's business
    /// writes. Fresh rows are pending with `next_attempt_at` set to now, so
    /// they are eligible for dispatch as soon as the transaction commits.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or constraints are violated.
    pub async fn enqueue(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &NewEvent,
    ) -> Result<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, topic, key, value, headers,
                status, attempts, created_at, updated_at, next_attempt_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $8, $8
            )
            "#,
        )
        .bind(event.id.0)
        .bind(&event.topic)
        .bind(&event.key)
        .bind(&event.value)
        .bind(sqlx::types::Json(&event.headers))
        .bind(OutboxStatus::Pending.to_string())
        .bind(0_i32)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Claims a batch of eligible events for dispatch.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent dispatchers claim
    /// disjoint sets without blocking each other. A row is eligible when it
    /// is pending or failed with `next_attempt_at` due, or when it is
    /// in-flight but its claim has gone stale (`updated_at` older than
    /// `stale_timeout`), which recovers work lost to a crashed dispatcher.
    ///
    /// Claimed rows transition to in-flight with a refreshed `updated_at`
    /// and are returned oldest first. The returned `attempts` counts are the
    /// pre-claim values. An empty result means nothing was due.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_batch(
        &self,
        limit: usize,
        stale_timeout: Duration,
    ) -> Result<Vec<ClaimedEvent>> {
        let now = Utc::now();
        let stale_before = now
            .checked_sub_signed(chrono_duration(stale_timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        // Transaction keeps the select and the status flip atomic.
        let mut tx = self.pool.begin().await?;

        let event_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM outbox_events
            WHERE ((status = 'pending' OR status = 'failed') AND next_attempt_at <= $1)
               OR (status = 'in_flight' AND updated_at < $2)
            ORDER BY created_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(limit as i32)
        .fetch_all(&mut *tx)
        .await?;

        if event_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, ClaimedEvent>(
            r#"
            UPDATE outbox_events
            SET status = 'in_flight', updated_at = $2
            WHERE id = ANY($1)
            RETURNING id, topic, key, value, headers, attempts
            "#,
        )
        .bind(&event_ids)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        // RETURNING does not preserve the selected order, restore FIFO.
        let mut by_id: HashMap<Uuid, ClaimedEvent> =
            rows.into_iter().map(|event| (event.id.0, event)).collect();
        let events = event_ids.iter().filter_map(|id| by_id.remove(id)).collect();

        Ok(events)
    }

    /// Marks an event as successfully dispatched.
    ///
    /// Sets the terminal status, records the dispatch timestamp, and clears
    /// any error left over from earlier failed cycles.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_dispatched(&self, event_id: EventId) -> Result<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'dispatched',
                dispatched_at = $2,
                last_error = NULL,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(event_id.0)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records a failed dispatch cycle and schedules the retry.
    ///
    /// Stores the new attempts count, the error text, and a
    /// `next_attempt_at` of now plus `backoff`. The row stays claimable
    /// forever; there is no terminal failure state.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(
        &self,
        event_id: EventId,
        attempts: i32,
        backoff: Duration,
        error: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let next_attempt_at = now
            .checked_add_signed(chrono_duration(backoff))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'failed',
                attempts = $2,
                next_attempt_at = $3,
                last_error = $4,
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(event_id.0)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Finds an event by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, event_id: EventId) -> Result<Option<OutboxEvent>> {
        let event = sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, topic, key, value, headers, status, attempts,
                   created_at, updated_at, dispatched_at, next_attempt_at, last_error
            FROM outbox_events
            WHERE id = $1
            "#,
        )
        .bind(event_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    /// Counts events by status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self, status: OutboxStatus) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM outbox_events
            WHERE status = $1
            "#,
        )
        .bind(status.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }
}

/// Creates the outbox table and its indexes if they do not exist.
///
/// Safe to run on every boot. Partial indexes cover the two claim
/// predicates so eligibility scans stay cheap as dispatched rows accumulate.
///
/// # Errors
///
/// Returns error if any DDL statement fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outbox_events (
            id UUID PRIMARY KEY,
            topic TEXT NOT NULL,
            key TEXT NOT NULL,
            value BYTEA NOT NULL,
            headers JSONB NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            dispatched_at TIMESTAMPTZ,
            next_attempt_at TIMESTAMPTZ NOT NULL,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_outbox_events_eligible
        ON outbox_events(next_attempt_at, created_at)
        WHERE status IN ('pending', 'failed')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_outbox_events_stale
        ON outbox_events(updated_at)
        WHERE status = 'in_flight'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
