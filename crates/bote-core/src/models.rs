//! Core domain models and strongly-typed identifiers.
//!
//! Defines outbox events, the status state machine, and newtype ID wrappers
//! for compile-time type safety. Includes database serialization traits for
//! the PostgreSQL-backed outbox table.

use std::{collections::HashMap, fmt};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed outbox event identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. The ID is generated
/// at enqueue time and follows the event through its entire lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    ///
    /// Uses UUID v4 for globally unique identifiers without coordination.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Outbox event lifecycle status.
///
/// Events progress through these states during dispatch. State transitions
/// are strictly controlled to preserve at-least-once delivery:
///
/// ```text
/// Pending -> InFlight -> Dispatched
///                     -> Failed -> InFlight (reclaimed after backoff)
/// ```
///
/// An `InFlight` row whose claim has gone stale is also reclaimable, which
/// is how crashed dispatchers release their work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Enqueued and waiting for a dispatcher.
    ///
    /// The event is eligible for claiming once `next_attempt_at` has passed,
    /// which is immediately for freshly enqueued rows.
    Pending,

    /// Claimed by a dispatcher that is attempting to publish.
    ///
    /// Other dispatchers skip these rows until the claim goes stale.
    InFlight,

    /// Successfully published to the bus.
    ///
    /// Terminal state. The row is retained for audit and is never
    /// re-dispatched.
    Dispatched,

    /// Publish attempts exhausted for this dispatch cycle.
    ///
    /// Not terminal: the row becomes eligible again once `next_attempt_at`
    /// has passed, and retries indefinitely.
    Failed,
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InFlight => write!(f, "in_flight"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for OutboxStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for OutboxStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "dispatched" => Ok(Self::Dispatched),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid outbox status: {s}").into()),
        }
    }
}

/// Full outbox event row.
///
/// Written inside the producer's transaction and mutated only by the
/// dispatcher afterwards. `attempts` counts completed dispatch cycles, not
/// individual publish calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEvent {
    /// Unique identifier for this event.
    pub id: EventId,

    /// Logical destination on the bus.
    pub topic: String,

    /// Partitioning key for the message.
    pub key: String,

    /// Raw message payload.
    ///
    /// Stored as `Vec<u8>` for database compatibility, converted to Bytes
    /// for zero-copy operations.
    pub value: Vec<u8>,

    /// Message headers forwarded to the bus.
    pub headers: sqlx::types::Json<HashMap<String, String>>,

    /// Current lifecycle status.
    pub status: OutboxStatus,

    /// Number of failed dispatch cycles so far.
    ///
    /// Incremented when a cycle exhausts its inline publish retries. Drives
    /// the exponential backoff window.
    pub attempts: i32,

    /// When the event was enqueued.
    pub created_at: DateTime<Utc>,

    /// When the row last changed state.
    ///
    /// Refreshed on every transition, including the claim itself. Staleness
    /// detection compares against this column.
    pub updated_at: DateTime<Utc>,

    /// When successfully published (terminal state).
    pub dispatched_at: Option<DateTime<Utc>>,

    /// Earliest time the event is eligible for (re-)dispatch.
    pub next_attempt_at: DateTime<Utc>,

    /// Most recent publish error, cleared on success.
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// Headers as a regular HashMap for easy access.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers.0
    }

    /// Payload as Bytes for zero-copy operations.
    pub fn value_bytes(&self) -> Bytes {
        Bytes::from(self.value.clone())
    }
}

/// Projection of an outbox row returned by a claim.
///
/// Carries exactly what the dispatcher needs to publish: the message fields
/// plus the attempts count as it stood before the claim. The claim itself
/// does not increment `attempts`; the dispatcher adds one when it records a
/// failed cycle.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedEvent {
    /// Unique identifier for this event.
    pub id: EventId,

    /// Logical destination on the bus.
    pub topic: String,

    /// Partitioning key for the message.
    pub key: String,

    /// Raw message payload.
    pub value: Vec<u8>,

    /// Message headers forwarded to the bus.
    pub headers: sqlx::types::Json<HashMap<String, String>>,

    /// Dispatch cycles completed before this claim.
    pub attempts: i32,
}

impl ClaimedEvent {
    /// Headers as a regular HashMap for easy access.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers.0
    }

    /// Payload as Bytes for zero-copy operations.
    pub fn value_bytes(&self) -> Bytes {
        Bytes::from(self.value.clone())
    }
}

/// Message to enqueue into the outbox.
///
/// The ID is generated up front so callers can correlate the enqueued row
/// with downstream logs without a round trip.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Identifier assigned to the row on insert.
    pub id: EventId,

    /// Logical destination on the bus.
    pub topic: String,

    /// Partitioning key for the message.
    pub key: String,

    /// Raw message payload.
    pub value: Vec<u8>,

    /// Message headers forwarded to the bus.
    pub headers: HashMap<String, String>,
}

impl NewEvent {
    /// Creates a new event for the given topic, key, and payload.
    pub fn new(
        topic: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: EventId::new(),
            topic: topic.into(),
            key: key.into(),
            value: value.into(),
            headers: HashMap::new(),
        }
    }

    /// Adds a header to the message.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}
