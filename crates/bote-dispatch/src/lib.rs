//! Outbox dispatcher with at-least-once delivery guarantees.
//!
//! This crate implements the relay half of the transactional outbox pattern:
//! a background dispatcher claims committed events from PostgreSQL and
//! publishes them to an event bus with inline retries, persisted exponential
//! backoff, and stale-claim recovery.
//!
//! # Architecture
//!
//! The dispatcher runs a single polling loop that claims batches of eligible
//! events using `FOR UPDATE SKIP LOCKED`, so several dispatcher processes can
//! share one outbox table without coordinating. Each tick handles the full
//! cycle:
//!
//! 1. **Claim** - atomically flip due rows to in-flight
//! 2. **Publish** - send each message to the bus, retrying inline
//! 3. **Record** - mark the row dispatched, or failed with a backoff window
//!
//! Rows that stay in-flight past the stale timeout are reclaimed on a later
//! tick, which is how work survives a dispatcher crash. Delivery is
//! at-least-once: a crash between publish and record produces a duplicate,
//! never a loss.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bote_core::OutboxRepository;
//! use bote_dispatch::{
//!     Dispatcher, DispatcherConfig, HttpBus, HttpBusConfig, PostgresOutboxStore,
//! };
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), bote_dispatch::DispatchError> {
//! let store = Arc::new(PostgresOutboxStore::new(OutboxRepository::new(pool)));
//! let bus = Arc::new(HttpBus::new(HttpBusConfig::new("http://localhost:9010"))?);
//!
//! let mut dispatcher = Dispatcher::new(store, bus, DispatcherConfig::default());
//! dispatcher.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod storage;

// Re-export main public API
pub use backoff::BackoffPolicy;
pub use bus::{EventBus, OutboundMessage};
pub use config::DispatcherConfig;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Result};
pub use http::{HttpBus, HttpBusConfig};
pub use storage::{OutboxStore, PostgresOutboxStore};

/// Default interval between polls when the outbox is drained, in
/// milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default batch size for claiming events from the outbox.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default number of inline publish attempts per dispatch cycle.
pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;

/// Default delay unit between inline publish attempts, in milliseconds.
pub const DEFAULT_PUBLISH_RETRY_DELAY_MS: u64 = 50;

/// Default age after which an in-flight claim counts as stale, in seconds.
pub const DEFAULT_STALE_TIMEOUT_SECS: u64 = 30;

/// Default maximum time to wait for the loop to stop on shutdown, in
/// seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
