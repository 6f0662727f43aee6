//! Core domain types and PostgreSQL storage for the bote outbox relay.
//!
//! Provides the strongly-typed event model, the closed status enum, the
//! clock abstraction for deterministic time control, and the outbox
//! repository the dispatcher and producers build on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{ClaimedEvent, EventId, NewEvent, OutboxEvent, OutboxStatus};
pub use storage::{ensure_schema, OutboxRepository};
pub use time::{Clock, RealClock, TestClock};
