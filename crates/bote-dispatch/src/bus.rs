//! Event bus abstraction for publishing outbox messages.
//!
//! Provides a trait-based seam between the dispatcher and the transport so
//! delivery logic can be tested against an in-memory bus. Production uses
//! the HTTP client in [`crate::http`]; tests use [`mock::MockBus`] with
//! scripted failures.

use std::{collections::HashMap, future::Future, pin::Pin};

use bote_core::ClaimedEvent;
use bytes::Bytes;

use crate::error::Result;

/// Header name carrying the payload content type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Content type stamped on messages whose producer did not set one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Message handed to the bus for publishing.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Logical destination on the bus.
    pub topic: String,

    /// Partitioning key for the message.
    pub key: String,

    /// Raw message payload.
    pub value: Bytes,

    /// Message headers, always including a content type.
    pub headers: HashMap<String, String>,
}

impl OutboundMessage {
    /// Builds the outbound message for a claimed outbox event.
    ///
    /// Producer headers pass through unchanged. If none of them names a
    /// content type (compared case-insensitively), the default marker is
    /// added so consumers always know how to read the payload.
    pub fn from_claimed(event: &ClaimedEvent) -> Self {
        let mut headers = event.headers().clone();

        let has_content_type =
            headers.keys().any(|name| name.eq_ignore_ascii_case(CONTENT_TYPE_HEADER));
        if !has_content_type {
            headers.insert(CONTENT_TYPE_HEADER.to_string(), DEFAULT_CONTENT_TYPE.to_string());
        }

        Self {
            topic: event.topic.clone(),
            key: event.key.clone(),
            value: event.value_bytes(),
            headers,
        }
    }
}

/// Bus operations required by the dispatcher.
///
/// This trait abstracts the transport the outbox relays into, enabling both
/// the production HTTP client and lightweight test doubles. Publish failures
/// are all treated alike by the dispatcher, so implementations only need to
/// report what went wrong, not whether to retry.
pub trait EventBus: Send + Sync + 'static {
    /// Establishes the connection to the bus.
    ///
    /// Called once before the dispatch loop starts. Implementations should
    /// fail fast here on unusable configuration.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Publishes a single message to its topic.
    ///
    /// Must not return until the bus has acknowledged the message; the
    /// dispatcher marks the event dispatched as soon as this succeeds.
    fn publish(
        &self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Flushes buffered messages and releases bus resources.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

pub mod mock {
    //! Mock bus implementation for testing.
    //!
    //! Records published messages in-memory and supports scripting a run of
    //! publish failures to exercise the dispatcher's retry handling.

    use std::{
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc,
        },
    };

    use tokio::sync::RwLock;

    use super::{EventBus, OutboundMessage};
    use crate::error::{DispatchError, Result};

    /// Mock bus for testing dispatch logic without a transport.
    ///
    /// Publishes append to an in-memory log. `fail_times` scripts the next
    /// n publish calls to fail with a network error, after which publishing
    /// succeeds again.
    pub struct MockBus {
        published: Arc<RwLock<Vec<OutboundMessage>>>,
        publish_calls: Arc<AtomicU32>,
        failures_remaining: Arc<AtomicU32>,
        connected: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    }

    impl MockBus {
        /// Creates a new mock bus with no scripted failures.
        pub fn new() -> Self {
            Self {
                published: Arc::new(RwLock::new(Vec::new())),
                publish_calls: Arc::new(AtomicU32::new(0)),
                failures_remaining: Arc::new(AtomicU32::new(0)),
                connected: Arc::new(AtomicBool::new(false)),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Scripts the next `count` publish calls to fail.
        pub fn fail_times(&self, count: u32) {
            self.failures_remaining.store(count, Ordering::Release);
        }

        /// Returns all successfully published messages.
        pub async fn published(&self) -> Vec<OutboundMessage> {
            self.published.read().await.clone()
        }

        /// Returns the total number of publish calls, including failures.
        pub fn publish_calls(&self) -> u32 {
            self.publish_calls.load(Ordering::Acquire)
        }

        /// Reports whether `connect` has been called.
        pub fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Acquire)
        }

        /// Reports whether `close` has been called.
        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    impl Default for MockBus {
        fn default() -> Self {
            Self::new()
        }
    }

    impl EventBus for MockBus {
        fn connect(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let connected = self.connected.clone();
            Box::pin(async move {
                connected.store(true, Ordering::Release);
                Ok(())
            })
        }

        fn publish(
            &self,
            message: OutboundMessage,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let published = self.published.clone();
            let publish_calls = self.publish_calls.clone();
            let failures_remaining = self.failures_remaining.clone();

            Box::pin(async move {
                publish_calls.fetch_add(1, Ordering::AcqRel);

                // Consume one scripted failure if any remain.
                let should_fail = failures_remaining
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                    .is_ok();
                if should_fail {
                    return Err(DispatchError::network("simulated publish failure"));
                }

                published.write().await.push(message);
                Ok(())
            })
        }

        fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let closed = self.closed.clone();
            Box::pin(async move {
                closed.store(true, Ordering::Release);
                Ok(())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bote_core::{ClaimedEvent, EventId};

    use super::{mock::MockBus, *};

    fn claimed_event(headers: HashMap<String, String>) -> ClaimedEvent {
        ClaimedEvent {
            id: EventId::new(),
            topic: "orders".to_string(),
            key: "order-1".to_string(),
            value: b"payload".to_vec(),
            headers: sqlx::types::Json(headers),
            attempts: 0,
        }
    }

    #[test]
    fn missing_content_type_gets_default() {
        let event = claimed_event(HashMap::new());
        let message = OutboundMessage::from_claimed(&event);

        assert_eq!(
            message.headers.get(CONTENT_TYPE_HEADER).map(String::as_str),
            Some(DEFAULT_CONTENT_TYPE)
        );
    }

    #[test]
    fn existing_content_type_preserved_case_insensitively() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        let event = claimed_event(headers);
        let message = OutboundMessage::from_claimed(&event);

        assert_eq!(
            message.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
        assert!(!message.headers.contains_key(CONTENT_TYPE_HEADER));
    }

    #[tokio::test]
    async fn mock_bus_scripted_failures_then_success() {
        let bus = MockBus::new();
        bus.fail_times(2);

        let event = claimed_event(HashMap::new());
        let message = OutboundMessage::from_claimed(&event);

        assert!(bus.publish(message.clone()).await.is_err());
        assert!(bus.publish(message.clone()).await.is_err());
        assert!(bus.publish(message).await.is_ok());

        assert_eq!(bus.publish_calls(), 3);
        assert_eq!(bus.published().await.len(), 1);
    }
}
