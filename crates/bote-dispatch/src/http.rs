//! HTTP event bus client.
//!
//! Publishes outbox messages to an HTTP ingest API, one POST per message.
//! Handles request construction, response checking, and error mapping so the
//! dispatcher sees every transport problem as a `DispatchError`.

use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    bus::{EventBus, OutboundMessage},
    error::{DispatchError, Result},
};

/// Header carrying the message's partitioning key.
pub const KEY_HEADER: &str = "x-bote-key";

/// Cap on response bodies stored in rejection errors, so `last_error`
/// columns stay small.
const MAX_ERROR_BODY_BYTES: usize = 1024;

/// Configuration for the HTTP bus client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBusConfig {
    /// Base URL of the bus ingest API.
    pub base_url: String,
    /// Timeout for publish requests.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl HttpBusConfig {
    /// Creates a configuration for the given base URL with default settings.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            user_agent: "bote/0.1".to_string(),
        }
    }
}

/// HTTP implementation of the event bus.
///
/// Publishes each message as `POST {base_url}/topics/{topic}` with the raw
/// payload as the request body. The partitioning key travels in the
/// [`KEY_HEADER`] header and producer headers are forwarded as HTTP headers.
/// Any non-2xx response counts as a rejected publish.
#[derive(Debug, Clone)]
pub struct HttpBus {
    client: reqwest::Client,
    config: HttpBusConfig,
}

impl HttpBus {
    /// Creates a new HTTP bus client.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` if the HTTP client cannot be
    /// built with the provided settings.
    pub fn new(config: HttpBusConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DispatchError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    fn topic_url(&self, topic: &str) -> String {
        format!("{}/topics/{}", self.config.base_url.trim_end_matches('/'), topic)
    }

    async fn publish_message(&self, message: OutboundMessage) -> Result<()> {
        let span = info_span!("bus_publish", topic = %message.topic, key = %message.key);

        async move {
            let start_time = std::time::Instant::now();
            let url = self.topic_url(&message.topic);

            let mut request =
                self.client.post(&url).header(KEY_HEADER, &message.key).body(message.value.clone());

            for (name, value) in &message.headers {
                request = request.header(name, value);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        duration_ms = start_time.elapsed().as_millis(),
                        "publish request failed: {e}"
                    );

                    if e.is_timeout() {
                        return Err(DispatchError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DispatchError::network(format!("connection failed: {e}")));
                    }
                    if e.is_builder() {
                        return Err(DispatchError::serialization(format!(
                            "invalid message headers: {e}"
                        )));
                    }
                    return Err(DispatchError::network(e.to_string()));
                },
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(DispatchError::rejected(status.as_u16(), truncate_body(&body)));
            }

            tracing::debug!(
                status = status.as_u16(),
                duration_ms = start_time.elapsed().as_millis(),
                "message published"
            );

            Ok(())
        }
        .instrument(span)
        .await
    }
}

impl EventBus for HttpBus {
    fn connect(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let url = Url::parse(&self.config.base_url)
                .map_err(|e| DispatchError::configuration(format!("invalid bus URL: {e}")))?;

            tracing::info!(bus_url = %url, "http bus ready");
            Ok(())
        })
    }

    fn publish(
        &self,
        message: OutboundMessage,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.publish_message(message))
    }

    fn close(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            tracing::debug!("http bus closed");
            Ok(())
        })
    }
}

/// Truncates a response body for storage in error text.
fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_BYTES {
        let mut end = MAX_ERROR_BODY_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}
