//! Dispatcher configuration.

use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// Configuration for the outbox dispatcher.
///
/// Defaults match the documented dispatch behavior: one second polls,
/// batches of fifty, three inline publish attempts, and a thirty second
/// stale-claim window.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often the loop polls when the outbox is drained.
    pub poll_interval: Duration,

    /// Maximum events to claim per tick.
    pub batch_size: usize,

    /// Inline publish attempts per event within a single dispatch cycle.
    pub publish_attempts: u32,

    /// Delay unit between inline publish attempts.
    ///
    /// The actual pause grows linearly: this unit times the attempt number
    /// just completed.
    pub publish_retry_delay: Duration,

    /// Age after which another dispatcher may reclaim an in-flight row.
    pub stale_timeout: Duration,

    /// Backoff policy for events whose cycle exhausted its inline attempts.
    pub backoff: BackoffPolicy,

    /// Maximum time to wait for the loop to finish its tick on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(crate::DEFAULT_POLL_INTERVAL_MS),
            batch_size: crate::DEFAULT_BATCH_SIZE,
            publish_attempts: crate::DEFAULT_PUBLISH_ATTEMPTS,
            publish_retry_delay: Duration::from_millis(crate::DEFAULT_PUBLISH_RETRY_DELAY_MS),
            stale_timeout: Duration::from_secs(crate::DEFAULT_STALE_TIMEOUT_SECS),
            backoff: BackoffPolicy::default(),
            shutdown_timeout: Duration::from_secs(crate::DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DispatcherConfig::default();

        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.publish_attempts, 3);
        assert_eq!(config.publish_retry_delay, Duration::from_millis(50));
        assert_eq!(config.stale_timeout, Duration::from_secs(30));
    }
}
