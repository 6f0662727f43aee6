//! Bote outbox relay service.
//!
//! Main entry point for the Bote daemon. Connects to PostgreSQL and the
//! event bus, then runs the dispatcher loop until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bote_core::{ensure_schema, OutboxRepository};
use bote_dispatch::{
    BackoffPolicy, Dispatcher, DispatcherConfig, HttpBus, HttpBusConfig, PostgresOutboxStore,
};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with structured logging
    init_tracing();

    info!("Starting Bote outbox relay service");

    // Load configuration from environment
    let config = Config::from_env()?;
    info!(
        database_url = %config.database_url_masked(),
        bus_url = %config.bus_url,
        max_connections = config.database_max_connections,
        poll_interval_ms = config.dispatcher.poll_interval.as_millis() as u64,
        batch_size = config.dispatcher.batch_size,
        "Configuration loaded"
    );

    // Create database connection pool
    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    // Ensure outbox schema exists
    ensure_schema(&db_pool).await.context("Failed to ensure outbox schema")?;
    info!("Outbox schema ready");

    // Wire storage and bus into the dispatcher
    let store = Arc::new(PostgresOutboxStore::new(OutboxRepository::new(db_pool.clone())));

    let mut bus_config = HttpBusConfig::new(&config.bus_url);
    bus_config.timeout = config.bus_timeout;
    let bus = Arc::new(HttpBus::new(bus_config).context("Failed to build event bus client")?);

    let mut dispatcher = Dispatcher::new(store, bus, config.dispatcher);
    dispatcher.start().await.context("Failed to start dispatcher")?;

    info!("Bote is relaying outbox events");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    dispatcher.shutdown().await.context("Dispatcher shutdown failed")?;

    // Close database connections
    db_pool.close().await;
    info!("Database connections closed");

    info!("Bote shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,bote=debug"))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                // Verify connection works
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Service configuration.
struct Config {
    /// PostgreSQL connection string
    database_url: String,
    /// Maximum database connections
    database_max_connections: u32,
    /// Base URL of the event bus ingest API
    bus_url: String,
    /// Timeout for publish requests
    bus_timeout: Duration,
    /// Dispatcher loop settings
    dispatcher: DispatcherConfig,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// `DATABASE_URL` and `BUS_URL` are required. Every dispatcher knob has
    /// a `BOTE_`-prefixed override; unset or unparsable values fall back to
    /// the built-in defaults.
    fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let database_max_connections = env_value("DATABASE_MAX_CONNECTIONS", 10);

        let bus_url =
            std::env::var("BUS_URL").context("BUS_URL environment variable not set")?;

        let bus_timeout = env_duration_ms("BUS_TIMEOUT_MS", Duration::from_secs(30));

        let defaults = DispatcherConfig::default();
        let dispatcher = DispatcherConfig {
            poll_interval: env_duration_ms("BOTE_POLL_INTERVAL_MS", defaults.poll_interval),
            batch_size: env_value("BOTE_BATCH_SIZE", defaults.batch_size),
            publish_attempts: env_value("BOTE_PUBLISH_ATTEMPTS", defaults.publish_attempts),
            publish_retry_delay: env_duration_ms(
                "BOTE_PUBLISH_RETRY_DELAY_MS",
                defaults.publish_retry_delay,
            ),
            stale_timeout: env_duration_ms("BOTE_STALE_TIMEOUT_MS", defaults.stale_timeout),
            backoff: BackoffPolicy {
                base_delay: env_duration_ms("BOTE_BACKOFF_BASE_MS", defaults.backoff.base_delay),
                max_delay: env_duration_ms("BOTE_BACKOFF_MAX_MS", defaults.backoff.max_delay),
                exponent_cap: env_value(
                    "BOTE_BACKOFF_EXPONENT_CAP",
                    defaults.backoff.exponent_cap,
                ),
            },
            shutdown_timeout: env_duration_ms(
                "BOTE_SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout,
            ),
        };

        Ok(Self { database_url, database_max_connections, bus_url, bus_timeout, dispatcher })
    }

    /// Returns database URL with credentials masked for logging.
    fn database_url_masked(&self) -> String {
        match (self.database_url.find("://"), self.database_url.find('@')) {
            (Some(scheme_end), Some(at_pos)) if scheme_end + 3 < at_pos => {
                let userinfo = &self.database_url[scheme_end + 3..at_pos];
                let user = userinfo.split(':').next().unwrap_or(userinfo);
                format!(
                    "{}://{}:***@{}",
                    &self.database_url[..scheme_end],
                    user,
                    &self.database_url[at_pos + 1..]
                )
            },
            _ => "postgresql://***".to_string(),
        }
    }
}

/// Reads a parsable value from the environment, falling back to a default.
fn env_value<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Reads a millisecond duration from the environment, falling back to a
/// default.
fn env_duration_ms(name: &str, default: Duration) -> Duration {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).map_or(default, Duration::from_millis)
}
