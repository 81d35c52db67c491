//! PostgreSQL provider for the quartermaster resource registry.
//!
//! [`lifecycle`] declares a [`PgPool`] resource: acquisition creates the
//! connection pool and establishes an initial connection, release closes the
//! pool with a bounded grace period. Register it under a key of your choosing
//! and the registry shares one pool between every consumer and closes it
//! exactly once at teardown.
//!
//! ```no_run
//! use quartermaster::{Registry, ResourceKey};
//! use quartermaster_postgres::lifecycle;
//! use sqlx::PgPool;
//!
//! const POOL: ResourceKey<PgPool> = ResourceKey::new("postgres");
//!
//! # tokio_test::block_on(async {
//! let registry = Registry::new();
//! registry.register(POOL, lifecycle("postgres://localhost/app"))?;
//!
//! let pool = registry.provide_one(POOL).await?;
//! sqlx::query("SELECT 1").execute(&*pool).await.unwrap();
//!
//! registry.cleanup().await;
//! # Ok::<_, quartermaster::RegistryError>(())
//! # }).unwrap();
//! ```

use std::time::Duration;

use nutype::nutype;
use quartermaster::{retry_until_ready, AcquireError, Lifecycle, RetryPolicy};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

/// Maximum number of database connections in the pool.
///
/// MaxConnections represents the connection pool size limit. It must be at
/// least 1, enforced by using NonZeroU32 as the underlying type.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Configuration for the PostgreSQL pool lifecycle.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
    /// Grace period for closing the pool at teardown (default: 10 seconds)
    pub close_timeout: Duration,
    /// Retry policy applied while the server reports itself unready
    /// (default: none, a single attempt)
    pub not_ready_retry: Option<RetryPolicy>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
            close_timeout: Duration::from_secs(10),
            not_ready_retry: None,
        }
    }
}

impl PostgresConfig {
    /// Replaces the pool size limit.
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: MaxConnections) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Replaces the pool acquire timeout.
    #[must_use]
    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    /// Replaces the idle connection timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Replaces the grace period granted to the pool at teardown.
    #[must_use]
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Keeps retrying acquisition under `policy` while the server reports
    /// itself unready.
    #[must_use]
    pub fn with_not_ready_retry(mut self, policy: RetryPolicy) -> Self {
        self.not_ready_retry = Some(policy);
        self
    }
}

/// Declares a PostgreSQL pool resource with default configuration.
pub fn lifecycle<S: Into<String>>(connection_string: S) -> Lifecycle<PgPool> {
    lifecycle_with_config(connection_string, PostgresConfig::default())
}

/// Declares a PostgreSQL pool resource with custom configuration.
///
/// Acquisition failures that look like a server still starting up surface as
/// not-ready errors; when `not_ready_retry` is set the attempt is repeated
/// under that policy instead of failing the acquisition outright.
///
/// Release closes the pool and waits up to `close_timeout` for in-flight
/// connections to finish. A close that outlives the grace period is logged
/// and the remaining connections are dropped; teardown itself does not fail
/// because of it.
pub fn lifecycle_with_config<S: Into<String>>(
    connection_string: S,
    config: PostgresConfig,
) -> Lifecycle<PgPool> {
    let connection_string = connection_string.into();
    let close_timeout = config.close_timeout;

    Lifecycle::new(move || {
        let connection_string = connection_string.clone();
        let config = config.clone();
        async move {
            match &config.not_ready_retry {
                Some(policy) => {
                    retry_until_ready(policy, "postgres.connect", || {
                        connect(&connection_string, &config)
                    })
                    .await
                }
                None => connect(&connection_string, &config).await,
            }
        }
    })
    .with_release(move |pool| async move {
        info!("[postgres.close] closing connection pool");
        if tokio::time::timeout(close_timeout, pool.close()).await.is_err() {
            warn!(
                timeout = ?close_timeout,
                "[postgres.close] close timed out, dropping remaining connections"
            );
        }
        Ok(())
    })
}

async fn connect(
    connection_string: &str,
    config: &PostgresConfig,
) -> Result<PgPool, AcquireError> {
    let max_connections: std::num::NonZeroU32 = config.max_connections.into();
    info!(
        max_connections = %config.max_connections,
        "[postgres.connect] creating connection pool"
    );

    PgPoolOptions::new()
        .max_connections(max_connections.get())
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(connection_string)
        .await
        .map_err(|error| {
            if is_server_unready(&error) {
                AcquireError::not_ready(error.to_string())
            } else {
                AcquireError::with_source(error)
            }
        })
}

/// Whether a connection error indicates a server that is not ready yet rather
/// than one that will never accept us.
///
/// Covers refused or dropped sockets, pool acquire timeouts, and the postgres
/// codes for a server still starting up (57P03) or momentarily out of
/// connection slots (53300).
#[must_use]
pub fn is_server_unready(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_error) => {
            matches!(db_error.code().as_deref(), Some("57P03" | "53300"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use quartermaster::{Registry, RegistryError, ResourceKey};

    use super::*;

    const POOL: ResourceKey<PgPool> = ResourceKey::new("postgres");

    // Nothing listens on the discard port, so connecting fails immediately.
    const UNREACHABLE_URL: &str = "postgres://127.0.0.1:9/nope";

    fn database_error(code: &'static str) -> sqlx::Error {
        #[derive(Debug)]
        struct Fake {
            code: &'static str,
        }

        impl std::fmt::Display for Fake {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "fake database error ({})", self.code)
            }
        }

        impl std::error::Error for Fake {}

        impl sqlx::error::DatabaseError for Fake {
            fn message(&self) -> &str {
                "fake database error"
            }

            fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
                Some(std::borrow::Cow::Borrowed(self.code))
            }

            fn kind(&self) -> sqlx::error::ErrorKind {
                sqlx::error::ErrorKind::Other
            }

            fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
                self
            }

            fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
                self
            }

            fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
                self
            }
        }

        sqlx::Error::Database(Box::new(Fake { code }))
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = PostgresConfig::default();
        let max_connections: NonZeroU32 = config.max_connections.into();

        assert_eq!(max_connections.get(), 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.close_timeout, Duration::from_secs(10));
        assert!(config.not_ready_retry.is_none());
    }

    #[test]
    fn builders_replace_their_fields() {
        let config = PostgresConfig::default()
            .with_max_connections(MaxConnections::new(NonZeroU32::new(3).unwrap()))
            .with_acquire_timeout(Duration::from_secs(5))
            .with_idle_timeout(Duration::from_secs(60))
            .with_close_timeout(Duration::from_secs(1))
            .with_not_ready_retry(RetryPolicy::every(Duration::from_millis(10)));

        let max_connections: NonZeroU32 = config.max_connections.into();
        assert_eq!(max_connections.get(), 3);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.close_timeout, Duration::from_secs(1));
        assert_eq!(
            config.not_ready_retry,
            Some(RetryPolicy::every(Duration::from_millis(10)))
        );
    }

    #[test]
    fn io_errors_and_pool_timeouts_read_as_unready() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));

        assert!(is_server_unready(&io));
        assert!(is_server_unready(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn startup_and_slot_exhaustion_codes_read_as_unready() {
        assert!(is_server_unready(&database_error("57P03")));
        assert!(is_server_unready(&database_error("53300")));
    }

    #[test]
    fn other_errors_read_as_terminal() {
        assert!(!is_server_unready(&database_error("28P01"))); // invalid password
        assert!(!is_server_unready(&sqlx::Error::PoolClosed));
        assert!(!is_server_unready(&sqlx::Error::RowNotFound));
        assert!(!is_server_unready(&sqlx::Error::Protocol("garbled".into())));
    }

    #[test]
    fn pool_lifecycle_declares_a_release() {
        assert!(lifecycle("postgres://localhost/app").has_release());
    }

    #[tokio::test]
    async fn a_refused_connection_surfaces_as_not_ready() {
        let config = PostgresConfig::default().with_acquire_timeout(Duration::from_millis(200));
        let registry = Registry::new();
        registry
            .register(POOL, lifecycle_with_config(UNREACHABLE_URL, config))
            .unwrap();

        let error = registry.provide_one(POOL).await.unwrap_err();
        match error {
            RegistryError::Acquisition { source, .. } => assert!(source.is_not_ready()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn a_bounded_retry_policy_still_reports_not_ready() {
        let config = PostgresConfig::default()
            .with_acquire_timeout(Duration::from_millis(200))
            .with_not_ready_retry(
                RetryPolicy::every(Duration::from_millis(1)).with_max_attempts(2),
            );
        let registry = Registry::new();
        registry
            .register(POOL, lifecycle_with_config(UNREACHABLE_URL, config))
            .unwrap();

        let error = registry.provide_one(POOL).await.unwrap_err();
        match error {
            RegistryError::Acquisition { source, .. } => assert!(source.is_not_ready()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
