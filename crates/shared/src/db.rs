//! Database utilities and connection management

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{str::FromStr, time::Duration};

/// Default pool size when the caller does not configure one
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

fn connect_options(database_url: &str) -> Result<PgConnectOptions, sqlx::Error> {
    // Prepared statements break behind a transaction-mode pooler.
    Ok(PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0))
}

/// Pool shared by request handlers and sweeps
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(300))
        .connect_with(connect_options(database_url)?)
        .await
}

/// Single-connection pool with a generous acquire timeout, used once at startup
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(120))
        .connect_with(connect_options(database_url)?)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

/// PostgreSQL error code for unique constraint violations
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// Returns true when the error is a unique constraint violation, optionally
/// restricted to a specific constraint/index name.
pub fn is_unique_violation(err: &sqlx::Error, constraint: Option<&str>) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let code_matches = db_err
                .code()
                .map(|code| code == PG_UNIQUE_VIOLATION)
                .unwrap_or(false);
            match constraint {
                Some(name) => code_matches && db_err.constraint() == Some(name),
                None => code_matches,
            }
        }
        _ => false,
    }
}
