//! Persistence layer.
//!
//! SQLite via sqlx with async connection pooling. The store owns all durable
//! engine state: the asset catalog and the per-asset cycle history. Decimals
//! are stored as TEXT at full precision and parsed back into `Decimal` at
//! the record boundary; comparisons and arithmetic never happen in SQL.
//!
//! A partial unique index guarantees at most one non-terminal cycle per
//! asset, which makes the rollover and bootstrap paths safe under
//! concurrent writers.

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    MigrationError(String),

    #[error("query error: {0}")]
    QueryError(String),

    #[error("corrupt row: {0}")]
    DecodeError(String),

    /// A post-condition the schema should have prevented, e.g. two active
    /// cycles for one asset.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Initialize the database connection pool and run migrations.
///
/// # Arguments
/// - `database_url`: SQLite DSN (e.g. "sqlite://data/ladder.db")
/// - `max_connections`: pool bound; keep at least the number of active assets
pub async fn init_database(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    // Ensure the data directory exists for file-backed databases
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .log_statements(tracing::log::LevelFilter::Debug);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dca_assets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1,
            base_order_amount TEXT NOT NULL,
            safety_order_amount TEXT NOT NULL,
            max_safety_orders INTEGER NOT NULL DEFAULT 0,
            safety_order_deviation_percent TEXT NOT NULL,
            take_profit_percent TEXT NOT NULL,
            ttp_enabled INTEGER NOT NULL DEFAULT 0,
            ttp_deviation_percent TEXT,
            cooldown_period_seconds INTEGER NOT NULL DEFAULT 0,
            buy_order_price_deviation_percent TEXT NOT NULL,
            last_sell_price TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create dca_assets: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dca_cycles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            asset_id INTEGER NOT NULL,
            status TEXT NOT NULL CHECK(status IN
                ('watching', 'buying', 'selling', 'trailing', 'complete', 'error')),
            quantity TEXT NOT NULL,
            average_purchase_price TEXT NOT NULL,
            safety_orders INTEGER NOT NULL DEFAULT 0,
            latest_order_id TEXT,
            latest_order_created_at DATETIME,
            last_order_fill_price TEXT,
            highest_trailing_price TEXT,
            sell_price TEXT,
            completed_at DATETIME,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            FOREIGN KEY (asset_id) REFERENCES dca_assets(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create dca_cycles: {}", e)))?;

    // One non-terminal cycle per asset.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_dca_cycles_one_active
        ON dca_cycles(asset_id) WHERE status NOT IN ('complete', 'error')
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dca_cycles_status ON dca_cycles(status)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dca_cycles_latest_order ON dca_cycles(latest_order_id)",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dca_cycles_completed_at ON dca_cycles(asset_id, completed_at)",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    info!("Database migrations completed");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_init() {
        let pool = init_database("sqlite::memory:", 5).await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let pool = init_database("sqlite::memory:", 5).await.unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('dca_assets', 'dca_cycles')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 2);
    }

    #[tokio::test]
    async fn test_one_active_cycle_index_exists() {
        let pool = init_database("sqlite::memory:", 5).await.unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name='idx_dca_cycles_one_active'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 1);
    }
}
