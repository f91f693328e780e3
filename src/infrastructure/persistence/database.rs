use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Singleton SQLite connection pool plus schema bootstrap.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// Initialize database schema. Every table carries the idempotency key its persistence
    /// operation relies on for safe replay.
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decision_cycles (
                id TEXT PRIMARY KEY,
                trader_id TEXT NOT NULL,
                cycle_number INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                prompt_digest TEXT NOT NULL,
                cot_trace TEXT NOT NULL,
                decisions_json TEXT NOT NULL,
                success BOOLEAN NOT NULL,
                error_message TEXT
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create decision_cycles table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_decision_cycles_trader_cycle
            ON decision_cycles (trader_id, cycle_number);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create decision_cycles index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_events (
                trader_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                close_time_nanos INTEGER NOT NULL,
                kind TEXT NOT NULL,
                decision_json TEXT NOT NULL,
                fill_price TEXT NOT NULL,
                fill_size TEXT NOT NULL,
                raw_response TEXT NOT NULL,
                occurred_at INTEGER NOT NULL,
                PRIMARY KEY (trader_id, symbol, close_time_nanos)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create position_events table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS open_positions (
                trader_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                kind TEXT NOT NULL,
                decision_json TEXT NOT NULL,
                fill_price TEXT NOT NULL,
                fill_size TEXT NOT NULL,
                raw_response TEXT NOT NULL,
                occurred_at INTEGER NOT NULL,
                PRIMARY KEY (trader_id, symbol)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create open_positions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trader_id TEXT NOT NULL,
                account_json TEXT NOT NULL,
                taken_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_account_snapshots_trader_time
            ON account_snapshots (trader_id, taken_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create account_snapshots table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analytics_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trader_id TEXT NOT NULL,
                realized_pnl_usd TEXT NOT NULL,
                cycles_run INTEGER NOT NULL,
                decisions_accepted INTEGER NOT NULL,
                decisions_rejected INTEGER NOT NULL,
                taken_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create analytics_snapshots table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                ts INTEGER NOT NULL,
                trader_id TEXT NOT NULL,
                content TEXT NOT NULL,
                model TEXT NOT NULL,
                tokens INTEGER,
                PRIMARY KEY (conversation_id, role, ts)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create conversations table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
