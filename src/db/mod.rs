//! Durable local snapshot.
//!
//! Stores exactly what is needed to resume after restart:
//! - Available balance
//! - Replicated trades, newest first
//!
//! The live feed is never persisted; a restart re-derives it from the source.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::debug;

use crate::models::ReplicatedTrade;

const KEY_AVAILABLE_BALANCE: &str = "available_balance";
const KEY_REPLICATED_TRADES: &str = "replicated_trades";

/// Database connection pool for the snapshot store.
pub struct Database {
    pool: SqlitePool,
}

/// Persisted session state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub available_balance: Decimal,
    pub replicated_trades: Vec<ReplicatedTrade>,
}

/// Stored key/value row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct SnapshotRow {
    key: String,
    value: String,
    updated_at: String,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to `sqlite::memory:` opens its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshot (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write both snapshot keys in one transaction.
    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let trades = serde_json::to_string(&snapshot.replicated_trades)
            .context("Failed to serialize replicated trades")?;

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for (key, value) in [
            (KEY_AVAILABLE_BALANCE, snapshot.available_balance.to_string()),
            (KEY_REPLICATED_TRADES, trades),
        ] {
            sqlx::query(
                r#"
                INSERT INTO snapshot (key, value, updated_at)
                VALUES (?, ?, datetime('now'))
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = datetime('now')
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Failed to commit snapshot")?;

        debug!(
            available = %snapshot.available_balance,
            replicated = snapshot.replicated_trades.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    /// Load the last snapshot, if one was ever saved.
    pub async fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        let rows = sqlx::query_as::<_, SnapshotRow>("SELECT key, value, updated_at FROM snapshot")
            .fetch_all(&self.pool)
            .await?;

        let mut balance = None;
        let mut trades = None;
        for row in rows {
            match row.key.as_str() {
                KEY_AVAILABLE_BALANCE => {
                    balance = Some(
                        Decimal::from_str(&row.value)
                            .with_context(|| format!("Invalid stored balance: {}", row.value))?,
                    );
                }
                KEY_REPLICATED_TRADES => {
                    trades = Some(
                        serde_json::from_str::<Vec<ReplicatedTrade>>(&row.value)
                            .context("Invalid stored replicated trades")?,
                    );
                }
                other => debug!(key = %other, "Ignoring unknown snapshot key"),
            }
        }

        Ok(balance.map(|available_balance| Snapshot {
            available_balance,
            replicated_trades: trades.unwrap_or_default(),
        }))
    }

    /// When the snapshot was last written.
    pub async fn last_saved_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT key, value, updated_at FROM snapshot WHERE key = ?",
        )
        .bind(KEY_AVAILABLE_BALANCE)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| {
            chrono::NaiveDateTime::parse_from_str(&r.updated_at, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc())
        }))
    }
}
