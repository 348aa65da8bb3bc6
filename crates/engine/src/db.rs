use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use crate::state::DecisionEntry;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One finished watering cycle.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct WateringEvent {
    pub ts_start: i64,
    pub ts_end: i64,
    pub trigger_mode: String,
    pub outcome: String,
    pub liters_used: f64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DecisionRow {
    pub ts: i64,
    pub mode: Option<String>,
    pub started: bool,
    pub reason: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation/engine.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to ":memory:" is its own database, so keep exactly
        // one and never let it expire.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Watering events
    // ----------------------------

    pub async fn insert_watering_event(&self, e: &WateringEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watering_events (ts_start, ts_end, trigger_mode, outcome, liters_used)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(e.ts_start)
        .bind(e.ts_end)
        .bind(&e.trigger_mode)
        .bind(&e.outcome)
        .bind(e.liters_used)
        .execute(&self.pool)
        .await
        .context("insert_watering_event failed")?;
        Ok(())
    }

    /// Most recent cycles first.
    pub async fn recent_watering_events(&self, limit: i64) -> Result<Vec<WateringEvent>> {
        sqlx::query_as::<_, WateringEvent>(
            r#"
            SELECT ts_start, ts_end, trigger_mode, outcome, liters_used
            FROM watering_events
            ORDER BY ts_start DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_watering_events failed")
    }

    // ----------------------------
    // Decision log
    // ----------------------------

    pub async fn insert_decision(&self, d: &DecisionEntry) -> Result<()> {
        let mode = d.mode.map(|m| m.to_string());
        sqlx::query(
            r#"
            INSERT INTO decisions (ts, mode, started, reason)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(d.ts)
        .bind(mode)
        .bind(d.started)
        .bind(&d.reason)
        .execute(&self.pool)
        .await
        .context("insert_decision failed")?;
        Ok(())
    }

    pub async fn recent_decisions(&self, limit: i64) -> Result<Vec<DecisionRow>> {
        sqlx::query_as::<_, DecisionRow>(
            r#"
            SELECT ts, mode, started, reason
            FROM decisions
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_decisions failed")
    }
}
