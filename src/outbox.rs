// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable fallback outbox.
//!
//! When the synchronous billing call cannot complete, the gateway records
//! the intent locally instead of publishing straight to the channel. The
//! write is durable the moment the row commits, so the intent survives a
//! process crash and a channel outage at the same time. A relay loop
//! drains unpublished rows to the channel and marks them only after the
//! publish is acknowledged.
//!
//! Delivery to the channel is at-least-once: a crash between publish and
//! mark republishes the row. Each logical fallback enqueues exactly one
//! row, so duplicates can only come from the relay, never the gateway.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::channel::MessageChannel;
use crate::config::OutboxConfig;
use crate::cursor::is_busy;
use crate::error::Result;
use crate::metrics;

const BUSY_RETRY_ATTEMPTS: u32 = 5;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// One unpublished outbox row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxEntry {
    pub id: i64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub created_at: i64,
    /// Failed publish attempts so far.
    pub attempts: i64,
}

/// SQLite-backed outbox table.
pub struct OutboxStore {
    pool: SqlitePool,
}

impl OutboxStore {
    /// Open (or create) the outbox database.
    pub async fn open(config: &OutboxConfig) -> Result<Self> {
        let options = if config.sqlite_path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.sqlite_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                published_at INTEGER
            )",
        )
        .execute(&pool)
        .await?;

        info!(path = %config.sqlite_path, "Outbox store opened");
        Ok(Self { pool })
    }

    /// Durably record an intent to publish. Returns the row ID.
    pub async fn enqueue(&self, topic: &str, payload: &[u8]) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let mut attempt = 0;
        loop {
            let result = sqlx::query(
                "INSERT INTO outbox (topic, payload, created_at) VALUES (?1, ?2, ?3)",
            )
            .bind(topic)
            .bind(payload)
            .bind(now)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) => {
                    debug!(topic = %topic, row_id = done.last_insert_rowid(), "Enqueued outbox row");
                    return Ok(done.last_insert_rowid());
                }
                Err(e) if is_busy(&e) && attempt < BUSY_RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!(topic = %topic, attempt, "SQLite busy enqueueing outbox row, retrying");
                    tokio::time::sleep(BUSY_RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Oldest unpublished rows, up to `limit`, in insertion order.
    pub async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let entries = sqlx::query_as::<_, OutboxEntry>(
            "SELECT id, topic, payload, created_at, attempts FROM outbox
             WHERE published_at IS NULL
             ORDER BY id
             LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Mark a row published (the channel acknowledged it).
    pub async fn mark_published(&self, id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE outbox SET published_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Count a failed publish attempt against a row.
    pub async fn record_attempt(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of rows still awaiting publish.
    pub async fn pending_count(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE published_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Background loop draining the outbox to the channel.
pub struct OutboxRelay {
    store: Arc<OutboxStore>,
    channel: Arc<dyn MessageChannel>,
    interval: Duration,
    batch_size: usize,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<OutboxStore>,
        channel: Arc<dyn MessageChannel>,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            channel,
            interval,
            batch_size,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Outbox relay started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Outbox relay shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.relay_once().await {
                        error!(error = %e, "Outbox relay cycle failed");
                    }
                }
            }
        }
    }

    /// Publish one batch of unpublished rows. Returns how many were
    /// acknowledged. A publish failure ends the cycle early; the
    /// remaining rows stay pending for the next tick.
    pub async fn relay_once(&self) -> Result<usize> {
        let entries = self.store.fetch_unpublished(self.batch_size).await?;
        if entries.is_empty() {
            metrics::record_outbox_pending(0);
            return Ok(0);
        }

        let mut published = 0;
        for entry in entries {
            match self.channel.publish(&entry.topic, entry.payload.clone()).await {
                Ok(message_id) => {
                    self.store.mark_published(entry.id).await?;
                    metrics::record_outbox_published();
                    debug!(
                        row_id = entry.id,
                        topic = %entry.topic,
                        message_id = %message_id,
                        "Relayed outbox row"
                    );
                    published += 1;
                }
                Err(e) => {
                    warn!(
                        row_id = entry.id,
                        topic = %entry.topic,
                        attempts = entry.attempts + 1,
                        error = %e,
                        "Publish failed, leaving row pending"
                    );
                    self.store.record_attempt(entry.id).await?;
                    break;
                }
            }
        }

        let pending = self.store.pending_count().await.unwrap_or(-1);
        if pending >= 0 {
            metrics::record_outbox_pending(pending as u64);
        }
        Ok(published)
    }
}
