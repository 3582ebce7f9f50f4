// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable per-topic consumer cursors.
//!
//! Each consumer loop records the last stream entry ID it applied, so a
//! restart resumes from where it left off instead of replaying the whole
//! topic. Cursors are cached in memory and flushed to SQLite on a timer;
//! a crash between apply and flush replays at most one flush interval of
//! messages, which the at-least-once contract already requires consumers
//! to tolerate.
//!
//! SQLite runs in WAL mode. Writes hitting SQLITE_BUSY or SQLITE_LOCKED
//! are retried with a short backoff before surfacing an error.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CursorConfig;
use crate::error::Result;
use crate::metrics;

const BUSY_RETRY_ATTEMPTS: u32 = 5;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// SQLite-backed cursor store with an in-memory write-back cache.
pub struct CursorStore {
    pool: SqlitePool,
    cache: Mutex<HashMap<String, String>>,
    dirty: Mutex<HashSet<String>>,
}

impl CursorStore {
    /// Open (or create) the cursor database and load existing cursors.
    pub async fn open(config: &CursorConfig) -> Result<Self> {
        let options = if config.sqlite_path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.sqlite_path)
                .create_if_missing(true)
        };
        let options = if config.wal_mode {
            options.journal_mode(SqliteJournalMode::Wal)
        } else {
            options
        };

        // Single connection: the store is low-traffic and an in-memory
        // database would otherwise be a separate database per connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cursors (
                topic TEXT PRIMARY KEY,
                position TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT topic, position FROM cursors")
            .fetch_all(&pool)
            .await?;
        let count = rows.len();
        let cache: HashMap<String, String> = rows.into_iter().collect();

        info!(path = %config.sqlite_path, cursors = count, "Cursor store opened");

        Ok(Self {
            pool,
            cache: Mutex::new(cache),
            dirty: Mutex::new(HashSet::new()),
        })
    }

    /// Get the cursor for a topic, if one has ever been recorded.
    pub fn get(&self, topic: &str) -> Option<String> {
        self.lock_cache().get(topic).cloned()
    }

    /// Advance the cursor for a topic in memory; persisted on the next flush.
    pub fn set(&self, topic: &str, position: &str) {
        self.lock_cache()
            .insert(topic.to_string(), position.to_string());
        self.dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.to_string());
    }

    /// Persist every dirty cursor. Returns how many were written.
    pub async fn flush(&self) -> Result<usize> {
        let topics: Vec<String> = {
            let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
            dirty.drain().collect()
        };
        if topics.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        for topic in topics {
            let position = match self.get(&topic) {
                Some(p) => p,
                None => continue,
            };
            self.upsert_with_retry(&topic, &position).await?;
            written += 1;
        }
        metrics::record_cursor_flush(written);
        debug!(cursors = written, "Flushed dirty cursors");
        Ok(written)
    }

    /// Flush outstanding cursors and close the pool.
    pub async fn close(&self) -> Result<()> {
        self.flush().await?;
        self.pool.close().await;
        Ok(())
    }

    async fn upsert_with_retry(&self, topic: &str, position: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut attempt = 0;
        loop {
            let result = sqlx::query(
                "INSERT INTO cursors (topic, position, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(topic) DO UPDATE SET
                     position = excluded.position,
                     updated_at = excluded.updated_at",
            )
            .bind(topic)
            .bind(position)
            .bind(now)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) if is_busy(&e) && attempt < BUSY_RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!(topic = %topic, attempt, "SQLite busy writing cursor, retrying");
                    tokio::time::sleep(BUSY_RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// SQLITE_BUSY ("5") and SQLITE_LOCKED ("6") are transient contention.
pub(crate) fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5") | Some("6"))
        }
        _ => false,
    }
}
