// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event stream consumer loops.
//!
//! One loop per subscribed topic, each single-threaded: messages within a
//! topic are applied strictly in stream order, so the only reordering the
//! cache merge has to absorb is across topics and producer clocks.
//!
//! Messages are processed at-least-once. The cursor advances in memory
//! after each apply and is flushed to SQLite on an interval; a crash
//! replays at most one interval of messages, which the idempotent cache
//! merge absorbs. A message that fails to decode is logged and skipped,
//! and its cursor position still advances, so one poisoned message can
//! never wedge the topic.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::PatientCache;
use crate::channel::{compare_stream_ids, TopicReader, CURSOR_BEGINNING};
use crate::cursor::CursorStore;
use crate::error::Result;
use crate::event::PatientEvent;
use crate::metrics;

/// Backoff after a channel read error before retrying.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Decode one patient message and merge it into the replica.
///
/// Returns `Ok(true)` if applied, `Ok(false)` if skipped as out-of-date,
/// and an error for payloads that cannot be decoded or keyed.
pub fn apply_patient_message(cache: &PatientCache, payload: &[u8]) -> Result<bool> {
    let event = PatientEvent::from_bytes(payload)?;
    Ok(cache.apply(&event))
}

/// Single-topic consumer loop feeding the patient cache.
pub struct TopicConsumer {
    reader: TopicReader,
    cache: Arc<PatientCache>,
    cursors: Arc<CursorStore>,
    flush_interval: Duration,
}

impl TopicConsumer {
    pub fn new(
        reader: TopicReader,
        cache: Arc<PatientCache>,
        cursors: Arc<CursorStore>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            reader,
            cache,
            cursors,
            flush_interval,
        }
    }

    /// Run until the shutdown signal flips, then flush the cursor.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self {
            mut reader,
            cache,
            cursors,
            flush_interval,
        } = self;

        let topic = reader.topic().to_string();
        let mut cursor = cursors
            .get(&topic)
            .unwrap_or_else(|| CURSOR_BEGINNING.to_string());
        info!(topic = %topic, cursor = %cursor, "Consumer started");

        let mut flush_tick = tokio::time::interval(flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(topic = %topic, "Consumer shutting down");
                        break;
                    }
                }
                _ = flush_tick.tick() => {
                    if let Err(e) = cursors.flush().await {
                        warn!(topic = %topic, error = %e, "Cursor flush failed");
                    }
                }
                batch = reader.read_after(&cursor) => match batch {
                    Ok(messages) => {
                        for message in messages {
                            handle_message(&cache, &topic, &message.payload);
                            if cursor_should_advance(&cursor, &message.id) {
                                cursor = message.id.clone();
                                cursors.set(&topic, &message.id);
                            }
                        }
                    }
                    Err(e) => {
                        error!(topic = %topic, error = %e, "Channel read failed, backing off");
                        tokio::time::sleep(READ_ERROR_BACKOFF).await;
                    }
                }
            }
        }

        if let Err(e) = cursors.flush().await {
            warn!(topic = %topic, error = %e, "Final cursor flush failed");
        }
    }
}

/// The cursor only moves forward in stream-ID order. A replayed or
/// misordered entry is still applied (the cache merge is idempotent)
/// but never drags the cursor backwards.
fn cursor_should_advance(current: &str, candidate: &str) -> bool {
    compare_stream_ids(candidate, current) == std::cmp::Ordering::Greater
}

fn handle_message(cache: &PatientCache, topic: &str, payload: &[u8]) {
    match apply_patient_message(cache, payload) {
        Ok(applied) => {
            metrics::record_event_consumed(topic);
            debug!(topic = %topic, applied, "Processed patient event");
        }
        Err(e) => {
            // Poisoned message: skip it, keep the topic moving.
            metrics::record_event_poisoned(topic);
            warn!(topic = %topic, error = %e, "Undecodable event, skipping");
        }
    }
}
