// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message channel transport over Redis Streams.
//!
//! Topics map to streams; every message is appended with XADD and carries
//! the encoded event under a single `payload` field. Stream entry IDs
//! (`millis-seq`) give a total per-topic order, which consumers persist as
//! cursors to resume after restart. Delivery is at-least-once: a crash
//! between apply and cursor flush replays messages, and every consumer is
//! expected to tolerate that.
//!
//! Publishing goes through the [`MessageChannel`] trait so the outbox
//! relay can be exercised against an in-process channel in tests.

use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::cmp::Ordering;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ConsistencyError, Result};

/// Cursor value meaning "from the beginning of the topic".
pub const CURSOR_BEGINNING: &str = "0";

/// Field name carrying the encoded event in each stream entry.
const PAYLOAD_FIELD: &str = "payload";

/// One message read from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Stream entry ID (`millis-seq`), totally ordered within the topic.
    pub id: String,
    /// Encoded event payload.
    pub payload: Vec<u8>,
}

/// Publish seam for the message channel.
pub trait MessageChannel: Send + Sync {
    /// Append a payload to a topic, returning the assigned message ID.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'_, Result<String>>;
}

/// Redis Streams implementation of the message channel.
#[derive(Clone)]
pub struct RedisChannel {
    manager: ConnectionManager,
}

impl RedisChannel {
    /// Connect to the channel at the given Redis URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ConsistencyError::Config(format!("invalid channel url: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| ConsistencyError::channel("(connect)", e))?;
        Ok(Self { manager })
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

impl MessageChannel for RedisChannel {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'_, Result<String>> {
        let mut conn = self.manager.clone();
        let topic = topic.to_string();
        Box::pin(async move {
            let id: String = conn
                .xadd(&topic, "*", &[(PAYLOAD_FIELD, payload.as_slice())])
                .await
                .map_err(|e| ConsistencyError::channel(topic.clone(), e))?;
            debug!(topic = %topic, message_id = %id, "Published message");
            Ok(id)
        })
    }
}

/// Reads one topic in entry-ID order, resuming from a cursor.
pub struct TopicReader {
    manager: ConnectionManager,
    topic: String,
    batch_size: usize,
    block_timeout: Duration,
}

impl TopicReader {
    pub fn new(
        manager: ConnectionManager,
        topic: impl Into<String>,
        batch_size: usize,
        block_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            topic: topic.into(),
            batch_size,
            block_timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Read the next batch of messages strictly after `cursor`.
    ///
    /// Blocks up to the configured timeout when the topic has nothing new,
    /// then returns an empty batch. Entries without a readable payload
    /// field are returned with an empty payload; consumers treat them as
    /// poisoned, so their IDs still advance the cursor and a malformed
    /// tail entry cannot pin the consumer in place.
    pub async fn read_after(&mut self, cursor: &str) -> Result<Vec<ChannelMessage>> {
        let opts = StreamReadOptions::default()
            .count(self.batch_size)
            .block(self.block_timeout.as_millis() as usize);

        let reply: StreamReadReply = self
            .manager
            .xread_options(&[self.topic.as_str()], &[cursor], &opts)
            .await
            .map_err(|e| ConsistencyError::channel(self.topic.clone(), e))?;

        Ok(collect_messages(&self.topic, reply))
    }
}

/// Flatten a stream reply into messages, in entry-ID order.
///
/// Every entry yields a message so the caller's cursor covers it; an
/// unreadable payload comes through empty.
fn collect_messages(topic: &str, reply: StreamReadReply) -> Vec<ChannelMessage> {
    let mut messages = Vec::new();
    for key in reply.keys {
        for entry in key.ids {
            let payload = match get_bytes_field(&entry.map, PAYLOAD_FIELD) {
                Some(payload) => payload,
                None => {
                    warn!(
                        topic = %topic,
                        message_id = %entry.id,
                        "Stream entry missing payload field"
                    );
                    Vec::new()
                }
            };
            messages.push(ChannelMessage {
                id: entry.id.clone(),
                payload,
            });
        }
    }
    messages
}

/// Extract a bytes field from a stream entry's field map.
fn get_bytes_field(
    map: &std::collections::HashMap<String, redis::Value>,
    field: &str,
) -> Option<Vec<u8>> {
    match map.get(field) {
        Some(redis::Value::BulkString(bytes)) => Some(bytes.clone()),
        Some(redis::Value::SimpleString(s)) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

/// Compare two stream entry IDs (`millis-seq`) numerically.
///
/// Falls back to lexicographic comparison for IDs that do not parse,
/// so a malformed ID cannot panic the consumer loop.
pub fn compare_stream_ids(a: &str, b: &str) -> Ordering {
    match (parse_stream_id(a), parse_stream_id(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn parse_stream_id(id: &str) -> Option<(u64, u64)> {
    let (ms, seq) = id.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}
