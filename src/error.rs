// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the consistency engine.
//!
//! Errors are categorized by their source (remote billing service, message
//! channel, local SQLite stores) and by what the caller is allowed to do
//! about them.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Timeout / connection failure talking to the billing service |
//! | `Channel` | Yes | Message channel (Redis Streams) unavailable |
//! | `RemoteRejected` | No | Billing service explicitly rejected the request |
//! | `Outbox` | No | Local SQLite error (needs operator attention) |
//! | `EventDecode` | No | Malformed event payload |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine lifecycle violation |
//! | `Shutdown` | No | Engine is shutting down |
//!
//! # Propagation Policy
//!
//! Downstream *unavailability* never reaches callers of the write path as an
//! error — the gateway absorbs it into the Pending result. Only
//! caller-correctable problems (`RemoteRejected`, `Config`, `InvalidState`)
//! propagate as typed errors.

use thiserror::Error;

/// Result type alias for consistency-engine operations.
pub type Result<T> = std::result::Result<T, ConsistencyError>;

/// Errors that can occur in the consistency core.
///
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried with backoff.
#[derive(Error, Debug)]
pub enum ConsistencyError {
    /// Transient transport failure talking to the billing service.
    ///
    /// Timeouts, connection resets, DNS failures. Retryable within the
    /// gateway's retry budget; budget exhaustion counts as one circuit
    /// breaker failure.
    #[error("Transport error ({operation}): {message}")]
    Transport { operation: String, message: String },

    /// Explicit rejection from the billing service.
    ///
    /// The downstream was reachable and refused the request (validation
    /// failure, duplicate account). Not retried, not a breaker failure
    /// signal — surfaced to the caller as-is.
    #[error("Billing service rejected request: {0}")]
    RemoteRejected(String),

    /// Message channel error.
    ///
    /// Publishing or reading from Redis Streams failed. Retryable
    /// (the outbox relay retries publishes on the next cycle).
    #[error("Channel error ({topic}): {message}")]
    Channel {
        topic: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error from the outbox or cursor store.
    ///
    /// Not retryable at this level - indicates local database issues
    /// that need attention. (SQLITE_BUSY is retried internally before
    /// this surfaces.)
    #[error("Store error: {0}")]
    Outbox(#[from] sqlx::Error),

    /// Event payload failed to decode.
    ///
    /// The message is malformed at the source. Not retryable - consumers
    /// log and skip it so one poisoned message never blocks the stream.
    #[error("Event decode error: {0}")]
    EventDecode(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine lifecycle violation.
    ///
    /// An operation was attempted in the wrong state (e.g., calling
    /// `start()` twice). Indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    ///
    /// The write path refuses new work once the engine begins draining.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl ConsistencyError {
    /// Create a channel error from a redis::RedisError.
    pub fn channel(topic: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Channel {
            topic: topic.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a channel error without a source.
    pub fn channel_msg(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Channel {
            topic: topic.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error.
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Channel { .. } => true,
            Self::RemoteRejected(_) => false,
            Self::Outbox(_) => false,
            Self::EventDecode(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
        }
    }
}
