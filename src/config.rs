//! Configuration for the consistency engine.
//!
//! This module defines all configuration types needed to run the engine.
//! Configuration is passed to [`ConsistencyEngine::new()`](crate::ConsistencyEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use consistency_engine::config::EngineConfig;
//!
//! let config = EngineConfig {
//!     group_id: "appointment-service".into(),
//!     channel_url: "redis://localhost:6379".into(),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── group_id: String          # Consumer identity for this service
//! ├── channel_url: String       # Message channel (Redis) URL
//! ├── gateway: GatewayConfig    # Circuit breaker + retry for billing calls
//! ├── consumer: ConsumerConfig  # Event stream consumption
//! ├── cache: CacheConfig        # Local patient replica staleness policy
//! ├── outbox: OutboxConfig      # Durable fallback + relay
//! └── cursor: CursorConfig      # SQLite cursor persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! group_id: "appointment-service"
//! channel_url: "redis://channel:6379"
//!
//! gateway:
//!   retry_max_attempts: 3
//!   circuit_failure_threshold: 3
//!   circuit_cooldown: "30s"
//!
//! consumer:
//!   enabled: true
//!   topics: ["patient.created", "patient.updated"]
//!   block_timeout: "5s"
//!
//! cache:
//!   freshness_threshold: "5m"
//!
//! outbox:
//!   sqlite_path: "/var/lib/app/outbox.db"
//!   relay_interval: "5s"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ConsistencyEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ConsistencyEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Consumer-group identity of the service running this engine.
    /// One logical subscriber identity per owning service.
    pub group_id: String,

    /// URL of the message channel (Redis).
    pub channel_url: String,

    /// Billing gateway settings (retry budget + circuit breaker).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Event consumer settings.
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Cache staleness policy.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Durable fallback outbox settings.
    #[serde(default)]
    pub outbox: OutboxConfig,

    /// Cursor persistence settings.
    /// Cursors are stored in SQLite for crash recovery.
    #[serde(default)]
    pub cursor: CursorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            group_id: "appointment-service".to_string(),
            channel_url: "redis://localhost:6379".to_string(),
            gateway: GatewayConfig::default(),
            consumer: ConsumerConfig::default(),
            cache: CacheConfig::default(),
            outbox: OutboxConfig::default(),
            cursor: CursorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a config from a JSON document. Missing fields take their
    /// defaults; only `group_id` and `channel_url` are required.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| crate::error::ConsistencyError::Config(e.to_string()))
    }

    /// Create a minimal config for testing (in-memory stores, loops disabled).
    pub fn for_testing(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            channel_url: "redis://localhost:6379".to_string(),
            gateway: GatewayConfig::default(),
            consumer: ConsumerConfig {
                enabled: false,
                ..Default::default()
            },
            cache: CacheConfig::default(),
            outbox: OutboxConfig {
                relay_enabled: false,
                sqlite_path: ":memory:".to_string(),
                ..Default::default()
            },
            cursor: CursorConfig::in_memory(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GatewayConfig: billing call resilience settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the billing gateway's retry budget and circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Maximum attempts per logical billing call (transient failures only).
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,

    /// Initial delay before the first retry, as a duration string (e.g., "100ms").
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    /// Timeout for each individual call attempt (e.g., "2s").
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout: String,

    /// Consecutive logical-call failures before the circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long the circuit stays open before a half-open trial (e.g., "30s").
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown: String,

    /// Watchdog limit on a half-open trial call. A trial that does not
    /// resolve within this window is treated as a failure so a cancelled
    /// caller can never wedge the breaker in HalfOpen.
    #[serde(default = "default_trial_timeout")]
    pub trial_timeout: String,
}

fn default_retry_max_attempts() -> usize {
    3
}

fn default_retry_initial_delay() -> String {
    "100ms".to_string()
}

fn default_attempt_timeout() -> String {
    "2s".to_string()
}

fn default_circuit_failure_threshold() -> u32 {
    3
}

fn default_circuit_cooldown() -> String {
    "30s".to_string()
}

fn default_trial_timeout() -> String {
    "10s".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_initial_delay: "100ms".to_string(),
            attempt_timeout: "2s".to_string(),
            circuit_failure_threshold: 3,
            circuit_cooldown: "30s".to_string(),
            trial_timeout: "10s".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Build the typed circuit breaker config from these settings.
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            cooldown: parse_duration_or(&self.circuit_cooldown, Duration::from_secs(30)),
            trial_timeout: parse_duration_or(&self.trial_timeout, Duration::from_secs(10)),
        }
    }

    /// Build the typed retry config from these settings.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts,
            initial_delay: parse_duration_or(&self.retry_initial_delay, Duration::from_millis(100)),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            attempt_timeout: parse_duration_or(&self.attempt_timeout, Duration::from_secs(2)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConsumerConfig: event stream consumption settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Event consumer (domain-event subscription) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Whether the consumer loops run at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Topics to subscribe to. One loop per topic preserves per-key
    /// ordering within a topic partition.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Maximum entries to read per blocking read.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Blocking-read timeout as a duration string (e.g., "5s").
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// How often dirty cursors are flushed to SQLite (seconds).
    #[serde(default = "default_cursor_flush_interval_sec")]
    pub cursor_flush_interval_sec: u64,
}

fn default_topics() -> Vec<String> {
    vec![
        crate::event::TOPIC_PATIENT_CREATED.to_string(),
        crate::event::TOPIC_PATIENT_UPDATED.to_string(),
    ]
}

fn default_batch_size() -> usize {
    100
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_cursor_flush_interval_sec() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topics: default_topics(),
            batch_size: 100,
            block_timeout: "5s".to_string(),
            cursor_flush_interval_sec: 5,
        }
    }
}

impl ConsumerConfig {
    /// Parse the block_timeout string to a Duration.
    pub fn block_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.block_timeout, Duration::from_secs(5))
    }

    /// Cursor flush interval as a Duration.
    pub fn cursor_flush_interval(&self) -> Duration {
        Duration::from_secs(self.cursor_flush_interval_sec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CacheConfig: local replica staleness policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache staleness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum age of a cached record before reads flag it stale (e.g., "5m").
    /// Stale records are still returned — staleness is detected, not purged.
    #[serde(default = "default_freshness_threshold")]
    pub freshness_threshold: String,

    /// Number of lock shards for the replica map.
    #[serde(default = "default_shards")]
    pub shards: usize,
}

fn default_freshness_threshold() -> String {
    "5m".to_string()
}

fn default_shards() -> usize {
    16
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            freshness_threshold: "5m".to_string(),
            shards: 16,
        }
    }
}

impl CacheConfig {
    /// Parse the freshness threshold to a Duration.
    pub fn freshness_threshold_duration(&self) -> Duration {
        parse_duration_or(&self.freshness_threshold, Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OutboxConfig: durable fallback persistence + relay
// ═══════════════════════════════════════════════════════════════════════════════

/// Outbox (durable fallback) configuration.
///
/// Pending reconciliation requests are persisted here before any publish
/// attempt, then relayed to the channel until acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Whether the relay loop runs. The store itself is always written
    /// by the gateway's fallback path.
    #[serde(default = "default_true")]
    pub relay_enabled: bool,

    /// Path to the SQLite database holding the outbox table.
    #[serde(default = "default_outbox_path")]
    pub sqlite_path: String,

    /// How often the relay scans for unsent rows (e.g., "5s").
    #[serde(default = "default_relay_interval")]
    pub relay_interval: String,

    /// Maximum rows relayed per cycle.
    #[serde(default = "default_relay_batch_size")]
    pub relay_batch_size: usize,

    /// Topic the relay publishes reconciliation events to.
    #[serde(default = "default_reconcile_topic")]
    pub topic: String,
}

fn default_outbox_path() -> String {
    "consistency_outbox.db".to_string()
}

fn default_relay_interval() -> String {
    "5s".to_string()
}

fn default_relay_batch_size() -> usize {
    100
}

fn default_reconcile_topic() -> String {
    crate::event::TOPIC_FALLBACK_RECONCILE.to_string()
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            relay_enabled: true,
            sqlite_path: "consistency_outbox.db".to_string(),
            relay_interval: "5s".to_string(),
            relay_batch_size: 100,
            topic: default_reconcile_topic(),
        }
    }
}

impl OutboxConfig {
    /// Parse the relay interval to a Duration.
    pub fn relay_interval_duration(&self) -> Duration {
        parse_duration_or(&self.relay_interval, Duration::from_secs(5))
    }

    /// In-memory outbox for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CursorConfig: cursor persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Cursor persistence configuration.
///
/// Cursors track the last-applied position in each subscribed topic.
/// Persisted to SQLite because the channel's delivery position must
/// survive both channel and service restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Path to SQLite database for cursor storage.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "consistency_cursors.db".to_string(),
            wal_mode: true,
        }
    }
}

impl CursorConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

/// Parse a humantime duration string, falling back to a default.
fn parse_duration_or(s: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(s).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.group_id, "appointment-service");
        assert!(config.consumer.enabled);
        assert!(config.outbox.relay_enabled);
        assert_eq!(config.consumer.topics.len(), 2);
    }

    #[test]
    fn test_for_testing_config() {
        let config = EngineConfig::for_testing("test-service");
        assert_eq!(config.group_id, "test-service");
        assert!(!config.consumer.enabled);
        assert!(!config.outbox.relay_enabled);
        assert_eq!(config.cursor.sqlite_path, ":memory:");
        assert_eq!(config.outbox.sqlite_path, ":memory:");
    }

    #[test]
    fn test_gateway_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.circuit_failure_threshold, 3);
        assert_eq!(config.circuit_cooldown, "30s");
    }

    #[test]
    fn test_gateway_circuit_config() {
        let config = GatewayConfig {
            circuit_failure_threshold: 5,
            circuit_cooldown: "45s".to_string(),
            trial_timeout: "3s".to_string(),
            ..Default::default()
        };
        let circuit = config.circuit_config();
        assert_eq!(circuit.failure_threshold, 5);
        assert_eq!(circuit.cooldown, Duration::from_secs(45));
        assert_eq!(circuit.trial_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_gateway_retry_config() {
        let config = GatewayConfig {
            retry_max_attempts: 4,
            retry_initial_delay: "50ms".to_string(),
            attempt_timeout: "1s".to_string(),
            ..Default::default()
        };
        let retry = config.retry_config();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.initial_delay, Duration::from_millis(50));
        assert_eq!(retry.attempt_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_gateway_invalid_duration_fallback() {
        let config = GatewayConfig {
            circuit_cooldown: "bogus".to_string(),
            ..Default::default()
        };
        // Should fall back to 30 seconds
        assert_eq!(config.circuit_config().cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_consumer_defaults() {
        let config = ConsumerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.block_timeout_duration(), Duration::from_secs(5));
        assert_eq!(config.cursor_flush_interval(), Duration::from_secs(5));
        assert!(config
            .topics
            .contains(&crate::event::TOPIC_PATIENT_CREATED.to_string()));
        assert!(config
            .topics
            .contains(&crate::event::TOPIC_PATIENT_UPDATED.to_string()));
    }

    #[test]
    fn test_consumer_block_timeout_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
        ];

        for (input, expected) in test_cases {
            let config = ConsumerConfig {
                block_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(
                config.block_timeout_duration(),
                expected,
                "Failed for input: {}",
                input
            );
        }
    }

    #[test]
    fn test_cache_defaults() {
        let config = CacheConfig::default();
        assert_eq!(
            config.freshness_threshold_duration(),
            Duration::from_secs(300)
        );
        assert_eq!(config.shards, 16);
    }

    #[test]
    fn test_outbox_defaults() {
        let config = OutboxConfig::default();
        assert!(config.relay_enabled);
        assert_eq!(config.relay_interval_duration(), Duration::from_secs(5));
        assert_eq!(config.relay_batch_size, 100);
        assert_eq!(config.topic, crate::event::TOPIC_FALLBACK_RECONCILE);
    }

    #[test]
    fn test_cursor_config_in_memory() {
        let config = CursorConfig::in_memory();
        assert_eq!(config.sqlite_path, ":memory:");
        assert!(!config.wal_mode);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = EngineConfig {
            group_id: "roundtrip-service".to_string(),
            ..Default::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.group_id, "roundtrip-service");
        assert_eq!(parsed.consumer.topics.len(), 2);
        assert_eq!(
            parsed.gateway.circuit_failure_threshold,
            config.gateway.circuit_failure_threshold
        );
    }

    #[test]
    fn test_from_json() {
        let parsed =
            EngineConfig::from_json(r#"{"group_id": "svc", "channel_url": "redis://x:6379"}"#)
                .unwrap();
        assert_eq!(parsed.group_id, "svc");

        let err = EngineConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, crate::error::ConsistencyError::Config(_)));
    }

    #[test]
    fn test_config_deserializes_with_missing_sections() {
        let json = r#"{"group_id": "svc", "channel_url": "redis://x:6379"}"#;
        let parsed: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.group_id, "svc");
        assert!(parsed.consumer.enabled);
        assert_eq!(parsed.gateway.retry_max_attempts, 3);
    }
}
