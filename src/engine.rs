// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consistency engine coordinator.
//!
//! The main orchestrator that ties together:
//! - The billing write path via [`crate::gateway::BillingGateway`]
//! - Durable deferral via [`crate::outbox::OutboxStore`] and its relay
//! - Event consumption via [`crate::consumer::TopicConsumer`]
//! - The local replica via [`crate::cache::PatientCache`]
//!
//! # Lifecycle
//!
//! ```text
//! Created -> Connecting -> Running -> ShuttingDown -> Stopped
//!                 └──────────> Failed
//! ```
//!
//! `start()` opens the SQLite stores, connects to the message channel,
//! and spawns one consumer task per subscribed topic plus the outbox
//! relay. `shutdown()` signals every task, waits for them to drain, and
//! closes the stores.

use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::billing::{BillingAccount, BillingClient, BillingRequest};
use crate::cache::PatientCache;
use crate::channel::{RedisChannel, TopicReader};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::EngineConfig;
use crate::consumer::TopicConsumer;
use crate::cursor::CursorStore;
use crate::error::{ConsistencyError, Result};
use crate::gateway::BillingGateway;
use crate::metrics;
use crate::outbox::{OutboxRelay, OutboxStore};

/// Engine lifecycle state, broadcast to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, not started.
    Created,
    /// Opening stores and connecting to the channel.
    Connecting,
    /// All tasks running.
    Running,
    /// Shutdown signalled, tasks draining.
    ShuttingDown,
    /// Fully stopped.
    Stopped,
    /// Startup failed.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The main consistency engine.
///
/// One instance per service process. The billing transport is injected
/// so the engine is independent of the RPC stack.
pub struct ConsistencyEngine {
    config: EngineConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Billing transport, injected by the host service
    client: Arc<dyn BillingClient>,

    /// Breaker guarding the billing service
    breaker: Arc<CircuitBreaker>,

    /// Local patient replica
    cache: Arc<PatientCache>,

    /// Write path, built at start (needs the outbox store open)
    gateway: RwLock<Option<Arc<BillingGateway>>>,

    outbox: RwLock<Option<Arc<OutboxStore>>>,
    cursors: RwLock<Option<Arc<CursorStore>>>,

    /// Background task handles
    task_handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl ConsistencyEngine {
    /// Create a new engine in `Created` state.
    ///
    /// Call [`start()`](Self::start) to open the stores and begin
    /// consuming events.
    pub fn new(config: EngineConfig, client: Arc<dyn BillingClient>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let breaker = Arc::new(CircuitBreaker::new(
            "billing",
            config.gateway.circuit_config(),
        ));
        let cache = Arc::new(PatientCache::new(
            config.cache.freshness_threshold_duration(),
            config.cache.shards,
        ));

        Self {
            config,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            client,
            breaker,
            cache,
            gateway: RwLock::new(None),
            outbox: RwLock::new(None),
            cursors: RwLock::new(None),
            task_handles: RwLock::new(Vec::new()),
        }
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// The local patient replica. Readable before `start()`; it simply
    /// stays empty until consumers run.
    pub fn cache(&self) -> &Arc<PatientCache> {
        &self.cache
    }

    /// The breaker guarding the billing service (for diagnostics).
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Provision a billing account through the resilient write path.
    ///
    /// Fails with `Shutdown` once shutdown has begun, and with
    /// `InvalidState` if the engine was never started.
    pub async fn create_billing_account(&self, request: &BillingRequest) -> Result<BillingAccount> {
        let gateway = {
            let guard = self.gateway.read().await;
            guard.clone()
        };
        match gateway {
            Some(gateway) => gateway.create_account(request).await,
            None => match self.state() {
                EngineState::ShuttingDown | EngineState::Stopped => {
                    Err(ConsistencyError::Shutdown)
                }
                state => Err(ConsistencyError::InvalidState {
                    expected: "Running".to_string(),
                    actual: format!("{:?}", state),
                }),
            },
        }
    }

    /// Start the engine.
    ///
    /// 1. Opens the outbox and cursor stores (SQLite)
    /// 2. Builds the billing gateway
    /// 3. Connects to the message channel (if any loop needs it)
    /// 4. Spawns one consumer per subscribed topic and the outbox relay
    pub async fn start(&self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ConsistencyError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            group_id = %self.config.group_id,
            topics = ?self.config.consumer.topics,
            "Starting consistency engine"
        );
        let _ = self.state_tx.send(EngineState::Connecting);
        metrics::set_engine_state("Connecting");

        let outbox = match OutboxStore::open(&self.config.outbox).await {
            Ok(store) => Arc::new(store),
            Err(e) => return Err(self.fail_start(e)),
        };
        *self.outbox.write().await = Some(outbox.clone());

        let cursors = match CursorStore::open(&self.config.cursor).await {
            Ok(store) => Arc::new(store),
            Err(e) => return Err(self.fail_start(e)),
        };
        *self.cursors.write().await = Some(cursors.clone());

        let gateway = Arc::new(BillingGateway::new(
            self.client.clone(),
            self.breaker.clone(),
            self.config.gateway.retry_config(),
            outbox.clone(),
            self.config.outbox.topic.clone(),
        ));
        *self.gateway.write().await = Some(gateway);

        let needs_channel =
            self.config.consumer.enabled || self.config.outbox.relay_enabled;
        if needs_channel {
            let channel = match RedisChannel::connect(&self.config.channel_url).await {
                Ok(channel) => channel,
                Err(e) => return Err(self.fail_start(e)),
            };

            if self.config.consumer.enabled {
                self.spawn_consumers(&channel, cursors).await;
            }
            if self.config.outbox.relay_enabled {
                self.spawn_relay(&channel, outbox).await;
            }
        } else {
            debug!("Consumer and relay disabled, skipping channel connection");
        }

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!("Consistency engine running");
        Ok(())
    }

    /// Mark startup as failed and hand the error back to the caller.
    ///
    /// A failed engine stays Failed; it cannot be restarted.
    fn fail_start(&self, e: ConsistencyError) -> ConsistencyError {
        warn!(error = %e, "Engine startup failed");
        let _ = self.state_tx.send(EngineState::Failed);
        metrics::set_engine_state("Failed");
        e
    }

    /// Spawn one consumer task per subscribed topic.
    async fn spawn_consumers(&self, channel: &RedisChannel, cursors: Arc<CursorStore>) {
        let mut handles = self.task_handles.write().await;
        let flush_interval =
            std::time::Duration::from_secs(self.config.consumer.cursor_flush_interval_sec);

        for topic in &self.config.consumer.topics {
            let reader = TopicReader::new(
                channel.manager(),
                topic.clone(),
                self.config.consumer.batch_size,
                self.config.consumer.block_timeout_duration(),
            );
            let consumer = TopicConsumer::new(
                reader,
                self.cache.clone(),
                cursors.clone(),
                flush_interval,
            );
            let shutdown_rx = self.shutdown_rx.clone();

            let handle = tokio::spawn(async move {
                consumer.run(shutdown_rx).await;
            });
            info!(topic = %topic, "Spawned topic consumer");
            handles.push(handle);
        }
    }

    /// Spawn the outbox relay task.
    async fn spawn_relay(&self, channel: &RedisChannel, outbox: Arc<OutboxStore>) {
        let relay = OutboxRelay::new(
            outbox,
            Arc::new(channel.clone()),
            self.config.outbox.relay_interval_duration(),
            self.config.outbox.relay_batch_size,
        );
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            relay.run(shutdown_rx).await;
        });
        info!("Spawned outbox relay");
        self.task_handles.write().await.push(handle);
    }

    /// Shut the engine down gracefully.
    ///
    /// 1. Signal all tasks to stop
    /// 2. Wait for them to drain (with timeout)
    /// 3. Close the SQLite stores
    pub async fn shutdown(&self) {
        info!("Shutting down consistency engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.task_handles.write().await;
            std::mem::take(&mut *guard)
        };
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to drain");
        }

        let drain_timeout = std::time::Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        *self.gateway.write().await = None;

        if let Some(cursors) = self.cursors.write().await.take() {
            if let Err(e) = cursors.close().await {
                warn!(error = %e, "Cursor store close failed");
            }
        }
        if let Some(outbox) = self.outbox.write().await.take() {
            outbox.close().await;
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Consistency engine stopped");
    }
}
