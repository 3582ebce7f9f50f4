// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-service consistency engine.
//!
//! Keeps a service correct while the services around it fail: a
//! circuit-broken, retrying gateway for synchronous billing calls with a
//! durable outbox fallback, and an event-driven local replica of patient
//! data that degrades to stale-but-served instead of unavailable.
//!
//! # Architecture
//!
//! ```text
//!                          ┌──────────────────────┐
//!   create_billing_account │   BillingGateway     │   gRPC
//!  ────────────────────────▶  breaker ∘ retry     ├──────────▶ billing service
//!                          │      │ exhausted     │
//!                          │      ▼               │
//!                          │  OutboxStore (SQLite)│
//!                          └──────────┬───────────┘
//!                                     │ relay (at-least-once)
//!                                     ▼
//!                          ┌──────────────────────┐
//!                          │   Message channel    │  patient.created
//!                          │   (Redis Streams)    │  patient.updated
//!                          └──────────┬───────────┘  fallback.reconcile
//!                                     │ TopicConsumer per topic
//!                                     ▼
//!                          ┌──────────────────────┐
//!   lookups (may be stale) │   PatientCache       │
//!  ◀───────────────────────┤   LWW by event time  │
//!                          └──────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - The write path never fails on downstream unavailability: callers get
//!   the Pending sentinel and the outbox relay finishes the job later.
//! - Every deferred intent survives crashes (SQLite WAL) and reaches the
//!   channel at least once.
//! - The replica converges to the newest value per patient by producer
//!   event time, regardless of delivery order or redelivery.
//! - Reads are tagged stale rather than blocked or purged.
//!
//! # Non-Guarantees
//!
//! - No exactly-once delivery: the relay and consumers both assume
//!   redelivery and are idempotent instead.
//! - No cross-service transactions, and no read-your-writes across
//!   services: the replica lags its source by design.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use consistency_engine::{ConsistencyEngine, EngineConfig};
//! use consistency_engine::billing::BillingRequest;
//! # use consistency_engine::billing::{BillingClient, BillingAccount, CallError};
//! # use futures::future::BoxFuture;
//! # struct GrpcBilling;
//! # impl BillingClient for GrpcBilling {
//! #     fn create_account(&self, _r: &BillingRequest)
//! #         -> BoxFuture<'_, Result<BillingAccount, CallError>> {
//! #         Box::pin(async { Ok(BillingAccount::pending()) })
//! #     }
//! # }
//!
//! # async fn run() -> consistency_engine::Result<()> {
//! let config = EngineConfig {
//!     group_id: "appointment-service".into(),
//!     channel_url: "redis://localhost:6379".into(),
//!     ..Default::default()
//! };
//! let engine = ConsistencyEngine::new(config, Arc::new(GrpcBilling));
//! engine.start().await?;
//!
//! let request = BillingRequest::new("p-1", "Alice", "alice@example.com");
//! let account = engine.create_billing_account(&request).await?;
//! if account.is_pending() {
//!     // billing is down; the outbox relay will reconcile
//! }
//!
//! println!("{}", engine.cache().display_name("p-1"));
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod billing;
pub mod cache;
pub mod channel;
pub mod circuit_breaker;
pub mod config;
pub mod consumer;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod event;
pub mod gateway;
pub mod metrics;
pub mod outbox;
pub mod resilience;

pub use billing::{AccountStatus, BillingAccount, BillingClient, BillingRequest, CallError};
pub use cache::{CacheView, CachedPatient, PatientCache};
pub use channel::{MessageChannel, RedisChannel};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState};
pub use config::EngineConfig;
pub use engine::{ConsistencyEngine, EngineState};
pub use error::{ConsistencyError, Result};
pub use event::{BillingAccountEvent, PatientEvent};
pub use gateway::BillingGateway;
pub use outbox::{OutboxRelay, OutboxStore};
pub use resilience::RetryConfig;
