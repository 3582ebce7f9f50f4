// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Domain event wire schema.
//!
//! Events are encoded as field-numbered protobuf messages (via `prost`
//! derives) to keep transport size down and stay forward-compatible:
//! consumers built against this schema ignore fields they don't know,
//! so producers can evolve independently.
//!
//! # Topics
//!
//! | Topic | Payload | Producer | Consumer |
//! |-------|---------|----------|----------|
//! | `patient.created` | [`PatientEvent`] | patient service | cache consumers |
//! | `patient.updated` | [`PatientEvent`] | patient service | cache consumers |
//! | `fallback.reconcile` | [`BillingAccountEvent`] | outbox relay | billing service ingestion |

use crate::error::{ConsistencyError, Result};
use prost::Message;

/// Topic carrying patient-created events.
pub const TOPIC_PATIENT_CREATED: &str = "patient.created";

/// Topic carrying patient-updated events.
pub const TOPIC_PATIENT_UPDATED: &str = "patient.updated";

/// Topic carrying deferred billing-account reconciliation requests.
pub const TOPIC_FALLBACK_RECONCILE: &str = "fallback.reconcile";

/// Event-type tag on [`PatientEvent`] for creations.
pub const EVENT_TYPE_PATIENT_CREATED: &str = "PATIENT_CREATED";

/// Event-type tag on [`PatientEvent`] for updates.
pub const EVENT_TYPE_PATIENT_UPDATED: &str = "PATIENT_UPDATED";

/// Event-type tag on [`BillingAccountEvent`] requesting deferred account creation.
pub const EVENT_TYPE_ACCOUNT_CREATE_REQUESTED: &str = "ACCOUNT_CREATE_REQUESTED";

/// A patient domain event, produced by the owning service on create/update.
///
/// `occurred_at_ms` is the producer-side event time and drives the
/// last-writer-wins merge in the cache — not arrival order.
#[derive(Clone, PartialEq, Message)]
pub struct PatientEvent {
    /// Subject identifier (cache key).
    #[prost(string, tag = "1")]
    pub patient_id: String,

    /// Display name.
    #[prost(string, tag = "2")]
    pub name: String,

    /// Contact address.
    #[prost(string, tag = "3")]
    pub email: String,

    /// Event-type tag ("PATIENT_CREATED" / "PATIENT_UPDATED").
    #[prost(string, tag = "4")]
    pub event_type: String,

    /// Producer event time, milliseconds since epoch.
    #[prost(int64, tag = "5")]
    pub occurred_at_ms: i64,
}

impl PatientEvent {
    /// Build a created-event.
    pub fn created(
        patient_id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        occurred_at_ms: i64,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            name: name.into(),
            email: email.into(),
            event_type: EVENT_TYPE_PATIENT_CREATED.to_string(),
            occurred_at_ms,
        }
    }

    /// Build an updated-event.
    pub fn updated(
        patient_id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        occurred_at_ms: i64,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            name: name.into(),
            email: email.into(),
            event_type: EVENT_TYPE_PATIENT_UPDATED.to_string(),
            occurred_at_ms,
        }
    }

    /// Encode to the wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode from the wire format, validating the minimum the cache needs.
    ///
    /// Producers are separate deployable units — the payload is not trusted
    /// just because it arrived on an internal topic. A decodable message
    /// with an empty `patient_id` cannot be keyed and is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let event = Self::decode(bytes)
            .map_err(|e| ConsistencyError::EventDecode(format!("patient event: {}", e)))?;
        if event.patient_id.is_empty() {
            return Err(ConsistencyError::EventDecode(
                "patient event missing patient_id".to_string(),
            ));
        }
        Ok(event)
    }
}

/// Deferred billing-account creation request, published by the outbox relay
/// when the synchronous billing call could not complete.
///
/// Consumed by the billing service's own ingestion path when it recovers;
/// never applied to the patient cache.
#[derive(Clone, PartialEq, Message)]
pub struct BillingAccountEvent {
    /// Subject identifier.
    #[prost(string, tag = "1")]
    pub patient_id: String,

    /// Display name.
    #[prost(string, tag = "2")]
    pub name: String,

    /// Contact address.
    #[prost(string, tag = "3")]
    pub email: String,

    /// Event-type tag ("ACCOUNT_CREATE_REQUESTED"), distinguishing these
    /// from ordinary domain events.
    #[prost(string, tag = "4")]
    pub event_type: String,
}

impl BillingAccountEvent {
    /// Build an account-create-requested event.
    pub fn create_requested(
        patient_id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            name: name.into(),
            email: email.into(),
            event_type: EVENT_TYPE_ACCOUNT_CREATE_REQUESTED.to_string(),
        }
    }

    /// Encode to the wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode from the wire format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(bytes)
            .map_err(|e| ConsistencyError::EventDecode(format!("billing account event: {}", e)))
    }
}
