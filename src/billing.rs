// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Billing service client seam.
//!
//! The gateway talks to the billing service through the [`BillingClient`]
//! trait so the transport (gRPC in production) stays out of the resilience
//! logic, and tests can script failures without a network.
//!
//! Implementations report failures through [`CallError`], which carries the
//! one distinction the resilience layer acts on: *transient* (the service
//! may be down, worth retrying, counts toward the breaker) versus
//! *rejected* (the service answered and said no, final).

use futures::future::BoxFuture;

/// Request to provision a billing account for a patient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingRequest {
    pub patient_id: String,
    pub name: String,
    pub email: String,
}

impl BillingRequest {
    pub fn new(
        patient_id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Provisioning state of a billing account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    /// Account exists downstream.
    Active,
    /// Creation deferred; the outbox relay will reconcile it.
    Pending,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Pending => write!(f, "PENDING"),
        }
    }
}

/// Outcome of a billing-account provisioning call.
///
/// The pending sentinel (empty `account_id`, status `Pending`) is a
/// legitimate business outcome of the write path, never an error:
/// the account will exist eventually via the outbox relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingAccount {
    /// Downstream account identifier; empty while `Pending`.
    pub account_id: String,
    pub status: AccountStatus,
}

impl BillingAccount {
    /// The deferred-creation sentinel returned on the fallback path.
    pub fn pending() -> Self {
        Self {
            account_id: String::new(),
            status: AccountStatus::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == AccountStatus::Pending
    }
}

/// Failure of a single transport attempt against the billing service.
#[derive(Debug, Clone)]
pub enum CallError {
    /// Timeout, connection failure, or other failure where the remote may
    /// simply be down. Eligible for retry; counts toward the breaker once
    /// the retry budget is spent.
    Transient(String),
    /// The remote was reachable and refused the request. Never retried,
    /// never a breaker failure signal.
    Rejected(String),
}

impl CallError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient: {}", msg),
            Self::Rejected(msg) => write!(f, "rejected: {}", msg),
        }
    }
}

/// Transport-level client for the billing service.
///
/// One attempt per call; the gateway owns timeouts, retries, and the
/// circuit breaker around it.
pub trait BillingClient: Send + Sync {
    /// Attempt to create a billing account for the patient.
    fn create_account(
        &self,
        request: &BillingRequest,
    ) -> BoxFuture<'_, Result<BillingAccount, CallError>>;
}
