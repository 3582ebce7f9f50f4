// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilient write path to the billing service.
//!
//! The gateway composes the resilience layers explicitly, innermost out:
//!
//! ```text
//! breaker.try_acquire()
//!   └─ retry budget (transients only)
//!        └─ per-attempt timeout
//!             └─ one transport call
//! ```
//!
//! One admitted call spends at most the whole retry budget and reports
//! exactly one signal back to the breaker: success, or failure when the
//! budget is exhausted. Explicit remote rejections are final; they skip
//! the remaining budget, do not count as breaker failures, and propagate
//! to the caller as errors.
//!
//! Unavailability never propagates. Whether the breaker rejects up front
//! or the budget runs out, the gateway durably records the intent in the
//! outbox and returns the Pending sentinel; the relay finishes the job
//! when the billing service recovers.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::billing::{BillingAccount, BillingClient, BillingRequest, CallError};
use crate::circuit_breaker::{Admission, CallPermit, CircuitBreaker};
use crate::error::{ConsistencyError, Result};
use crate::event::BillingAccountEvent;
use crate::metrics;
use crate::outbox::OutboxStore;
use crate::resilience::RetryConfig;

/// Circuit-broken, retrying gateway for billing-account provisioning.
pub struct BillingGateway {
    client: Arc<dyn BillingClient>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    outbox: Arc<OutboxStore>,
    fallback_topic: String,
}

impl BillingGateway {
    pub fn new(
        client: Arc<dyn BillingClient>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
        outbox: Arc<OutboxStore>,
        fallback_topic: impl Into<String>,
    ) -> Self {
        Self {
            client,
            breaker,
            retry,
            outbox,
            fallback_topic: fallback_topic.into(),
        }
    }

    /// The breaker guarding this gateway (for diagnostics).
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Provision a billing account for a patient.
    ///
    /// Returns the live account on success, the Pending sentinel when the
    /// billing service is unavailable, and an error only when the remote
    /// explicitly rejected the request.
    pub async fn create_account(&self, request: &BillingRequest) -> Result<BillingAccount> {
        match self.breaker.try_acquire() {
            Admission::Admitted(permit) => self.call_with_retry(request, permit).await,
            Admission::Rejected => {
                debug!(patient_id = %request.patient_id, "Circuit open, deferring billing account");
                metrics::record_gateway_short_circuit();
                self.fall_back(request).await;
                Ok(BillingAccount::pending())
            }
        }
    }

    async fn call_with_retry(
        &self,
        request: &BillingRequest,
        permit: CallPermit<'_>,
    ) -> Result<BillingAccount> {
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 0..max_attempts {
            let outcome = tokio::time::timeout(
                self.retry.attempt_timeout,
                self.client.create_account(request),
            )
            .await;

            let err = match outcome {
                Ok(Ok(account)) => {
                    permit.record_success();
                    metrics::record_gateway_success();
                    debug!(
                        patient_id = %request.patient_id,
                        account_id = %account.account_id,
                        attempt,
                        "Billing account created"
                    );
                    return Ok(account);
                }
                Ok(Err(CallError::Rejected(msg))) => {
                    // The remote answered; the circuit learned the service
                    // is up even though it said no.
                    permit.record_success();
                    metrics::record_gateway_rejection();
                    info!(patient_id = %request.patient_id, reason = %msg, "Billing request rejected");
                    return Err(ConsistencyError::RemoteRejected(msg));
                }
                Ok(Err(CallError::Transient(msg))) => msg,
                Err(_) => format!("attempt timed out after {:?}", self.retry.attempt_timeout),
            };

            warn!(
                patient_id = %request.patient_id,
                attempt = attempt + 1,
                max_attempts,
                error = %err,
                "Billing call attempt failed"
            );

            if attempt + 1 < max_attempts {
                metrics::record_retry_attempt();
                tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
            }
        }

        // Budget spent: one failure signal to the breaker, then defer.
        permit.record_failure();
        metrics::record_gateway_fallback();
        self.fall_back(request).await;
        Ok(BillingAccount::pending())
    }

    /// Durably record the deferred account creation.
    ///
    /// An outbox write failure is logged and swallowed: the caller still
    /// gets the Pending sentinel, because failing the patient write over
    /// a local bookkeeping error would be worse than a lost deferral.
    async fn fall_back(&self, request: &BillingRequest) {
        let event = BillingAccountEvent::create_requested(
            request.patient_id.clone(),
            request.name.clone(),
            request.email.clone(),
        );
        match self
            .outbox
            .enqueue(&self.fallback_topic, &event.to_bytes())
            .await
        {
            Ok(row_id) => {
                info!(
                    patient_id = %request.patient_id,
                    row_id,
                    "Deferred billing account creation to outbox"
                );
            }
            Err(e) => {
                warn!(
                    patient_id = %request.patient_id,
                    error = %e,
                    "Failed to enqueue billing fallback, deferral lost"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::AccountStatus;
    use crate::circuit_breaker::{CircuitConfig, CircuitState};
    use crate::config::OutboxConfig;
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// One scripted transport outcome.
    enum Step {
        Ok(&'static str),
        Transient,
        Rejected(&'static str),
        Hang,
    }

    /// Billing client that replays a script, then succeeds.
    struct ScriptedBilling {
        script: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
    }

    impl ScriptedBilling {
        fn new(script: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl BillingClient for ScriptedBilling {
        fn create_account(
            &self,
            _request: &BillingRequest,
        ) -> BoxFuture<'_, std::result::Result<BillingAccount, CallError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front();
            Box::pin(async move {
                match step {
                    Some(Step::Ok(id)) => Ok(BillingAccount {
                        account_id: id.to_string(),
                        status: AccountStatus::Active,
                    }),
                    None => Ok(BillingAccount {
                        account_id: "acct-default".to_string(),
                        status: AccountStatus::Active,
                    }),
                    Some(Step::Transient) => {
                        Err(CallError::Transient("connection refused".into()))
                    }
                    Some(Step::Rejected(msg)) => Err(CallError::Rejected(msg.into())),
                    Some(Step::Hang) => futures::future::pending().await,
                }
            })
        }
    }

    async fn gateway(
        client: Arc<ScriptedBilling>,
        circuit: CircuitConfig,
    ) -> (BillingGateway, Arc<OutboxStore>) {
        let outbox = Arc::new(OutboxStore::open(&OutboxConfig::in_memory()).await.unwrap());
        let breaker = Arc::new(CircuitBreaker::new("billing", circuit));
        let gw = BillingGateway::new(
            client,
            breaker,
            RetryConfig::testing(),
            outbox.clone(),
            "fallback.reconcile",
        );
        (gw, outbox)
    }

    fn request() -> BillingRequest {
        BillingRequest::new("p-1", "Alice", "alice@example.com")
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let client = ScriptedBilling::new(vec![Step::Ok("acct-1")]);
        let (gw, outbox) = gateway(client.clone(), CircuitConfig::default()).await;

        let account = gw.create_account(&request()).await.unwrap();
        assert_eq!(account.account_id, "acct-1");
        assert_eq!(account.status, AccountStatus::Active);
        assert_eq!(client.calls(), 1);
        assert_eq!(outbox.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_retried_within_budget() {
        let client = ScriptedBilling::new(vec![Step::Transient, Step::Transient, Step::Ok("acct-1")]);
        let (gw, outbox) = gateway(client.clone(), CircuitConfig::default()).await;

        let account = gw.create_account(&request()).await.unwrap();
        assert_eq!(account.account_id, "acct-1");
        assert_eq!(client.calls(), 3);
        assert_eq!(gw.breaker().consecutive_failures(), 0);
        assert_eq!(outbox.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_defers_and_counts_once() {
        let client =
            ScriptedBilling::new(vec![Step::Transient, Step::Transient, Step::Transient]);
        let (gw, outbox) = gateway(client.clone(), CircuitConfig::default()).await;

        let account = gw.create_account(&request()).await.unwrap();
        assert!(account.is_pending());
        assert_eq!(client.calls(), 3);
        // Three transport attempts, one breaker failure
        assert_eq!(gw.breaker().consecutive_failures(), 1);
        assert_eq!(outbox.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_final() {
        let client = ScriptedBilling::new(vec![Step::Rejected("duplicate account")]);
        let (gw, outbox) = gateway(client.clone(), CircuitConfig::default()).await;

        let err = gw.create_account(&request()).await.unwrap_err();
        assert!(matches!(err, ConsistencyError::RemoteRejected(_)));
        // No retry, no fallback, no breaker failure
        assert_eq!(client.calls(), 1);
        assert_eq!(gw.breaker().consecutive_failures(), 0);
        assert_eq!(gw.breaker().state(), CircuitState::Closed);
        assert_eq!(outbox.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let client = ScriptedBilling::new(vec![Step::Hang, Step::Ok("acct-1")]);
        let (gw, _) = gateway(client.clone(), CircuitConfig::default()).await;
        // Pause only after the sqlite pool is up: a paused clock auto-advances
        // past the pool's acquire timeout while it waits on a non-tokio thread.
        tokio::time::pause();

        let account = gw.create_account(&request()).await.unwrap();
        assert_eq!(account.account_id, "acct-1");
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let circuit = CircuitConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(30),
            trial_timeout: Duration::from_secs(10),
        };
        let client = ScriptedBilling::new(vec![
            Step::Transient,
            Step::Transient,
            Step::Transient,
            // Would succeed if reached
            Step::Ok("acct-x"),
        ]);
        let (gw, outbox) = gateway(client.clone(), circuit).await;

        // Exhausts the budget, opens the circuit
        assert!(gw.create_account(&request()).await.unwrap().is_pending());
        assert_eq!(gw.breaker().state(), CircuitState::Open);
        let calls_before = client.calls();

        // Short-circuited: no transport attempt, straight to the outbox
        let account = gw.create_account(&request()).await.unwrap();
        assert!(account.is_pending());
        assert_eq!(client.calls(), calls_before);
        assert_eq!(outbox.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_recovery_via_trial() {
        let circuit = CircuitConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(30),
            trial_timeout: Duration::from_secs(10),
        };
        let client = ScriptedBilling::new(vec![
            Step::Transient,
            Step::Transient,
            Step::Transient,
            Step::Ok("acct-1"),
        ]);
        let (gw, _) = gateway(client.clone(), circuit).await;
        tokio::time::pause();

        assert!(gw.create_account(&request()).await.unwrap().is_pending());
        assert_eq!(gw.breaker().state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;

        // Trial call goes through and closes the circuit
        let account = gw.create_account(&request()).await.unwrap();
        assert_eq!(account.account_id, "acct-1");
        assert_eq!(gw.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rejection_during_trial_closes_circuit() {
        let circuit = CircuitConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(30),
            trial_timeout: Duration::from_secs(10),
        };
        let client = ScriptedBilling::new(vec![
            Step::Transient,
            Step::Transient,
            Step::Transient,
            Step::Rejected("bad request"),
        ]);
        let (gw, _) = gateway(client.clone(), circuit).await;
        tokio::time::pause();

        assert!(gw.create_account(&request()).await.unwrap().is_pending());
        tokio::time::advance(Duration::from_secs(31)).await;

        // The remote answered, so the trial proves the service is back
        let err = gw.create_account(&request()).await.unwrap_err();
        assert!(matches!(err, ConsistencyError::RemoteRejected(_)));
        assert_eq!(gw.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_fallback_enqueues_exactly_one_row() {
        let client =
            ScriptedBilling::new(vec![Step::Transient, Step::Transient, Step::Transient]);
        let (gw, outbox) = gateway(client, CircuitConfig::default()).await;

        gw.create_account(&request()).await.unwrap();
        assert_eq!(outbox.pending_count().await.unwrap(), 1);

        let rows = outbox.fetch_unpublished(10).await.unwrap();
        let event = BillingAccountEvent::from_bytes(&rows[0].payload).unwrap();
        assert_eq!(event.patient_id, "p-1");
        assert_eq!(
            event.event_type,
            crate::event::EVENT_TYPE_ACCOUNT_CREATE_REQUESTED
        );
    }
}
