//! Scripted billing transport for integration tests.

use consistency_engine::billing::{BillingAccount, BillingClient, BillingRequest, CallError};
use consistency_engine::AccountStatus;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One scripted transport outcome.
#[derive(Clone)]
pub enum Step {
    /// Succeed with this account ID.
    Ok(String),
    /// Fail as a transient transport error.
    Transient,
    /// Fail as an explicit remote rejection.
    Rejected(String),
    /// Never resolve (exercises the per-attempt timeout).
    Hang,
}

/// Billing client that replays a script of outcomes, then succeeds.
///
/// Records every request it receives so tests can assert on attempt
/// counts and payloads.
pub struct MockBilling {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<BillingRequest>>,
    calls: AtomicUsize,
}

impl MockBilling {
    pub fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// A client that always succeeds.
    pub fn always_ok() -> Arc<Self> {
        Self::new(Vec::new())
    }

    /// A client that fails transiently forever.
    pub fn always_down() -> Arc<Self> {
        let client = Self::new(Vec::new());
        client.set_down(true);
        client
    }

    /// When down, every call fails transiently regardless of the script.
    pub fn set_down(&self, down: bool) {
        let mut script = self.script.lock().unwrap();
        if down {
            script.clear();
            // Sentinel: an empty script normally succeeds, so flood it.
            for _ in 0..10_000 {
                script.push_back(Step::Transient);
            }
        } else {
            script.clear();
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<BillingRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl BillingClient for MockBilling {
    fn create_account(
        &self,
        request: &BillingRequest,
    ) -> BoxFuture<'_, Result<BillingAccount, CallError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let step = self.script.lock().unwrap().pop_front();
        let patient_id = request.patient_id.clone();

        Box::pin(async move {
            match step {
                Some(Step::Ok(id)) => Ok(BillingAccount {
                    account_id: id,
                    status: AccountStatus::Active,
                }),
                None => Ok(BillingAccount {
                    account_id: format!("acct-{}", patient_id),
                    status: AccountStatus::Active,
                }),
                Some(Step::Transient) => Err(CallError::Transient("connection refused".into())),
                Some(Step::Rejected(msg)) => Err(CallError::Rejected(msg)),
                Some(Step::Hang) => futures::future::pending().await,
            }
        })
    }
}
