//! Circuit breaker for downstream service protection.
//!
//! Prevents cascading failures when a downstream service is unavailable.
//! The state machine is owned explicitly (a mutex-guarded struct) so that
//! transitions are observable and the half-open trial slot can be handed
//! out atomically.
//!
//! # States
//!
//! ```text
//! Closed   --[failures >= threshold]--> Open
//! Open     --[cooldown elapsed]-------> HalfOpen (one trial admitted)
//! HalfOpen --[trial succeeds]---------> Closed
//! HalfOpen --[trial fails]------------> Open
//! ```
//!
//! Initial state is `Closed`; there is no terminal state.
//!
//! # Half-Open Trial
//!
//! While `HalfOpen`, at most one trial call is in flight regardless of
//! concurrent caller count. [`CircuitBreaker::try_acquire`] hands out a
//! [`CallPermit`] carrying a generation number; a permit from an abandoned
//! trial (caller cancelled, watchdog expired it) cannot resolve the
//! current trial. A trial that does not resolve within `trial_timeout`
//! is treated as a failure on the next admission check, so the breaker
//! can never be wedged in `HalfOpen`.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use consistency_engine::circuit_breaker::{CircuitBreaker, CircuitConfig, Admission};
//! let breaker = CircuitBreaker::new("billing", CircuitConfig::default());
//!
//! match breaker.try_acquire() {
//!     Admission::Admitted(permit) => {
//!         // attempt the call...
//!         permit.record_success();
//!     }
//!     Admission::Rejected => { /* short-circuit to fallback */ }
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through.
    Closed,
    /// Testing if the service recovered; exactly one trial admitted.
    HalfOpen,
    /// Service unhealthy, fail-fast without attempting the call.
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive logical-call failures that trip the circuit.
    pub failure_threshold: u32,
    /// How long to wait after opening before admitting a trial call.
    pub cooldown: Duration,
    /// Watchdog limit on an in-flight half-open trial.
    pub trial_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            trial_timeout: Duration::from_secs(10),
        }
    }
}

impl CircuitConfig {
    /// Fast transitions for tests.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            cooldown: Duration::from_millis(50),
            trial_timeout: Duration::from_millis(20),
        }
    }
}

/// Mutable breaker state, guarded by a single mutex.
///
/// All fields change together on transitions; a finer lock would buy
/// nothing and could let two callers both take the trial slot.
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Earliest instant a trial may be admitted (set while Open).
    retry_eligible_at: Option<Instant>,
    /// When the in-flight half-open trial started, if any.
    trial_started_at: Option<Instant>,
    /// Bumped whenever a trial is resolved or abandoned, to invalidate
    /// permits from earlier admissions.
    generation: u64,
}

/// Result of asking the breaker for admission.
pub enum Admission<'a> {
    /// The call may proceed. Resolve the permit exactly once.
    Admitted(CallPermit<'a>),
    /// The circuit is open (or the trial slot is taken) — do not attempt
    /// the call; take the fallback path.
    Rejected,
}

impl Admission<'_> {
    /// Whether this admission lets the call through.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Permission to make one call through the breaker.
///
/// Must be resolved with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping it unresolved is
/// tolerated: if it was a trial, the watchdog re-opens the circuit.
#[must_use = "resolve the permit with record_success or record_failure"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
}

impl CallPermit<'_> {
    /// Whether this permit is the single half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Resolve the call as successful.
    pub fn record_success(self) {
        self.breaker.on_success(self.generation);
    }

    /// Resolve the call as failed (retry budget exhausted on transients).
    pub fn record_failure(self) {
        self.breaker.on_failure(self.generation);
    }
}

/// A named circuit breaker with metrics tracking.
///
/// One instance per downstream dependency, shared across all callers.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                retry_eligible_at: None,
                trial_started_at: None,
                generation: 0,
            }),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Get the circuit breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (for metrics/diagnostics).
    pub fn state(&self) -> CircuitState {
        self.lock_inner().state
    }

    /// Current consecutive-failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.lock_inner().consecutive_failures
    }

    /// Ask for admission for one call.
    ///
    /// - `Closed`: admitted.
    /// - `Open` before the cooldown elapses: rejected (fail fast, no
    ///   transport attempt).
    /// - `Open` with cooldown elapsed: transitions to `HalfOpen` and admits
    ///   the single trial.
    /// - `HalfOpen` with a live trial in flight: rejected.
    /// - `HalfOpen` with an expired trial: the trial is resolved as a
    ///   failure (back to `Open`) and this caller is rejected.
    pub fn try_acquire(&self) -> Admission<'_> {
        let now = Instant::now();
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::Closed => {
                self.calls_total.fetch_add(1, Ordering::Relaxed);
                Admission::Admitted(CallPermit {
                    breaker: self,
                    generation: inner.generation,
                    trial: false,
                })
            }
            CircuitState::Open => {
                let eligible = inner
                    .retry_eligible_at
                    .map(|at| now >= at)
                    .unwrap_or(true);
                if !eligible {
                    self.rejections.fetch_add(1, Ordering::Relaxed);
                    debug!(circuit = %self.name, "Short-circuiting call (circuit open)");
                    return Admission::Rejected;
                }

                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trial_started_at = Some(now);
                self.calls_total.fetch_add(1, Ordering::Relaxed);
                info!(circuit = %self.name, "Cooldown elapsed, admitting trial call");
                Admission::Admitted(CallPermit {
                    breaker: self,
                    generation: inner.generation,
                    trial: true,
                })
            }
            CircuitState::HalfOpen => {
                match inner.trial_started_at {
                    Some(started) if now.duration_since(started) > self.config.trial_timeout => {
                        // Watchdog: the trial caller went away without
                        // resolving (cancelled). Count it as a failed trial.
                        warn!(circuit = %self.name, "Half-open trial expired, re-opening circuit");
                        inner.generation += 1;
                        inner.trial_started_at = None;
                        inner.retry_eligible_at = Some(now + self.config.cooldown);
                        self.transition(&mut inner, CircuitState::Open);
                        self.rejections.fetch_add(1, Ordering::Relaxed);
                        Admission::Rejected
                    }
                    Some(_) => {
                        // Trial slot taken - only one trial in flight.
                        self.rejections.fetch_add(1, Ordering::Relaxed);
                        debug!(circuit = %self.name, "Trial already in flight, rejecting");
                        Admission::Rejected
                    }
                    None => {
                        // Shouldn't normally happen (resolution transitions
                        // out of HalfOpen), but hand out the trial slot
                        // rather than deadlock.
                        inner.trial_started_at = Some(now);
                        self.calls_total.fetch_add(1, Ordering::Relaxed);
                        Admission::Admitted(CallPermit {
                            breaker: self,
                            generation: inner.generation,
                            trial: true,
                        })
                    }
                }
            }
        }
    }

    fn on_success(&self, generation: u64) {
        let mut inner = self.lock_inner();
        if generation != inner.generation {
            debug!(circuit = %self.name, "Ignoring stale success from abandoned trial");
            return;
        }
        self.successes.fetch_add(1, Ordering::Relaxed);
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.trial_started_at = None;
            inner.retry_eligible_at = None;
            inner.generation += 1;
            self.transition(&mut inner, CircuitState::Closed);
            info!(circuit = %self.name, "Trial succeeded, circuit closed");
        }
    }

    fn on_failure(&self, generation: u64) {
        let now = Instant::now();
        let mut inner = self.lock_inner();
        if generation != inner.generation {
            debug!(circuit = %self.name, "Ignoring stale failure from abandoned trial");
            return;
        }
        self.failures.fetch_add(1, Ordering::Relaxed);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.trial_started_at = None;
                inner.retry_eligible_at = Some(now + self.config.cooldown);
                inner.generation += 1;
                self.transition(&mut inner, CircuitState::Open);
                warn!(circuit = %self.name, "Trial failed, circuit re-opened");
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.retry_eligible_at = Some(now + self.config.cooldown);
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "Failure threshold crossed, circuit opened"
                    );
                }
            }
            CircuitState::Open => {
                // Failure recorded while already open (racing callers);
                // keep the existing retry deadline.
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        metrics::record_circuit_transition(&self.name, &from.to_string(), &to.to_string());
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Poisoning only happens if a holder panicked; the state itself
        // is still consistent (no partial transitions under the lock).
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get total number of admitted calls.
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (retry budget exhausted).
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (short-circuited).
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}
