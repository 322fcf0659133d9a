//! Circuit breaker guarding the bundle relay
//!
//! One breaker per routing target, shared by every in-flight intent. The
//! read-decide-transition sequence of `admit` and the verdict recorders runs
//! under a single mutex, so two callers can never both hold the half-open
//! trial slot. While half-open only the verdict carrying the current
//! [`TrialTicket`] may close or re-trip the breaker.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::errors::StoreError;
use crate::metrics::metrics;
use crate::storage::StateStore;

/// Circuit Breaker State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Proof of holding the half-open trial slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialTicket(u64);

/// Result of asking the breaker for admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Admitted as the single half-open trial; must report a verdict or release it
    Trial(TrialTicket),
    Denied,
}

/// Persisted snapshot of the breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub tripped: bool,
    pub consecutive_failures: u32,
    pub tripped_at: Option<DateTime<Utc>>,
}

/// Read-only view for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub target: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub tripped_at: Option<DateTime<Utc>>,
    pub cooldown_remaining_ms: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    streak_started: Option<Instant>,
    tripped_at: Option<Instant>,
    tripped_at_wall: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    trial_epoch: u64,
    persisted: Option<Vec<u8>>,
}

impl Inner {
    fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            streak_started: None,
            tripped_at: None,
            tripped_at_wall: None,
            trial_in_flight: false,
            trial_epoch: 0,
            persisted: None,
        }
    }

    fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            tripped: self.state != BreakerState::Closed,
            consecutive_failures: self.consecutive_failures,
            tripped_at: self.tripped_at_wall,
        }
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.tripped_at = Some(Instant::now());
        self.tripped_at_wall = Some(Utc::now());
        self.trial_in_flight = false;
    }

    fn grant_trial(&mut self) -> TrialTicket {
        self.trial_in_flight = true;
        self.trial_epoch += 1;
        TrialTicket(self.trial_epoch)
    }

    /// Whether `ticket` is the outstanding trial of the current half-open phase
    fn holds_trial(&self, ticket: TrialTicket) -> bool {
        self.state == BreakerState::HalfOpen
            && self.trial_in_flight
            && self.trial_epoch == ticket.0
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    store: Option<Arc<dyn StateStore>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::closed()),
            store: None,
        }
    }

    /// Breaker whose state is snapshotted to `store` and restored from it
    pub fn with_store(config: BreakerConfig, store: Arc<dyn StateStore>) -> Result<Self, StoreError> {
        let key = state_key(&config.target);
        let mut inner = Inner::closed();

        if let Some(bytes) = store.get(&key)? {
            let snapshot: CircuitBreakerState = serde_json::from_slice(&bytes)?;
            inner.consecutive_failures = snapshot.consecutive_failures;
            if snapshot.consecutive_failures > 0 {
                inner.streak_started = Some(Instant::now());
            }
            if snapshot.tripped {
                let age = snapshot
                    .tripped_at
                    .map(|at| (Utc::now() - at).to_std().unwrap_or_default())
                    .unwrap_or_default();
                inner.state = BreakerState::Open;
                inner.tripped_at = Some(
                    Instant::now()
                        .checked_sub(age)
                        .unwrap_or_else(Instant::now),
                );
                inner.tripped_at_wall = snapshot.tripped_at.or_else(|| Some(Utc::now()));
                metrics().breaker_open.set(1);
                warn!(
                    target_name = %config.target,
                    failures = snapshot.consecutive_failures,
                    "Circuit breaker restored in tripped state"
                );
            }
            inner.persisted = Some(bytes);
        }

        Ok(Self {
            config,
            inner: Mutex::new(inner),
            store: Some(store),
        })
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.failure_window_ms)
    }

    /// Whether a new submission may proceed
    ///
    /// After the cooldown the first caller receives the half-open trial slot;
    /// every other caller is refused until that trial reports back.
    pub fn allow(&self) -> bool {
        self.admit() != Admission::Denied
    }

    /// Like [`allow`](Self::allow), but hands the trial holder its ticket
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let cooled = inner
                    .tripped_at
                    .map_or(true, |at| at.elapsed() >= self.cooldown());
                if !cooled {
                    return Admission::Denied;
                }
                inner.state = BreakerState::HalfOpen;
                let ticket = inner.grant_trial();
                debug!(target_name = %self.config.target, "Circuit breaker half-open, trial granted");
                Admission::Trial(ticket)
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Denied
                } else {
                    Admission::Trial(inner.grant_trial())
                }
            }
        }
    }

    /// Read-only check used between retries of an admitted intent
    pub fn is_tripped(&self) -> bool {
        self.inner.lock().state == BreakerState::Open
    }

    /// Success from an ordinary attempt
    ///
    /// Clears the failure streak while closed. A tripped breaker is closed
    /// only by [`record_trial_success`](Self::record_trial_success).
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures > 0 {
                    inner.consecutive_failures = 0;
                    inner.streak_started = None;
                    self.persist(&mut inner);
                }
            }
            BreakerState::Open | BreakerState::HalfOpen => {
                debug!(
                    target_name = %self.config.target,
                    state = ?inner.state,
                    "Success from pre-trip attempt ignored"
                );
            }
        }
    }

    /// Failure from an ordinary attempt
    ///
    /// Trips at the threshold while closed. While open or half-open the
    /// failure is counted but only the trial verdict may re-trip.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Open | BreakerState::HalfOpen => {
                // verdicts from attempts that were already in flight at trip time
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            }
            BreakerState::Closed => {
                let stale = inner
                    .streak_started
                    .map_or(true, |at| at.elapsed() > self.window());
                if stale {
                    inner.consecutive_failures = 0;
                    inner.streak_started = Some(Instant::now());
                }
                inner.consecutive_failures += 1;

                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.trip();
                    metrics().breaker_trips.inc();
                    metrics().breaker_open.set(1);
                    warn!(
                        target_name = %self.config.target,
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker tripped"
                    );
                }
            }
        }
        self.persist(&mut inner);
    }

    /// Success reported by the half-open trial holder; closes the breaker
    ///
    /// A ticket from an earlier half-open phase counts as an ordinary success.
    pub fn record_trial_success(&self, ticket: TrialTicket) {
        let mut inner = self.inner.lock();
        if !inner.holds_trial(ticket) {
            drop(inner);
            self.record_success();
            return;
        }

        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.streak_started = None;
        inner.tripped_at = None;
        inner.tripped_at_wall = None;
        inner.trial_in_flight = false;

        metrics().breaker_open.set(0);
        info!(target_name = %self.config.target, "Circuit breaker reset after successful trial");
        self.persist(&mut inner);
    }

    /// Failure reported by the half-open trial holder; re-trips the breaker
    ///
    /// A ticket from an earlier half-open phase counts as an ordinary failure.
    pub fn record_trial_failure(&self, ticket: TrialTicket) {
        let mut inner = self.inner.lock();
        if !inner.holds_trial(ticket) {
            drop(inner);
            self.record_failure();
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trip();
        metrics().breaker_trips.inc();
        warn!(
            target_name = %self.config.target,
            failures = inner.consecutive_failures,
            "Circuit breaker trial failed, re-tripped"
        );
        self.persist(&mut inner);
    }

    /// Return an unused trial slot (the trial ended without a relay verdict)
    pub fn release_trial(&self, ticket: TrialTicket) {
        let mut inner = self.inner.lock();
        if inner.holds_trial(ticket) {
            inner.trial_in_flight = false;
            debug!(target_name = %self.config.target, "Half-open trial released unused");
        }
    }

    pub fn health(&self) -> BreakerHealth {
        let inner = self.inner.lock();
        let cooldown_remaining_ms = match (inner.state, inner.tripped_at) {
            (BreakerState::Open, Some(at)) => {
                self.cooldown().saturating_sub(at.elapsed()).as_millis() as u64
            }
            _ => 0,
        };
        BreakerHealth {
            target: self.config.target.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            tripped_at: inner.tripped_at_wall,
            cooldown_remaining_ms,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.inner.lock().snapshot()
    }

    /// Write the snapshot with check-and-set against the last value seen
    fn persist(&self, inner: &mut Inner) {
        let Some(store) = &self.store else {
            return;
        };
        let key = state_key(&self.config.target);
        let bytes = match serde_json::to_vec(&inner.snapshot()) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Failed to encode breaker snapshot");
                return;
            }
        };

        let mut expected = inner.persisted.clone();
        for _ in 0..3 {
            match store.compare_and_swap(&key, expected.as_deref(), Some(&bytes)) {
                Ok(true) => {
                    inner.persisted = Some(bytes);
                    return;
                }
                Ok(false) => match store.get(&key) {
                    // another writer moved it; ours is the latest decision
                    Ok(current) => expected = current,
                    Err(e) => {
                        warn!(error = %e, "Failed to read breaker snapshot");
                        return;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Failed to persist breaker snapshot");
                    return;
                }
            }
        }
        warn!(key = %key, "Breaker snapshot contended, giving up");
    }
}

fn state_key(target: &str) -> String {
    format!("breaker/{target}")
}
