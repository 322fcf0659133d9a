//! Order routing
//!
//! `OrderRouter` turns one intent into at most `max_attempts` bundles and
//! exactly one [`OrderOutcome`]. Per intent the route is
//!
//! `Idle → CheckingDedup → Building → Bidding → Submitting → Monitoring`
//!
//! and then `Confirmed`, `Retrying` (back to `Building` with a fresh
//! transaction and a higher bid) or `Aborted`. The dedup mark is taken before
//! any network call, and market state is touched only after a confirmation.
//!
//! Every suspension point (signing session, build, submit, confirmation wait,
//! backoff) is bounded by its stage timeout, the optional intent deadline and
//! the caller's cancellation token.

use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::breaker::{Admission, BreakerHealth, CircuitBreaker, TrialTicket};
use crate::collaborators::TransactionBuilder;
use crate::config::RouterConfig;
use crate::dedup::Deduplicator;
use crate::errors::{ErrorKind, MarketError};
use crate::fees::FeeEstimator;
use crate::market::MarketStateCache;
use crate::metrics::{metrics, Timer};
use crate::observability::CorrelationId;
use crate::relay::BundleRelay;
use crate::signing::SigningModule;
use crate::structured_logging::OrderLogger;
use crate::types::{
    AttemptRecord, BundleDescriptor, ConfirmationStatus, MarketState, OrderIntent, OrderOutcome,
    SlotRange,
};

/// Per-intent route state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    Idle,
    CheckingDedup,
    Building,
    Bidding,
    Submitting,
    Monitoring,
    Retrying,
    Confirmed,
    Aborted,
}

/// Observer events; delivery never blocks the router
#[derive(Debug, Clone)]
pub enum RouterEvent {
    StateChanged {
        correlation_id: CorrelationId,
        state: RouteState,
        attempt: u32,
    },
    AttemptFailed {
        correlation_id: CorrelationId,
        record: AttemptRecord,
    },
    Finished(OrderOutcome),
}

/// Shared engine state and collaborators a router drives
#[derive(Clone)]
pub struct RouterComponents {
    pub dedup: Arc<Deduplicator>,
    pub market: Arc<MarketStateCache>,
    pub fees: Arc<FeeEstimator>,
    pub breaker: Arc<CircuitBreaker>,
    pub builder: Arc<dyn TransactionBuilder>,
    pub relay: Arc<dyn BundleRelay>,
    pub signer: Arc<dyn SigningModule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    /// Caller cancelled or the intent deadline passed
    Cancelled,
    /// The stage's own timeout elapsed
    StageTimeout,
}

enum AttemptResult {
    Confirmed(String),
    Failed { kind: ErrorKind, detail: String },
    Cancelled,
}

struct AttemptReport {
    slot_range: Option<SlotRange>,
    result: AttemptResult,
}

impl AttemptReport {
    fn failed(slot_range: Option<SlotRange>, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            slot_range,
            result: AttemptResult::Failed {
                kind,
                detail: detail.into(),
            },
        }
    }

    fn cancelled(slot_range: Option<SlotRange>) -> Self {
        Self {
            slot_range,
            result: AttemptResult::Cancelled,
        }
    }
}

/// Reports relay verdicts to the breaker on behalf of one intent
///
/// Holds the half-open trial ticket when the intent was admitted as the
/// trial; the first verdict spends it and later ones are ordinary. An unspent
/// ticket is released on drop.
struct BreakerVerdicts<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<TrialTicket>,
}

impl<'a> BreakerVerdicts<'a> {
    fn new(breaker: &'a CircuitBreaker, admission: Admission) -> Self {
        let trial = match admission {
            Admission::Trial(ticket) => Some(ticket),
            Admission::Allowed | Admission::Denied => None,
        };
        Self { breaker, trial }
    }

    fn success(&mut self) {
        match self.trial.take() {
            Some(ticket) => self.breaker.record_trial_success(ticket),
            None => self.breaker.record_success(),
        }
    }

    fn failure(&mut self) {
        match self.trial.take() {
            Some(ticket) => self.breaker.record_trial_failure(ticket),
            None => self.breaker.record_failure(),
        }
    }
}

impl Drop for BreakerVerdicts<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.trial.take() {
            self.breaker.release_trial(ticket);
        }
    }
}

pub struct OrderRouter {
    config: RouterConfig,
    dedup: Arc<Deduplicator>,
    market: Arc<MarketStateCache>,
    fees: Arc<FeeEstimator>,
    breaker: Arc<CircuitBreaker>,
    builder: Arc<dyn TransactionBuilder>,
    relay: Arc<dyn BundleRelay>,
    signer: Arc<dyn SigningModule>,
    events: broadcast::Sender<RouterEvent>,
}

impl OrderRouter {
    pub fn new(config: RouterConfig, components: RouterComponents) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            config,
            dedup: components.dedup,
            market: components.market,
            fees: components.fees,
            breaker: components.breaker,
            builder: components.builder,
            relay: components.relay,
            signer: components.signer,
            events,
        }
    }

    /// Observe state changes and outcomes; slow receivers lag instead of blocking
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    pub fn market_state(&self, instrument: &str) -> Result<Option<MarketState>, MarketError> {
        self.market.get(instrument)
    }

    pub fn breaker_health(&self) -> BreakerHealth {
        self.breaker.health()
    }

    /// Route an intent to a terminal outcome
    pub async fn execute_order(&self, intent: OrderIntent) -> OrderOutcome {
        self.execute_order_with_cancel(intent, CancellationToken::new())
            .await
    }

    /// Route an intent; cancelling `cancel` aborts it with `Cancelled`
    #[instrument(
        skip_all,
        fields(correlation_id = %intent.correlation_id(), instrument = intent.instrument())
    )]
    pub async fn execute_order_with_cancel(
        &self,
        intent: OrderIntent,
        cancel: CancellationToken,
    ) -> OrderOutcome {
        let started = Instant::now();
        let m = metrics();
        m.orders_total.inc();
        m.inflight_orders.inc();
        let _inflight = scopeguard::guard((), |_| metrics().inflight_orders.dec());

        let logger = OrderLogger::new(&intent);
        let outcome = self.route(&intent, &cancel, started, &logger).await;

        match outcome.error {
            None => {
                m.orders_confirmed.inc();
                logger.log_confirmed(&outcome);
            }
            Some(kind) => {
                m.orders_failed.with_label_values(&[kind.as_str()]).inc();
                logger.log_aborted(&outcome);
            }
        }
        m.order_latency.observe(outcome.latency_ms as f64 / 1_000.0);
        self.emit(RouterEvent::Finished(outcome.clone()));
        outcome
    }

    async fn route(
        &self,
        intent: &OrderIntent,
        cancel: &CancellationToken,
        started: Instant,
        logger: &OrderLogger,
    ) -> OrderOutcome {
        let cid = intent.correlation_id().clone();
        let elapsed_ms = || started.elapsed().as_millis() as u64;
        self.emit_state(&cid, RouteState::Idle, 0);

        let admission = self.breaker.admit();
        if admission == Admission::Denied {
            metrics().circuit_open_rejections.inc();
            logger.log_rejected(ErrorKind::CircuitOpen);
            self.emit_state(&cid, RouteState::Aborted, 0);
            return OrderOutcome::failed(cid, ErrorKind::CircuitOpen, elapsed_ms(), Vec::new());
        }
        let mut verdicts = BreakerVerdicts::new(&self.breaker, admission);

        self.emit_state(&cid, RouteState::CheckingDedup, 0);
        if !self.dedup.check_and_mark(cid.as_str()) {
            metrics().duplicates_rejected.inc();
            logger.log_rejected(ErrorKind::Duplicate);
            self.emit_state(&cid, RouteState::Aborted, 0);
            return OrderOutcome::failed(cid, ErrorKind::Duplicate, elapsed_ms(), Vec::new());
        }
        logger.log_accepted(&intent.quantity().to_string(), intent.max_slippage_bps());

        let deadline = self.config.intent_deadline().map(|d| started + d);
        let mut history = Vec::with_capacity(self.config.max_attempts as usize);
        let mut previous_bid = None;

        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 && self.breaker.is_tripped() {
                metrics().circuit_open_rejections.inc();
                self.emit_state(&cid, RouteState::Aborted, attempt);
                return OrderOutcome::failed(cid, ErrorKind::CircuitOpen, elapsed_ms(), history);
            }

            let bid = self.next_bid(intent, attempt, previous_bid);
            previous_bid = Some(bid);

            let report = self
                .attempt(intent, attempt, bid, cancel, deadline, logger)
                .await;
            let record = |error| AttemptRecord {
                attempt,
                fee_bid: bid,
                slot_range: report.slot_range,
                error,
            };

            match report.result {
                AttemptResult::Confirmed(signature) => {
                    history.push(record(None));
                    self.settle(intent, bid, logger);
                    verdicts.success();
                    self.emit_state(&cid, RouteState::Confirmed, attempt);
                    return OrderOutcome::confirmed(cid, signature, elapsed_ms(), bid, history);
                }
                AttemptResult::Cancelled => {
                    history.push(record(Some(ErrorKind::Cancelled)));
                    self.emit_state(&cid, RouteState::Aborted, attempt);
                    return OrderOutcome::failed(cid, ErrorKind::Cancelled, elapsed_ms(), history);
                }
                AttemptResult::Failed { kind, detail } => {
                    let failed = record(Some(kind));
                    history.push(failed.clone());
                    metrics()
                        .attempt_failures
                        .with_label_values(&[kind.as_str()])
                        .inc();
                    logger.log_attempt_failed(attempt, bid, kind, &detail);
                    self.emit(RouterEvent::AttemptFailed {
                        correlation_id: cid.clone(),
                        record: failed,
                    });

                    if kind.counts_against_relay() {
                        verdicts.failure();
                    }
                    if !kind.is_retryable() {
                        self.emit_state(&cid, RouteState::Aborted, attempt);
                        return OrderOutcome::failed(cid, kind, elapsed_ms(), history);
                    }
                    if attempt == self.config.max_attempts {
                        break;
                    }

                    self.emit_state(&cid, RouteState::Retrying, attempt);
                    let delay = self.backoff(attempt);
                    logger.log_backoff(attempt, delay.as_millis() as u64);
                    if self.pause(delay, cancel, deadline).await.is_err() {
                        self.emit_state(&cid, RouteState::Aborted, attempt);
                        return OrderOutcome::failed(
                            cid,
                            ErrorKind::Cancelled,
                            elapsed_ms(),
                            history,
                        );
                    }
                }
            }
        }

        self.emit_state(&cid, RouteState::Aborted, self.config.max_attempts);
        OrderOutcome::failed(cid, ErrorKind::Exhausted, elapsed_ms(), history)
    }

    /// One Building → Monitoring pass with a fresh transaction
    async fn attempt(
        &self,
        intent: &OrderIntent,
        attempt: u32,
        bid: u64,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        logger: &OrderLogger,
    ) -> AttemptReport {
        let cid = intent.correlation_id();
        let span = logger.attempt_span(attempt);

        self.emit_state(cid, RouteState::Building, attempt);
        let built = self
            .bounded(cancel, deadline, self.config.build_timeout(), async {
                let session = self.signer.acquire().await?;
                let timer = Timer::new();
                let payload = self.builder.build_transaction(intent, bid, &session).await;
                timer.observe_duration(&metrics().build_latency);
                payload
            })
            .await;

        let payload = match built {
            Err(Interrupt::Cancelled) => return AttemptReport::cancelled(None),
            Err(Interrupt::StageTimeout) => {
                return AttemptReport::failed(
                    None,
                    ErrorKind::TransientLookupFailure,
                    "transaction build timed out",
                )
            }
            Ok(Err(e)) => return AttemptReport::failed(None, e.kind(), e.to_string()),
            Ok(Ok(payload)) => payload,
        };

        self.emit_state(cid, RouteState::Bidding, attempt);
        let validity = payload.validity.clamped(self.config.max_validity_slots);
        if validity != payload.validity {
            debug!(
                requested = payload.validity.width(),
                allowed = self.config.max_validity_slots,
                "Validity range clamped"
            );
        }
        let bundle = BundleDescriptor {
            payload_bytes: payload.bytes,
            fee_bid: bid,
            validity_slot_range: validity,
        };
        metrics().fee_bid.observe(bid as f64);
        metrics().attempts_total.inc();

        self.emit_state(cid, RouteState::Submitting, attempt);
        self.fees.mark_sent();
        let submitted = self
            .bounded(
                cancel,
                deadline,
                self.config.submit_timeout(),
                self.relay.submit_bundle(&bundle),
            )
            .await;

        let handle = match submitted {
            Err(Interrupt::Cancelled) => return AttemptReport::cancelled(Some(validity)),
            Err(Interrupt::StageTimeout) => {
                return AttemptReport::failed(
                    Some(validity),
                    ErrorKind::RelayUnavailable,
                    "bundle submission timed out",
                )
            }
            Ok(Err(e)) => return AttemptReport::failed(Some(validity), e.kind(), e.to_string()),
            Ok(Ok(handle)) => handle,
        };
        logger.log_attempt_submitted(&span, attempt, bid, validity);

        self.emit_state(cid, RouteState::Monitoring, attempt);
        let confirm_timeout = self.config.confirm_timeout();
        let verdict = self
            .bounded(
                cancel,
                deadline,
                confirm_timeout,
                self.relay.await_confirmation(&handle, confirm_timeout),
            )
            .await;

        let result = match verdict {
            Err(Interrupt::Cancelled) => AttemptResult::Cancelled,
            Err(Interrupt::StageTimeout) | Ok(ConfirmationStatus::TimedOut) => AttemptResult::Failed {
                kind: ErrorKind::TimedOut,
                detail: format!("no verdict for {handle} within {}ms", confirm_timeout.as_millis()),
            },
            Ok(ConfirmationStatus::Confirmed(signature)) => AttemptResult::Confirmed(signature),
            Ok(ConfirmationStatus::Rejected(reason)) => AttemptResult::Failed {
                kind: ErrorKind::BundleRejected,
                detail: reason,
            },
            Ok(ConfirmationStatus::Expired) => AttemptResult::Failed {
                kind: ErrorKind::BundleExpired,
                detail: format!(
                    "slots {}..={} elapsed before inclusion",
                    validity.min_slot, validity.max_slot
                ),
            },
        };

        AttemptReport {
            slot_range: Some(validity),
            result,
        }
    }

    /// Side effects of a confirmed bundle, applied exactly once per intent
    fn settle(&self, intent: &OrderIntent, fee_paid: u64, logger: &OrderLogger) {
        let delta = intent.signed_quantity();
        if let Err(e) = self.market.apply_delta(intent.instrument(), delta, -delta) {
            logger.error(&format!("market state update failed after confirmation: {e}"));
        }
        self.fees.record_paid(fee_paid);
    }

    /// Escalated bid, strictly above the previous attempt's until the ceiling
    fn next_bid(&self, intent: &OrderIntent, attempt: u32, previous: Option<u64>) -> u64 {
        let bid = self.fees.bid(intent.volatility_factor(), attempt);
        match previous {
            Some(prev) => bid.max(prev.saturating_add(1)).min(self.fees.ceiling()),
            None => bid,
        }
    }

    /// Exponential backoff: base * 2^attempt, capped, with jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.config.backoff_base_ms as f64 * 2_f64.powi(attempt as i32);
        let capped = exp.min(self.config.backoff_max_ms as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Run a stage under its timeout, the intent deadline and the cancel token
    async fn bounded<F: Future>(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        timeout: Duration,
        stage: F,
    ) -> Result<F::Output, Interrupt> {
        let stage_limit = Instant::now() + timeout;
        let (limit, hit) = match deadline {
            Some(d) if d <= stage_limit => (d, Interrupt::Cancelled),
            _ => (stage_limit, Interrupt::StageTimeout),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            res = tokio::time::timeout_at(limit, stage) => res.map_err(|_| hit),
        }
    }

    /// Cancellation-aware backoff sleep
    async fn pause(
        &self,
        delay: Duration,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), Interrupt> {
        let wake = Instant::now() + delay;
        if deadline.is_some_and(|d| d <= wake) {
            return Err(Interrupt::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep_until(wake) => Ok(()),
        }
    }

    fn emit(&self, event: RouterEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_state(&self, cid: &CorrelationId, state: RouteState, attempt: u32) {
        self.emit(RouterEvent::StateChanged {
            correlation_id: cid.clone(),
            state,
            attempt,
        });
    }
}
