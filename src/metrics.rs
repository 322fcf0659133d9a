//! Metrics collection and export module

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::time::Instant;

/// Engine metrics backed by a dedicated registry
pub struct Metrics {
    registry: Registry,

    // Counters
    pub orders_total: IntCounter,
    pub orders_confirmed: IntCounter,
    pub orders_failed: IntCounterVec,
    pub attempts_total: IntCounter,
    pub attempt_failures: IntCounterVec,
    pub duplicates_rejected: IntCounter,
    pub circuit_open_rejections: IntCounter,
    pub breaker_trips: IntCounter,
    pub dedup_rotations: IntCounter,
    pub dedup_capacity_overflows: IntCounter,
    pub volatility_refreshes: IntCounter,

    // Gauges
    pub inflight_orders: IntGauge,
    pub breaker_open: IntGauge,
    pub signing_sessions_active: IntGauge,

    // Histograms
    pub order_latency: Histogram,
    pub fee_bid: Histogram,
    pub build_latency: Histogram,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let orders_total = IntCounter::with_opts(Opts::new(
            "orders_total",
            "Intents handed to execute_order",
        ))?;

        let orders_confirmed = IntCounter::with_opts(Opts::new(
            "orders_confirmed_total",
            "Intents that ended with a confirmed bundle",
        ))?;

        let orders_failed = IntCounterVec::new(
            Opts::new("orders_failed_total", "Intents that ended in failure"),
            &["kind"],
        )?;

        let attempts_total = IntCounter::with_opts(Opts::new(
            "bundle_attempts_total",
            "Bundles built and submitted",
        ))?;

        let attempt_failures = IntCounterVec::new(
            Opts::new("bundle_attempt_failures_total", "Failed submission attempts"),
            &["kind"],
        )?;

        let duplicates_rejected = IntCounter::with_opts(Opts::new(
            "duplicates_rejected_total",
            "Intents rejected by the deduplicator",
        ))?;

        let circuit_open_rejections = IntCounter::with_opts(Opts::new(
            "circuit_open_rejections_total",
            "Intents rejected while the breaker was open",
        ))?;

        let breaker_trips = IntCounter::with_opts(Opts::new(
            "breaker_trips_total",
            "Transitions of the circuit breaker into the open state",
        ))?;

        let dedup_rotations = IntCounter::with_opts(Opts::new(
            "dedup_rotations_total",
            "Deduplicator generation rotations",
        ))?;

        let dedup_capacity_overflows = IntCounter::with_opts(Opts::new(
            "dedup_capacity_overflows_total",
            "Dedup generations filled past capacity before their TTL",
        ))?;

        let volatility_refreshes = IntCounter::with_opts(Opts::new(
            "volatility_refreshes_total",
            "Volatility reads that went to the price source",
        ))?;

        let inflight_orders = IntGauge::with_opts(Opts::new(
            "inflight_orders",
            "Intents currently inside execute_order",
        ))?;

        let breaker_open = IntGauge::with_opts(Opts::new(
            "breaker_open",
            "1 while the circuit breaker is open",
        ))?;

        let signing_sessions_active = IntGauge::with_opts(Opts::new(
            "signing_sessions_active",
            "Signing sessions currently held",
        ))?;

        let order_latency = Histogram::with_opts(
            HistogramOpts::new("order_latency_seconds", "Intent start to terminal outcome")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        )?;

        let fee_bid = Histogram::with_opts(
            HistogramOpts::new("fee_bid_lamports", "Fee bid attached to each bundle").buckets(
                vec![
                    1_000.0,
                    5_000.0,
                    10_000.0,
                    50_000.0,
                    100_000.0,
                    500_000.0,
                    1_000_000.0,
                ],
            ),
        )?;

        let build_latency = Histogram::with_opts(
            HistogramOpts::new("build_latency_seconds", "Transaction build latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.02, 0.05, 0.1, 0.5]),
        )?;

        registry.register(Box::new(orders_total.clone()))?;
        registry.register(Box::new(orders_confirmed.clone()))?;
        registry.register(Box::new(orders_failed.clone()))?;
        registry.register(Box::new(attempts_total.clone()))?;
        registry.register(Box::new(attempt_failures.clone()))?;
        registry.register(Box::new(duplicates_rejected.clone()))?;
        registry.register(Box::new(circuit_open_rejections.clone()))?;
        registry.register(Box::new(breaker_trips.clone()))?;
        registry.register(Box::new(dedup_rotations.clone()))?;
        registry.register(Box::new(dedup_capacity_overflows.clone()))?;
        registry.register(Box::new(volatility_refreshes.clone()))?;
        registry.register(Box::new(inflight_orders.clone()))?;
        registry.register(Box::new(breaker_open.clone()))?;
        registry.register(Box::new(signing_sessions_active.clone()))?;
        registry.register(Box::new(order_latency.clone()))?;
        registry.register(Box::new(fee_bid.clone()))?;
        registry.register(Box::new(build_latency.clone()))?;

        Ok(Self {
            registry,
            orders_total,
            orders_confirmed,
            orders_failed,
            attempts_total,
            attempt_failures,
            duplicates_rejected,
            circuit_open_rejections,
            breaker_trips,
            dedup_rotations,
            dedup_capacity_overflows,
            volatility_refreshes,
            inflight_orders,
            breaker_open,
            signing_sessions_active,
            order_latency,
            fee_bid,
            build_latency,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in prometheus text exposition format
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
