//! Dynamic tip calculation
//!
//! Bids start from an exponential moving average over a fixed-capacity ring
//! of recently paid tips, then scale by the intent's volatility factor, by how
//! long the engine has been idle, and by the attempt number. The result is
//! always clamped to `[floor, ceiling]`.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{FeeConfig, RouterConfig};

/// Per-attempt bid multiplier `min(attempt * factor, max)`
#[derive(Debug, Clone, Copy)]
pub struct Escalation {
    pub factor: f64,
    pub max: f64,
}

impl Escalation {
    pub fn multiplier(&self, attempt: u32) -> f64 {
        (attempt.max(1) as f64 * self.factor).min(self.max)
    }
}

impl From<&RouterConfig> for Escalation {
    fn from(config: &RouterConfig) -> Self {
        Self {
            factor: config.escalation_factor,
            max: config.max_escalation,
        }
    }
}

impl Default for Escalation {
    fn default() -> Self {
        Self::from(&RouterConfig::default())
    }
}

#[derive(Debug)]
struct FeeHistory {
    paid: VecDeque<u64>,
    last_sent: Option<Instant>,
}

#[derive(Debug)]
pub struct FeeEstimator {
    config: FeeConfig,
    escalation: Escalation,
    history: Mutex<FeeHistory>,
}

impl FeeEstimator {
    pub fn new(config: FeeConfig, escalation: Escalation) -> Self {
        let capacity = config.history_capacity;
        Self {
            config,
            escalation,
            history: Mutex::new(FeeHistory {
                paid: VecDeque::with_capacity(capacity),
                last_sent: None,
            }),
        }
    }

    /// Bid for a first attempt
    pub fn estimate(&self, volatility_factor: f64) -> u64 {
        self.clamp(self.raw_estimate(volatility_factor))
    }

    /// Bid for the given attempt number (1-based)
    pub fn bid(&self, volatility_factor: f64, attempt: u32) -> u64 {
        let multiplier = self.escalation.multiplier(attempt);
        self.clamp(self.raw_estimate(volatility_factor) * multiplier)
    }

    /// Record the tip of a confirmed bundle
    pub fn record_paid(&self, fee: u64) {
        let mut history = self.history.lock();
        if history.paid.len() >= self.config.history_capacity {
            history.paid.pop_front();
        }
        history.paid.push_back(fee);
    }

    /// Record that a bundle was just submitted
    pub fn mark_sent(&self) {
        self.history.lock().last_sent = Some(Instant::now());
    }

    /// Smoothed baseline before any scaling
    pub fn baseline(&self) -> f64 {
        let history = self.history.lock();
        self.ema(&history.paid)
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().paid.len()
    }

    pub fn floor(&self) -> u64 {
        self.config.floor
    }

    pub fn ceiling(&self) -> u64 {
        self.config.ceiling
    }

    fn raw_estimate(&self, volatility_factor: f64) -> f64 {
        let history = self.history.lock();
        let baseline = self.ema(&history.paid);
        let idle = self.idle_factor(history.last_sent);
        baseline * volatility_factor * idle
    }

    fn ema(&self, paid: &VecDeque<u64>) -> f64 {
        let alpha = self.config.ema_alpha;
        let mut samples = paid.iter().map(|&f| f as f64);
        match samples.next() {
            None => self.config.base_fee as f64,
            Some(first) => samples.fold(first, |ema, s| alpha * s + (1.0 - alpha) * ema),
        }
    }

    /// 1.0 until the idle threshold passes, then linear growth up to the cap
    fn idle_factor(&self, last_sent: Option<Instant>) -> f64 {
        let Some(sent) = last_sent else {
            return 1.0;
        };
        let threshold = Duration::from_millis(self.config.idle_threshold_ms);
        let idle = sent.elapsed();
        if idle <= threshold {
            return 1.0;
        }
        let periods = idle.as_secs_f64() / threshold.as_secs_f64() - 1.0;
        (1.0 + self.config.idle_boost_per_threshold * periods).min(self.config.max_idle_multiplier)
    }

    fn clamp(&self, raw: f64) -> u64 {
        // NaN and negatives land on the floor; saturating cast for +inf
        (raw.round() as u64).clamp(self.config.floor, self.config.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> FeeEstimator {
        FeeEstimator::new(
            FeeConfig {
                base_fee: 10_000,
                floor: 1_000,
                ceiling: 100_000,
                history_capacity: 4,
                ema_alpha: 0.2,
                idle_threshold_ms: 1_000,
                idle_boost_per_threshold: 0.5,
                max_idle_multiplier: 2.0,
            },
            Escalation {
                factor: 1.0,
                max: 3.0,
            },
        )
    }

    #[test]
    fn test_base_fee_without_history() {
        let fees = estimator();
        assert_eq!(fees.estimate(1.0), 10_000);
        assert_eq!(fees.estimate(2.0), 20_000);
    }

    #[test]
    fn test_ema_weights_recent_samples() {
        let fees = estimator();
        fees.record_paid(10_000);
        fees.record_paid(20_000);
        // 0.2 * 20000 + 0.8 * 10000
        assert_eq!(fees.estimate(1.0), 12_000);
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let fees = estimator();
        for fee in [90_000, 5_000, 5_000, 5_000, 5_000] {
            fees.record_paid(fee);
        }
        assert_eq!(fees.history_len(), 4);
        assert_eq!(fees.estimate(1.0), 5_000);
    }

    #[test]
    fn test_clamped_to_bounds() {
        let fees = estimator();
        assert_eq!(fees.estimate(0.01), 1_000);
        assert_eq!(fees.estimate(1_000.0), 100_000);
        assert_eq!(fees.estimate(f64::NAN), 1_000);
        assert_eq!(fees.estimate(f64::INFINITY), 100_000);
    }

    #[test]
    fn test_escalation_is_capped() {
        let fees = estimator();
        assert_eq!(fees.bid(1.0, 1), 10_000);
        assert_eq!(fees.bid(1.0, 2), 20_000);
        assert_eq!(fees.bid(1.0, 3), 30_000);
        assert_eq!(fees.bid(1.0, 7), 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_factor_grows_then_caps() {
        let fees = estimator();
        assert_eq!(fees.estimate(1.0), 10_000);

        fees.mark_sent();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(fees.estimate(1.0), 10_000);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        // one threshold past: 1 + 0.5
        assert_eq!(fees.estimate(1.0), 15_000);

        tokio::time::advance(Duration::from_millis(10_000)).await;
        assert_eq!(fees.estimate(1.0), 20_000);

        fees.mark_sent();
        assert_eq!(fees.estimate(1.0), 10_000);
    }
}
