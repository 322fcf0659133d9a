//! Property checks for fee bids and dedup membership

use proptest::prelude::*;

use bundle_engine::config::{DedupConfig, FeeConfig};
use bundle_engine::dedup::{BloomFilter, Deduplicator};
use bundle_engine::fees::{Escalation, FeeEstimator};

fn estimator(floor: u64, ceiling: u64, paid: &[u64]) -> FeeEstimator {
    let fees = FeeEstimator::new(
        FeeConfig {
            floor,
            ceiling,
            history_capacity: 16,
            ..FeeConfig::default()
        },
        Escalation {
            factor: 1.5,
            max: 4.0,
        },
    );
    for &fee in paid {
        fees.record_paid(fee);
    }
    fees
}

proptest! {
    #[test]
    fn estimate_is_monotonic_and_bounded(
        paid in prop::collection::vec(0u64..5_000_000, 0..40),
        floor in 0u64..50_000,
        span in 0u64..2_000_000,
        v1 in 0.01f64..20.0,
        v2 in 0.01f64..20.0,
    ) {
        let ceiling = floor + span;
        let fees = estimator(floor, ceiling, &paid);
        let (lo, hi) = if v1 <= v2 { (v1, v2) } else { (v2, v1) };

        let a = fees.estimate(lo);
        let b = fees.estimate(hi);
        prop_assert!(a <= b, "estimate({lo}) = {a} > estimate({hi}) = {b}");
        prop_assert!((floor..=ceiling).contains(&a));
        prop_assert!((floor..=ceiling).contains(&b));
    }

    #[test]
    fn bid_never_decreases_with_attempt(
        paid in prop::collection::vec(0u64..500_000, 0..20),
        volatility in 0.1f64..5.0,
        attempt in 1u32..10,
    ) {
        let fees = estimator(1_000, 1_000_000, &paid);
        let now = fees.bid(volatility, attempt);
        let next = fees.bid(volatility, attempt + 1);
        prop_assert!(next >= now);
        prop_assert!(now <= fees.ceiling() && now >= fees.floor());
    }

    #[test]
    fn bloom_has_no_false_negatives(
        ids in prop::collection::hash_set("[a-z0-9-]{1,24}", 1..300),
    ) {
        let mut filter = BloomFilter::with_rate(500, 0.01);
        for id in &ids {
            filter.insert(id);
        }
        for id in &ids {
            prop_assert!(filter.contains(id), "lost {id}");
        }
    }

    #[test]
    fn marked_ids_are_always_seen(
        ids in prop::collection::vec("[A-Za-z0-9]{4,16}", 1..100),
    ) {
        let dedup = Deduplicator::new(DedupConfig::default());
        for id in &ids {
            dedup.mark_seen(id);
        }
        for id in &ids {
            prop_assert!(dedup.seen(id));
            prop_assert!(!dedup.check_and_mark(id));
        }
    }
}
