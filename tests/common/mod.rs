//! Shared engine wiring for integration tests

#![allow(dead_code)]

use rust_decimal::Decimal;
use std::sync::Arc;

use bundle_engine::breaker::CircuitBreaker;
use bundle_engine::config::Config;
use bundle_engine::dedup::Deduplicator;
use bundle_engine::fees::{Escalation, FeeEstimator};
use bundle_engine::market::MarketStateCache;
use bundle_engine::router::{OrderRouter, RouterComponents};
use bundle_engine::signing::KeypairSigningModule;
use bundle_engine::simulation::{ScriptedRelay, SimulatedBuilder, StaticPriceSource};
use bundle_engine::storage::{MemoryStore, StateStore};
use bundle_engine::types::{OrderIntent, Side};

pub struct TestEngine {
    pub router: Arc<OrderRouter>,
    pub relay: Arc<ScriptedRelay>,
    pub builder: Arc<SimulatedBuilder>,
    pub breaker: Arc<CircuitBreaker>,
    pub fees: Arc<FeeEstimator>,
    pub store: Arc<dyn StateStore>,
}

/// Config with short, deterministic backoff
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.router.backoff_base_ms = 10;
    config.router.backoff_max_ms = 200;
    config.router.jitter_factor = 0.0;
    config.router.confirm_timeout_ms = 1_000;
    config
}

pub fn engine(config: Config, relay: ScriptedRelay) -> TestEngine {
    engine_with_store(config, relay, Arc::new(MemoryStore::new()))
}

pub fn engine_with_store(
    config: Config,
    relay: ScriptedRelay,
    store: Arc<dyn StateStore>,
) -> TestEngine {
    let relay = Arc::new(relay);
    let builder = Arc::new(SimulatedBuilder::new(1_000));
    let breaker = Arc::new(
        CircuitBreaker::with_store(config.breaker.clone(), Arc::clone(&store)).unwrap(),
    );
    let fees = Arc::new(FeeEstimator::new(
        config.fees.clone(),
        Escalation::from(&config.router),
    ));

    let components = RouterComponents {
        dedup: Arc::new(Deduplicator::with_store(config.dedup.clone(), Arc::clone(&store)).unwrap()),
        market: Arc::new(MarketStateCache::new(
            config.market.clone(),
            Arc::clone(&store),
            Arc::new(StaticPriceSource::new(0.3)),
        )),
        fees: Arc::clone(&fees),
        breaker: Arc::clone(&breaker),
        builder: builder.clone(),
        relay: relay.clone(),
        signer: Arc::new(KeypairSigningModule::ephemeral(&config.signing)),
    };

    TestEngine {
        router: Arc::new(OrderRouter::new(config.router.clone(), components)),
        relay,
        builder,
        breaker,
        fees,
        store,
    }
}

pub fn buy(instrument: &str, quantity: Decimal, cid: &str) -> OrderIntent {
    OrderIntent::new(Side::Buy, instrument, quantity, 50, 1.0, cid).unwrap()
}

pub fn sell(instrument: &str, quantity: Decimal, cid: &str) -> OrderIntent {
    OrderIntent::new(Side::Sell, instrument, quantity, 50, 1.0, cid).unwrap()
}

pub fn position(engine: &TestEngine, instrument: &str) -> Decimal {
    engine
        .router
        .market_state(instrument)
        .unwrap()
        .map(|s| s.position_size)
        .unwrap_or(Decimal::ZERO)
}
