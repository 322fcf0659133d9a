//! Engine state surviving a restart on the sled backend

mod common;

use rust_decimal_macros::dec;
use std::sync::Arc;

use bundle_engine::breaker::BreakerState;
use bundle_engine::errors::ErrorKind;
use bundle_engine::simulation::{RelayStep, ScriptedRelay};
use bundle_engine::storage::{SledStore, StateStore};

use common::{buy, engine_with_store, position, sell, test_config};

fn open(dir: &tempfile::TempDir) -> Arc<dyn StateStore> {
    Arc::new(SledStore::open(dir.path().join("state")).unwrap())
}

#[tokio::test]
async fn test_positions_and_dedup_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let e = engine_with_store(test_config(), ScriptedRelay::new(), open(&dir));
        assert!(e.router.execute_order(buy("X", dec!(3), "p-1")).await.succeeded);
        assert!(e.router.execute_order(sell("X", dec!(1.25), "p-2")).await.succeeded);
        assert!(e.router.execute_order(buy("Y", dec!(0.5), "p-3")).await.succeeded);
        e.store.flush().unwrap();
    }

    let e = engine_with_store(test_config(), ScriptedRelay::new(), open(&dir));
    assert_eq!(position(&e, "X"), dec!(1.75));
    assert_eq!(position(&e, "Y"), dec!(0.5));

    let replay = e.router.execute_order(buy("X", dec!(3), "p-1")).await;
    assert_eq!(replay.error, Some(ErrorKind::Duplicate));
    assert_eq!(e.relay.network_calls(), 0);
    assert_eq!(position(&e, "X"), dec!(1.75));

    assert!(e.router.execute_order(buy("X", dec!(1), "p-4")).await.succeeded);
    assert_eq!(position(&e, "X"), dec!(2.75));
}

#[tokio::test]
async fn test_tripped_breaker_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.router.max_attempts = 1;
    config.breaker.failure_threshold = 2;

    {
        let e = engine_with_store(
            config.clone(),
            ScriptedRelay::scripted([RelayStep::Reject, RelayStep::Expire]),
            open(&dir),
        );
        e.router.execute_order(buy("X", dec!(1), "t-1")).await;
        e.router.execute_order(buy("X", dec!(1), "t-2")).await;
        assert_eq!(e.router.breaker_health().state, BreakerState::Open);
        e.store.flush().unwrap();
    }

    let e = engine_with_store(config, ScriptedRelay::new(), open(&dir));
    let health = e.router.breaker_health();
    assert_eq!(health.state, BreakerState::Open);
    assert_eq!(health.consecutive_failures, 2);
    assert!(health.tripped_at.is_some());

    let outcome = e.router.execute_order(buy("X", dec!(1), "t-3")).await;
    assert_eq!(outcome.error, Some(ErrorKind::CircuitOpen));
    assert_eq!(e.relay.network_calls(), 0);
}
