//! Bundle order execution engine
//!
//! Takes already-decided order intents and drives each one to a single
//! terminal outcome: deduplicated, priced with an escalating fee bid,
//! submitted as a bundle to a relay and guarded by a circuit breaker.

pub mod breaker;
pub mod collaborators;
pub mod config;
pub mod dedup;
pub mod endpoints;
pub mod errors;
pub mod fees;
pub mod market;
pub mod metrics;
pub mod observability;
pub mod relay;
pub mod router;
pub mod signing;
pub mod simulation;
pub mod storage;
pub mod structured_logging;
pub mod types;

// Re-export commonly used types
pub use breaker::{BreakerHealth, BreakerState, CircuitBreaker};
pub use config::Config;
pub use dedup::Deduplicator;
pub use errors::ErrorKind;
pub use fees::FeeEstimator;
pub use market::MarketStateCache;
pub use router::{OrderRouter, RouterComponents, RouterEvent};
pub use types::{OrderIntent, OrderOutcome, Side};
