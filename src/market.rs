//! Per-instrument market state
//!
//! Position and liquidity live in the state store and are only ever changed
//! through [`StateStore::increment`], so routers running side by side on the
//! same instrument cannot lose each other's deltas. Volatility comes from the
//! price source and is cached for a short validity window.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::collaborators::PriceSource;
use crate::config::MarketConfig;
use crate::errors::{MarketError, StoreError};
use crate::metrics::metrics;
use crate::storage::{get_decimal, StateStore};
use crate::types::MarketState;

const PREFIX: &str = "market/";

#[derive(Debug, Clone, Copy)]
struct CachedVolatility {
    value: f64,
    fetched: Instant,
}

pub struct MarketStateCache {
    config: MarketConfig,
    store: Arc<dyn StateStore>,
    price_source: Arc<dyn PriceSource>,
    volatility: DashMap<String, CachedVolatility>,
}

impl MarketStateCache {
    pub fn new(
        config: MarketConfig,
        store: Arc<dyn StateStore>,
        price_source: Arc<dyn PriceSource>,
    ) -> Self {
        Self {
            config,
            store,
            price_source,
            volatility: DashMap::new(),
        }
    }

    /// Atomically add deltas to position and liquidity; returns the new state
    pub fn apply_delta(
        &self,
        instrument: &str,
        position_delta: Decimal,
        liquidity_delta: Decimal,
    ) -> Result<MarketState, MarketError> {
        let position_size = self
            .store
            .increment(&key(instrument, "position"), position_delta)?;
        let liquidity = self
            .store
            .increment(&key(instrument, "liquidity"), liquidity_delta)?;

        let now = Utc::now();
        self.store.put(
            &key(instrument, "updated"),
            &now.timestamp_millis().to_le_bytes(),
        )?;

        debug!(
            instrument,
            %position_delta,
            %liquidity_delta,
            %position_size,
            "Market delta applied"
        );

        Ok(MarketState {
            instrument: instrument.to_string(),
            position_size,
            liquidity,
            volatility: self.stored_volatility(instrument)?.unwrap_or(0.0),
            last_updated: now,
        })
    }

    /// Volatility from the price source, or the cached value while it is fresh
    pub async fn refresh_volatility(&self, instrument: &str) -> Result<f64, MarketError> {
        let ttl = Duration::from_millis(self.config.volatility_ttl_ms);
        if let Some(cached) = self.volatility.get(instrument) {
            if cached.fetched.elapsed() < ttl {
                return Ok(cached.value);
            }
        }

        let timeout = Duration::from_millis(self.config.price_timeout_ms);
        let value = tokio::time::timeout(timeout, self.price_source.recent_volatility(instrument))
            .await
            .map_err(|_| MarketError::PriceTimeout(self.config.price_timeout_ms))??;

        if !value.is_finite() || value < 0.0 {
            warn!(instrument, value, "Price source returned unusable volatility");
            return Err(MarketError::InvalidVolatility(value));
        }

        self.store
            .put(&key(instrument, "volatility"), &value.to_le_bytes())?;
        self.volatility.insert(
            instrument.to_string(),
            CachedVolatility {
                value,
                fetched: Instant::now(),
            },
        );
        metrics().volatility_refreshes.inc();
        debug!(instrument, volatility = value, "Volatility refreshed");

        Ok(value)
    }

    /// Current record, or `None` for an instrument never touched
    pub fn get(&self, instrument: &str) -> Result<Option<MarketState>, MarketError> {
        let position = get_decimal(self.store.as_ref(), &key(instrument, "position"))?;
        let liquidity = get_decimal(self.store.as_ref(), &key(instrument, "liquidity"))?;
        let volatility = match self.volatility.get(instrument) {
            Some(cached) => Some(cached.value),
            None => self.stored_volatility(instrument)?,
        };
        let updated = self.stored_timestamp(instrument)?;

        if position.is_none() && liquidity.is_none() && volatility.is_none() {
            return Ok(None);
        }

        Ok(Some(MarketState {
            instrument: instrument.to_string(),
            position_size: position.unwrap_or(Decimal::ZERO),
            liquidity: liquidity.unwrap_or(Decimal::ZERO),
            volatility: volatility.unwrap_or(0.0),
            last_updated: updated.unwrap_or_default(),
        }))
    }

    /// Instruments with any stored state
    pub fn instruments(&self) -> Result<Vec<String>, MarketError> {
        let names: BTreeSet<String> = self
            .store
            .scan_prefix(PREFIX)?
            .into_iter()
            .filter_map(|(k, _)| {
                let rest = k.strip_prefix(PREFIX)?;
                let (name, _) = rest.rsplit_once('/')?;
                Some(name.to_string())
            })
            .collect();
        Ok(names.into_iter().collect())
    }

    fn stored_volatility(&self, instrument: &str) -> Result<Option<f64>, MarketError> {
        let k = key(instrument, "volatility");
        match self.store.get(&k)? {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt(k.clone()))?;
                Ok(Some(f64::from_le_bytes(raw)))
            }
        }
    }

    fn stored_timestamp(&self, instrument: &str) -> Result<Option<DateTime<Utc>>, MarketError> {
        let k = key(instrument, "updated");
        match self.store.get(&k)? {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt(k.clone()))?;
                Ok(DateTime::from_timestamp_millis(i64::from_le_bytes(raw)))
            }
        }
    }
}

fn key(instrument: &str, field: &str) -> String {
    format!("{PREFIX}{instrument}/{field}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PriceSourceError;
    use crate::simulation::StaticPriceSource;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    fn cache_with(source: Arc<dyn PriceSource>) -> MarketStateCache {
        MarketStateCache::new(
            MarketConfig {
                volatility_ttl_ms: 1_000,
                price_timeout_ms: 100,
            },
            Arc::new(MemoryStore::new()),
            source,
        )
    }

    #[test]
    fn test_unknown_instrument_is_none() {
        let cache = cache_with(Arc::new(StaticPriceSource::new(0.1)));
        assert!(cache.get("X").unwrap().is_none());
    }

    #[test]
    fn test_deltas_accumulate() {
        let cache = cache_with(Arc::new(StaticPriceSource::new(0.1)));
        cache.apply_delta("X", dec!(0), dec!(100)).unwrap();
        cache.apply_delta("X", dec!(1.5), dec!(-1.5)).unwrap();
        let state = cache.apply_delta("X", dec!(-0.5), dec!(0.5)).unwrap();

        assert_eq!(state.position_size, dec!(1.0));
        assert_eq!(state.liquidity, dec!(99.0));
        let read = cache.get("X").unwrap().unwrap();
        assert_eq!(read.position_size, dec!(1.0));
        assert_eq!(read.liquidity, dec!(99.0));
        assert_eq!(cache.instruments().unwrap(), vec!["X".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deltas_are_not_lost() {
        let cache = Arc::new(cache_with(Arc::new(StaticPriceSource::new(0.1))));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.apply_delta("X", dec!(1), dec!(-1)).unwrap() })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        let state = cache.get("X").unwrap().unwrap();
        assert_eq!(state.position_size, dec!(50));
        assert_eq!(state.liquidity, dec!(-50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volatility_cached_within_ttl() {
        let source = Arc::new(StaticPriceSource::new(0.3));
        let cache = cache_with(source.clone());

        assert_eq!(cache.refresh_volatility("X").await.unwrap(), 0.3);
        source.set("X", 0.9);
        assert_eq!(cache.refresh_volatility("X").await.unwrap(), 0.3);
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(cache.refresh_volatility("X").await.unwrap(), 0.9);
        assert_eq!(source.calls(), 2);
        assert_eq!(cache.get("X").unwrap().unwrap().volatility, 0.9);
    }

    #[tokio::test]
    async fn test_invalid_volatility_rejected() {
        let source = Arc::new(StaticPriceSource::new(-1.0));
        let cache = cache_with(source);
        assert!(matches!(
            cache.refresh_volatility("X").await,
            Err(MarketError::InvalidVolatility(_))
        ));
        assert!(cache.get("X").unwrap().is_none());
    }

    struct StalledSource;

    #[async_trait]
    impl PriceSource for StalledSource {
        async fn recent_volatility(&self, _instrument: &str) -> Result<f64, PriceSourceError> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_source_timeout() {
        let cache = cache_with(Arc::new(StalledSource));
        assert!(matches!(
            cache.refresh_volatility("X").await,
            Err(MarketError::PriceTimeout(100))
        ));
    }
}
