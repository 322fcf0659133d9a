//! Persistence backend
//!
//! Every mutation the engine needs from durable state is a single atomic
//! operation on the store: decimal increments for market deltas, compare-and-
//! swap for breaker snapshots, and word-level bit-or for the dedup filter.
//! Callers never read a value, modify it and write it back.

use rust_decimal::Decimal;

use crate::errors::StoreError;

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Atomic key-value operations backing the engine's shared state
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Atomically add `delta` to the decimal under `key` (missing = 0); returns the new value
    fn increment(&self, key: &str, delta: Decimal) -> StoreResult<Decimal>;

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Replace the value only if it currently equals `expected` (`None` = absent)
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> StoreResult<bool>;

    /// Atomically OR `mask` into the u64 under `key`; returns the previous word
    fn fetch_or(&self, key: &str, mask: u64) -> StoreResult<u64>;

    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    fn remove_prefix(&self, prefix: &str) -> StoreResult<usize>;

    fn flush(&self) -> StoreResult<()>;
}

/// Decimal values are stored in rust_decimal's 16-byte form
pub(crate) fn encode_decimal(value: Decimal) -> [u8; 16] {
    value.serialize()
}

pub(crate) fn decode_decimal(key: &str, bytes: &[u8]) -> StoreResult<Decimal> {
    let raw: [u8; 16] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(key.to_string()))?;
    Ok(Decimal::deserialize(raw))
}

pub(crate) fn decode_u64(key: &str, bytes: &[u8]) -> StoreResult<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(key.to_string()))?;
    Ok(u64::from_le_bytes(raw))
}

/// Read a decimal written by [`StateStore::increment`]
pub fn get_decimal(store: &dyn StateStore, key: &str) -> StoreResult<Option<Decimal>> {
    store
        .get(key)?
        .map(|bytes| decode_decimal(key, &bytes))
        .transpose()
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share; run against each implementation

    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    pub fn increments_are_cumulative(store: &dyn StateStore) {
        assert_eq!(store.increment("k", dec!(1.5)).unwrap(), dec!(1.5));
        assert_eq!(store.increment("k", dec!(-0.5)).unwrap(), dec!(1.0));
        assert_eq!(get_decimal(store, "k").unwrap(), Some(dec!(1.0)));
        assert_eq!(get_decimal(store, "missing").unwrap(), None);
    }

    pub fn compare_and_swap_semantics(store: &dyn StateStore) {
        assert!(store.compare_and_swap("c", None, Some(b"v1")).unwrap());
        assert!(!store.compare_and_swap("c", None, Some(b"v2")).unwrap());
        assert!(!store.compare_and_swap("c", Some(b"nope"), Some(b"v2")).unwrap());
        assert!(store.compare_and_swap("c", Some(b"v1"), Some(b"v2")).unwrap());
        assert_eq!(store.get("c").unwrap().as_deref(), Some(&b"v2"[..]));
        assert!(store.compare_and_swap("c", Some(b"v2"), None).unwrap());
        assert_eq!(store.get("c").unwrap(), None);
    }

    pub fn fetch_or_returns_previous(store: &dyn StateStore) {
        assert_eq!(store.fetch_or("w", 0b01).unwrap(), 0);
        assert_eq!(store.fetch_or("w", 0b10).unwrap(), 0b01);
        assert_eq!(store.fetch_or("w", 0b10).unwrap(), 0b11);
    }

    pub fn prefix_operations(store: &dyn StateStore) {
        store.put("p/a", b"1").unwrap();
        store.put("p/b", b"2").unwrap();
        store.put("q/a", b"3").unwrap();

        let mut scanned = store.scan_prefix("p/").unwrap();
        scanned.sort();
        assert_eq!(
            scanned,
            vec![("p/a".to_string(), b"1".to_vec()), ("p/b".to_string(), b"2".to_vec())]
        );
        assert_eq!(store.remove_prefix("p/").unwrap(), 2);
        assert!(store.scan_prefix("p/").unwrap().is_empty());
        assert!(store.get("q/a").unwrap().is_some());
    }

    pub fn overflowing_increment_is_refused(store: &dyn StateStore) {
        assert_eq!(store.increment("big", Decimal::MAX).unwrap(), Decimal::MAX);
        assert!(matches!(
            store.increment("big", dec!(1)),
            Err(StoreError::Overflow(key)) if key == "big"
        ));
        assert_eq!(get_decimal(store, "big").unwrap(), Some(Decimal::MAX));
        assert_eq!(store.increment("big", dec!(-1)).unwrap(), Decimal::MAX - dec!(1));
    }

    pub fn concurrent_increments_never_lose_updates(store: Arc<dyn StateStore>) {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        store.increment("hot", dec!(0.1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(get_decimal(store.as_ref(), "hot").unwrap(), Some(dec!(200.0)));
    }
}
