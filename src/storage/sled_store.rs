//! Durable store on sled
//!
//! Increments and bit-ors go through `update_and_fetch` / `fetch_and_update`,
//! which retry a CAS loop inside sled, so concurrent writers never lose an
//! update and the application never does its own read-modify-write.

use rust_decimal::Decimal;
use std::path::Path;

use super::{decode_decimal, decode_u64, encode_decimal, StateStore, StoreResult};
use crate::errors::StoreError;

#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory sled instance, removed on drop
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl StateStore for SledStore {
    fn increment(&self, key: &str, delta: Decimal) -> StoreResult<Decimal> {
        // the closure may run more than once; only the last verdict counts
        let mut refused: Option<StoreError> = None;
        let updated = self.db.update_and_fetch(key, |old| {
            refused = None;
            let current = match old {
                None => Decimal::ZERO,
                Some(bytes) => match decode_decimal(key, bytes) {
                    Ok(v) => v,
                    Err(e) => {
                        refused = Some(e);
                        return Some(bytes.to_vec());
                    }
                },
            };
            match current.checked_add(delta) {
                Some(next) => Some(encode_decimal(next).to_vec()),
                None => {
                    refused = Some(StoreError::Overflow(key.to_string()));
                    old.map(|bytes| bytes.to_vec())
                }
            }
        })?;

        if let Some(e) = refused {
            return Err(e);
        }
        match updated {
            Some(bytes) => decode_decimal(key, &bytes),
            None => Err(StoreError::Corrupt(key.to_string())),
        }
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> StoreResult<bool> {
        Ok(self.db.compare_and_swap(key, expected, new)?.is_ok())
    }

    fn fetch_or(&self, key: &str, mask: u64) -> StoreResult<u64> {
        let mut corrupt = false;
        let previous = self.db.fetch_and_update(key, |old| {
            let current = match old {
                None => 0,
                Some(bytes) => match decode_u64(key, bytes) {
                    Ok(v) => v,
                    Err(_) => {
                        corrupt = true;
                        return Some(bytes.to_vec());
                    }
                },
            };
            corrupt = false;
            Some((current | mask).to_le_bytes().to_vec())
        })?;

        if corrupt {
            return Err(StoreError::Corrupt(key.to_string()));
        }
        previous.map_or(Ok(0), |bytes| decode_u64(key, &bytes))
    }

    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item?;
            let key = String::from_utf8(k.to_vec())
                .map_err(|_| StoreError::Corrupt(format!("{prefix}*")))?;
            out.push((key, v.to_vec()));
        }
        Ok(out)
    }

    fn remove_prefix(&self, prefix: &str) -> StoreResult<usize> {
        let mut removed = 0;
        for item in self.db.scan_prefix(prefix).keys() {
            let key = item?;
            if self.db.remove(key)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{contract, get_decimal};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    #[test]
    fn test_store_contract() {
        let store = SledStore::temporary().unwrap();
        contract::increments_are_cumulative(&store);
        contract::compare_and_swap_semantics(&store);
        contract::fetch_or_returns_previous(&store);
        contract::prefix_operations(&store);
        contract::overflowing_increment_is_refused(&store);
    }

    #[test]
    fn test_concurrent_increments() {
        let store: Arc<dyn StateStore> = Arc::new(SledStore::temporary().unwrap());
        contract::concurrent_increments_never_lose_updates(store);
    }

    #[test]
    fn test_corrupt_counter_is_reported() {
        let store = SledStore::temporary().unwrap();
        store.put("bad", b"xyz").unwrap();
        assert!(matches!(
            store.increment("bad", dec!(1)),
            Err(StoreError::Corrupt(_))
        ));
        // Value left untouched
        assert_eq!(store.get("bad").unwrap().as_deref(), Some(&b"xyz"[..]));
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.increment("market/X/position", dec!(3)).unwrap();
            store.flush().unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(
            get_decimal(&store, "market/X/position").unwrap(),
            Some(dec!(3))
        );
    }
}
