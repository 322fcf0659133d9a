//! Non-durable store for tests and simulation
//!
//! Each operation runs under the DashMap shard lock of its key, which makes
//! increments, CAS and bit-or atomic with respect to each other.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;

use super::{decode_decimal, decode_u64, encode_decimal, StateStore, StoreResult};
use crate::errors::StoreError;

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateStore for MemoryStore {
    fn increment(&self, key: &str, delta: Decimal) -> StoreResult<Decimal> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let next = decode_decimal(key, e.get())?
                    .checked_add(delta)
                    .ok_or_else(|| StoreError::Overflow(key.to_string()))?;
                e.insert(encode_decimal(next).to_vec());
                Ok(next)
            }
            Entry::Vacant(e) => {
                e.insert(encode_decimal(delta).to_vec());
                Ok(delta)
            }
        }
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> StoreResult<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(e) => {
                if expected != Some(e.get().as_slice()) {
                    return Ok(false);
                }
                match new {
                    Some(v) => {
                        let mut e = e;
                        e.insert(v.to_vec());
                    }
                    None => {
                        e.remove();
                    }
                }
                Ok(true)
            }
            Entry::Vacant(e) => {
                if expected.is_some() {
                    return Ok(false);
                }
                if let Some(v) = new {
                    e.insert(v.to_vec());
                }
                Ok(true)
            }
        }
    }

    fn fetch_or(&self, key: &str, mask: u64) -> StoreResult<u64> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let previous = decode_u64(key, e.get())?;
                e.insert((previous | mask).to_le_bytes().to_vec());
                Ok(previous)
            }
            Entry::Vacant(e) => {
                e.insert(mask.to_le_bytes().to_vec());
                Ok(0)
            }
        }
    }

    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }

    fn remove_prefix(&self, prefix: &str) -> StoreResult<usize> {
        let mut removed = 0;
        self.entries.retain(|k, _| {
            let keep = !k.starts_with(prefix);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}
