//! Correlation-id deduplication
//!
//! A rotating pair of bloom filters. Ids are inserted into the current
//! generation and looked up in both; when the current generation reaches its
//! TTL it becomes the previous one and the old previous one is dropped. A full
//! generation rotates early only while there is no previous generation to
//! lose; otherwise it keeps absorbing ids past capacity until its TTL. An id
//! therefore stays live for at least one TTL. Bloom filters never produce
//! false negatives, so an id that was marked is always reported as seen while
//! its generation is retained.
//!
//! With a store attached, every word touched by an insert is OR-ed into the
//! store before the insert returns, and the filter is rebuilt from the store
//! on construction.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DedupConfig;
use crate::errors::StoreError;
use crate::metrics::metrics;
use crate::storage::{decode_u64, StateStore};

const META_KEY: &str = "dedup/meta";

/// Fixed-size bloom filter with double hashing
#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    inserted: usize,
}

impl BloomFilter {
    /// Size the filter for `capacity` ids at the target false-positive rate
    pub fn with_rate(capacity: usize, false_positive_rate: f64) -> Self {
        let n = capacity.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let bits = (-(n * false_positive_rate.ln()) / (ln2 * ln2)).ceil().max(64.0);
        let num_words = ((bits as u64) + 63) / 64;
        let num_bits = num_words * 64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;

        Self {
            words: vec![0; num_words as usize],
            num_bits,
            num_hashes,
            inserted: 0,
        }
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    /// (word index, bit mask) pairs for an id
    fn positions(&self, id: &str) -> Vec<(usize, u64)> {
        let digest = Sha256::digest(id.as_bytes());
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&digest[0..8]);
        b.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(a);
        // odd step so successive bit positions never collapse onto one bit
        let h2 = u64::from_le_bytes(b) | 1;

        (0..self.num_hashes as u64)
            .map(|i| {
                let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
                ((bit / 64) as usize, 1u64 << (bit % 64))
            })
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions(id)
            .into_iter()
            .all(|(w, mask)| self.words[w] & mask != 0)
    }

    /// Set the id's bits; returns the touched words for write-through
    pub fn insert(&mut self, id: &str) -> Vec<(usize, u64)> {
        let positions = self.positions(id);
        for &(w, mask) in &positions {
            self.words[w] |= mask;
        }
        self.inserted += 1;
        positions
    }

    fn set_word(&mut self, index: usize, word: u64) {
        if let Some(slot) = self.words.get_mut(index) {
            *slot |= word;
        }
    }

    /// Estimate of distinct insertions from the fill ratio
    fn estimate_inserted(&self) -> usize {
        let set: u64 = self.words.iter().map(|w| w.count_ones() as u64).sum();
        if set == 0 {
            return 0;
        }
        let m = self.num_bits as f64;
        let k = self.num_hashes as f64;
        let fill = (set as f64 / m).min(1.0 - f64::EPSILON);
        (-(m / k) * (1.0 - fill).ln()).round() as usize
    }
}

#[derive(Debug)]
struct Generation {
    id: u64,
    started: Instant,
    started_wall_ms: i64,
    filter: BloomFilter,
}

#[derive(Debug)]
struct DedupState {
    current: Generation,
    previous: Option<Generation>,
    /// Current generation is past capacity and cannot rotate yet
    overflowing: bool,
}

impl DedupState {
    fn new(current: Generation, previous: Option<Generation>) -> Self {
        Self {
            current,
            previous,
            overflowing: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DedupMeta {
    current: u64,
    current_started_ms: i64,
    previous: Option<u64>,
}

/// Probabilistic set of processed correlation ids
#[derive(Debug)]
pub struct Deduplicator {
    config: DedupConfig,
    state: Mutex<DedupState>,
    store: Option<Arc<dyn StateStore>>,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        let current = Self::fresh_generation(&config, 0);
        Self {
            config,
            state: Mutex::new(DedupState::new(current, None)),
            store: None,
        }
    }

    /// Deduplicator that writes through to `store` and resumes from it
    pub fn with_store(config: DedupConfig, store: Arc<dyn StateStore>) -> Result<Self, StoreError> {
        let state = Self::restore(&config, store.as_ref())?;
        info!(
            generation = state.current.id,
            restored_ids = state.current.filter.inserted(),
            "Deduplicator restored from store"
        );
        Ok(Self {
            config,
            state: Mutex::new(state),
            store: Some(store),
        })
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.config.ttl_ms)
    }

    fn fresh_generation(config: &DedupConfig, id: u64) -> Generation {
        Generation {
            id,
            started: Instant::now(),
            started_wall_ms: Utc::now().timestamp_millis(),
            filter: BloomFilter::with_rate(config.capacity, config.false_positive_rate),
        }
    }

    /// Whether the id was marked within the live window
    pub fn seen(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        self.maybe_rotate(&mut state);
        Self::contains(&state, id)
    }

    /// Record the id as processed
    pub fn mark_seen(&self, id: &str) {
        let mut state = self.state.lock();
        self.maybe_rotate(&mut state);
        self.insert(&mut state, id);
    }

    /// Atomic check-and-set: true if the id was new and is now marked
    ///
    /// Two callers racing on the same id are serialized by the state lock, so
    /// at most one of them gets `true`.
    pub fn check_and_mark(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        self.maybe_rotate(&mut state);
        if Self::contains(&state, id) {
            return false;
        }
        self.insert(&mut state, id);
        true
    }

    /// Current generation number and the number of ids it holds
    pub fn generation(&self) -> (u64, usize) {
        let state = self.state.lock();
        (state.current.id, state.current.filter.inserted())
    }

    fn contains(state: &DedupState, id: &str) -> bool {
        state.current.filter.contains(id)
            || state
                .previous
                .as_ref()
                .is_some_and(|g| g.filter.contains(id))
    }

    fn insert(&self, state: &mut DedupState, id: &str) {
        let generation = state.current.id;
        let touched = state.current.filter.insert(id);

        if let Some(store) = &self.store {
            for (word, mask) in touched {
                if let Err(e) = store.fetch_or(&word_key(generation, word), mask) {
                    warn!(error = %e, generation, "Dedup write-through failed; id held in memory only");
                    break;
                }
            }
        }
    }

    fn maybe_rotate(&self, state: &mut DedupState) {
        let ttl = self.ttl();
        let age = state.current.started.elapsed();
        let full = state.current.filter.inserted() >= self.config.capacity;

        if age < ttl && !full {
            return;
        }
        // every id in the previous generation predates the current one, so it
        // is only safe to drop once the current generation is a full TTL old
        if age < ttl && state.previous.is_some() {
            if !state.overflowing {
                state.overflowing = true;
                metrics().dedup_capacity_overflows.inc();
                warn!(
                    generation = state.current.id,
                    capacity = self.config.capacity,
                    "Dedup generation over capacity before TTL; false positive rate will rise"
                );
            }
            return;
        }

        let next_id = state.current.id + 1;
        let fresh = Self::fresh_generation(&self.config, next_id);
        let retired = std::mem::replace(&mut state.current, fresh);
        state.overflowing = false;

        // Idle for two TTLs: the retiring generation is already past its window
        let dropped = if age >= ttl * 2 {
            let old_prev = state.previous.take();
            self.drop_generation(retired.id);
            old_prev
        } else {
            state.previous.replace(retired)
        };
        if let Some(old) = dropped {
            self.drop_generation(old.id);
        }

        metrics().dedup_rotations.inc();
        debug!(
            generation = next_id,
            forced_by_capacity = full,
            "Dedup generation rotated"
        );
        self.persist_meta(state);
    }

    fn drop_generation(&self, id: u64) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove_prefix(&generation_prefix(id)) {
                warn!(error = %e, generation = id, "Failed to drop dedup generation from store");
            }
        }
    }

    fn persist_meta(&self, state: &DedupState) {
        let Some(store) = &self.store else {
            return;
        };
        let meta = DedupMeta {
            current: state.current.id,
            current_started_ms: state.current.started_wall_ms,
            previous: state.previous.as_ref().map(|g| g.id),
        };
        let result = serde_json::to_vec(&meta)
            .map_err(StoreError::from)
            .and_then(|bytes| store.put(META_KEY, &bytes));
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist dedup metadata");
        }
    }

    fn restore(config: &DedupConfig, store: &dyn StateStore) -> Result<DedupState, StoreError> {
        let meta: Option<DedupMeta> = store
            .get(META_KEY)?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()?;

        let Some(meta) = meta else {
            let current = Self::fresh_generation(config, 0);
            let meta = DedupMeta {
                current: 0,
                current_started_ms: current.started_wall_ms,
                previous: None,
            };
            store.put(META_KEY, &serde_json::to_vec(&meta)?)?;
            return Ok(DedupState::new(current, None));
        };

        let wall_age_ms = (Utc::now().timestamp_millis() - meta.current_started_ms).max(0) as u64;
        let started = Instant::now()
            .checked_sub(Duration::from_millis(wall_age_ms))
            .unwrap_or_else(Instant::now);

        let mut current = Generation {
            id: meta.current,
            started,
            started_wall_ms: meta.current_started_ms,
            filter: BloomFilter::with_rate(config.capacity, config.false_positive_rate),
        };
        Self::load_words(store, &mut current)?;

        let previous = match meta.previous {
            Some(id) => {
                let mut generation = Generation {
                    id,
                    started,
                    started_wall_ms: meta.current_started_ms,
                    filter: BloomFilter::with_rate(config.capacity, config.false_positive_rate),
                };
                Self::load_words(store, &mut generation)?;
                Some(generation)
            }
            None => None,
        };

        Ok(DedupState::new(current, previous))
    }

    fn load_words(store: &dyn StateStore, generation: &mut Generation) -> Result<(), StoreError> {
        let prefix = generation_prefix(generation.id);
        for (key, value) in store.scan_prefix(&prefix)? {
            let index: usize = key[prefix.len()..]
                .parse()
                .map_err(|_| StoreError::Corrupt(key.clone()))?;
            generation.filter.set_word(index, decode_u64(&key, &value)?);
        }
        generation.filter.inserted = generation.filter.estimate_inserted();
        Ok(())
    }
}

fn generation_prefix(generation: u64) -> String {
    format!("dedup/{generation:020}/")
}

fn word_key(generation: u64, word: usize) -> String {
    format!("dedup/{generation:020}/{word}")
}
