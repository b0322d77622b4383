//! IOV-indexed condition cache.
//!
//! Policy:
//! - A lookup is served by a cached condition of the same key whose validity contains
//!   the requested IOV (so IOV types never mix). The most recently used match wins.
//! - Inserting a condition drops the cached entries of the same key whose validity it
//!   covers; they can never be chosen over it again.
//! - At most `per_key` windows are kept per key and `capacity` entries overall; both
//!   bounds evict the least recently used entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::condition::{Condition, ConditionKey};
use crate::error::{CondError, CondResult};
use crate::iov::Iov;

fn lock_err(context: &'static str) -> CondError {
    CondError::internal(format!("poisoned lock: {context}"))
}

#[derive(Debug)]
struct Entry {
    condition: Arc<Condition>,
    tick: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    by_key: HashMap<ConditionKey, Vec<Entry>>,
    // tick -> key; the first entry is the least recently used condition.
    recency: BTreeMap<u64, ConditionKey>,
    next_tick: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove_tick(&mut self, key: ConditionKey, tick: u64) {
        self.recency.remove(&tick);
        if let Some(entries) = self.by_key.get_mut(&key) {
            entries.retain(|e| e.tick != tick);
            if entries.is_empty() {
                self.by_key.remove(&key);
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct ConditionCache {
    state: Mutex<CacheState>,
    capacity: usize,
    per_key: usize,
}

impl ConditionCache {
    pub(crate) fn new(capacity: usize, per_key: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
            per_key: per_key.max(1),
        }
    }

    /// Cached condition for `key` covering `iov`, refreshing its recency.
    pub(crate) fn lookup(&self, key: ConditionKey, iov: &Iov) -> CondResult<Option<Arc<Condition>>> {
        let mut state = self.state.lock().map_err(|_| lock_err("cache.lookup"))?;
        let hit = state.by_key.get(&key).and_then(|entries| {
            entries
                .iter()
                .filter(|e| e.condition.is_valid_for(iov))
                .max_by_key(|e| e.tick)
                .map(|e| (e.tick, Arc::clone(&e.condition)))
        });
        let Some((old_tick, condition)) = hit else {
            return Ok(None);
        };

        let new_tick = state.tick();
        state.recency.remove(&old_tick);
        state.recency.insert(new_tick, key);
        if let Some(entry) = state
            .by_key
            .get_mut(&key)
            .and_then(|entries| entries.iter_mut().find(|e| e.tick == old_tick))
        {
            entry.tick = new_tick;
        }
        Ok(Some(condition))
    }

    /// Inserts a resolved condition. Returns the number of entries evicted or superseded.
    pub(crate) fn insert(&self, condition: Arc<Condition>) -> CondResult<usize> {
        let mut state = self.state.lock().map_err(|_| lock_err("cache.insert"))?;
        let key = condition.key;
        let mut dropped = 0;

        let superseded: Vec<u64> = state
            .by_key
            .get(&key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| condition.validity.contains(&e.condition.validity))
                    .map(|e| e.tick)
                    .collect()
            })
            .unwrap_or_default();
        for tick in superseded {
            state.remove_tick(key, tick);
            dropped += 1;
        }

        let tick = state.tick();
        state.recency.insert(tick, key);
        state.by_key.entry(key).or_default().push(Entry { condition, tick });

        let over_key = state.by_key.get(&key).map_or(0, |e| e.len().saturating_sub(self.per_key));
        for _ in 0..over_key {
            let oldest = state
                .by_key
                .get(&key)
                .and_then(|entries| entries.iter().map(|e| e.tick).min());
            if let Some(oldest) = oldest {
                state.remove_tick(key, oldest);
                dropped += 1;
            }
        }

        while state.recency.len() > self.capacity {
            let Some((tick, victim)) = state.recency.pop_first() else {
                break;
            };
            state.remove_tick(victim, tick);
            dropped += 1;
            debug!(key = %victim, "evicted least recently used condition");
        }

        Ok(dropped)
    }

    /// Drops every cached window of a key. Returns how many were dropped.
    pub(crate) fn invalidate(&self, key: ConditionKey) -> CondResult<usize> {
        let mut state = self.state.lock().map_err(|_| lock_err("cache.invalidate"))?;
        let Some(entries) = state.by_key.remove(&key) else {
            return Ok(0);
        };
        for e in &entries {
            state.recency.remove(&e.tick);
        }
        Ok(entries.len())
    }

    pub(crate) fn clear(&self) -> CondResult<()> {
        let mut state = self.state.lock().map_err(|_| lock_err("cache.clear"))?;
        state.by_key.clear();
        state.recency.clear();
        Ok(())
    }

    pub(crate) fn len(&self) -> CondResult<usize> {
        let state = self.state.lock().map_err(|_| lock_err("cache.len"))?;
        Ok(state.recency.len())
    }
}
