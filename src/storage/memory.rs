//! In-memory storage backend.
//!
//! Thread-safe implementation of [`ConditionStore`] for embedded usage, tests, and as
//! a reference for real backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::condition::{Condition, ConditionFlags, ConditionKey};
use crate::iov::Iov;
use crate::storage::traits::{ConditionStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory condition store.
///
/// Several conditions may be stored for one key with different (even overlapping)
/// validity windows. A lookup returns the narrowest window that contains the
/// requested IOV; ties go to the most recently inserted.
#[derive(Debug, Default)]
pub struct InMemoryConditionStore {
    state: RwLock<HashMap<ConditionKey, Vec<Condition>>>,
    lookups: AtomicU64,
}

impl InMemoryConditionStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store from a batch of conditions.
    ///
    /// # Errors
    ///
    /// Fails on the first condition `insert` rejects.
    pub fn from_conditions(conditions: impl IntoIterator<Item = Condition>) -> Result<Self, StorageError> {
        let store = Self::new();
        for condition in conditions {
            store.insert(condition)?;
        }
        Ok(store)
    }

    /// Loads a store from a JSON array of conditions.
    ///
    /// # Errors
    ///
    /// Returns `SerializationError` for malformed JSON, or the `insert` error of the
    /// first rejected condition.
    pub fn from_json_str(json: &str) -> Result<Self, StorageError> {
        let conditions: Vec<Condition> =
            serde_json::from_str(json).map_err(|e| StorageError::SerializationError(e.to_string()))?;
        Self::from_conditions(conditions)
    }

    /// Stores a raw condition.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` for derived conditions: computed values are scoped to the
    /// resolution that produced them and are never persisted.
    pub fn insert(&self, condition: Condition) -> Result<(), StorageError> {
        if condition.test_flag(ConditionFlags::DERIVED) {
            return Err(StorageError::Rejected(format!(
                "derived condition '{}' {} cannot be stored",
                condition.name, condition.key
            )));
        }
        let mut state = self.state.write().map_err(|_| lock_err("condition.insert"))?;
        state.entry(condition.key).or_default().push(condition);
        Ok(())
    }

    /// Removes every stored condition for a key. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn remove(&self, key: ConditionKey) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("condition.remove"))?;
        Ok(state.remove(&key).map_or(0, |v| v.len()))
    }

    /// Number of stored conditions.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("condition.len"))?;
        Ok(state.values().map(Vec::len).sum())
    }

    /// Number of `lookup` calls served so far.
    #[must_use]
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl ConditionStore for InMemoryConditionStore {
    fn lookup(&self, key: ConditionKey, iov: &Iov) -> Result<Option<Condition>, StorageError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read().map_err(|_| lock_err("condition.lookup"))?;
        let Some(candidates) = state.get(&key) else {
            return Ok(None);
        };
        let best = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_valid_for(iov))
            .min_by_key(|(idx, c)| (c.validity.range.width(), std::cmp::Reverse(*idx)))
            .map(|(_, c)| c.clone());
        Ok(best)
    }
}
