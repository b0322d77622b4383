//! Per-request working set of resolved conditions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::condition::{Condition, ConditionKey, ItemCode};
use crate::content::ConditionsContent;
use crate::entity::EntityId;
use crate::error::ResolutionError;
use crate::iov::Iov;

/// Identifier of a slice, used to correlate log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceId(Uuid);

impl SliceId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolved conditions of one content for one IOV.
///
/// A slice is owned by the call scope that created it and is never shared while
/// being filled. Reusing a slice is allowed: every `prepare` clears the pool and
/// rebinds the slice to the new IOV, so no entry from an earlier IOV survives.
///
/// Two invariants hold for every pooled condition, enforced on insert:
/// its key is declared in the content, and its validity contains the slice IOV.
#[derive(Debug)]
pub struct ConditionsSlice {
    id: SliceId,
    content: Arc<ConditionsContent>,
    iov: Option<Iov>,
    pool: HashMap<ConditionKey, Arc<Condition>>,
}

impl ConditionsSlice {
    /// Creates an empty slice over shared content.
    #[must_use]
    pub fn new(content: Arc<ConditionsContent>) -> Self {
        Self {
            id: SliceId::new(),
            content,
            iov: None,
            pool: HashMap::new(),
        }
    }

    /// Identifier used in logs.
    #[must_use]
    pub const fn id(&self) -> SliceId {
        self.id
    }

    /// Content this slice resolves.
    #[must_use]
    pub const fn content(&self) -> &Arc<ConditionsContent> {
        &self.content
    }

    /// IOV of the last `prepare`, if any.
    #[must_use]
    pub const fn iov(&self) -> Option<&Iov> {
        self.iov.as_ref()
    }

    /// Resolved condition for `(entity, item)`.
    #[must_use]
    pub fn get(&self, entity: EntityId, item: ItemCode) -> Option<&Arc<Condition>> {
        self.get_key(&ConditionKey::new(entity, item))
    }

    /// Resolved condition for a key.
    #[must_use]
    pub fn get_key(&self, key: &ConditionKey) -> Option<&Arc<Condition>> {
        self.pool.get(key)
    }

    /// Iterates over the pool in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Condition>> {
        self.pool.values()
    }

    /// Number of resolved conditions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// True if nothing is resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Clears the pool and binds the slice to `iov`.
    pub(crate) fn reset(&mut self, iov: Iov) {
        self.pool.clear();
        self.iov = Some(iov);
    }

    /// Adds a resolved condition, enforcing the pool invariants.
    pub(crate) fn insert(&mut self, condition: Arc<Condition>) -> Result<(), ResolutionError> {
        let key = condition.key;
        if !self.content.contains(&key) {
            return Err(ResolutionError::UndeclaredKey { key });
        }
        if let Some(iov) = &self.iov {
            if !condition.is_valid_for(iov) {
                return Err(ResolutionError::StaleCondition {
                    key,
                    validity: condition.validity.to_string(),
                    requested: iov.to_string(),
                });
            }
        }
        self.pool.insert(key, condition);
        Ok(())
    }
}
