//! On-demand condition rules.
//!
//! A rule computes the payload of an `OnDemand` key that the store does not hold,
//! typically from other conditions already resolved into the slice. Rule output is
//! cached by the manager but never written to the store.

use std::fmt;
use std::sync::Arc;

use crate::condition::{Condition, ConditionKey, ItemCode};
use crate::entity::EntityId;
use crate::error::ResolutionError;
use crate::iov::Iov;
use crate::payload::Payload;
use crate::slice::ConditionsSlice;

/// Computes an on-demand condition.
pub trait ConditionRule: Send + Sync {
    /// Rule name, used in logs.
    fn name(&self) -> &str;

    /// Computes the payload for `key`.
    ///
    /// Dependencies must be read through `ctx` so the validity of the result can be
    /// narrowed to the windows of the conditions it was derived from.
    ///
    /// # Errors
    ///
    /// Any `ResolutionError`; the key is then reported missing with that cause.
    fn compute(&self, key: ConditionKey, ctx: &mut DerivationContext<'_>) -> Result<Payload, ResolutionError>;
}

/// Read-only view of a slice handed to a [`ConditionRule`].
pub struct DerivationContext<'a> {
    slice: &'a ConditionsSlice,
    iov: Iov,
    validity: Option<Iov>,
}

impl<'a> DerivationContext<'a> {
    pub(crate) const fn new(slice: &'a ConditionsSlice, iov: Iov) -> Self {
        Self {
            slice,
            iov,
            validity: None,
        }
    }

    /// IOV being prepared.
    #[must_use]
    pub const fn iov(&self) -> &Iov {
        &self.iov
    }

    /// Reads a resolved dependency, narrowing the result validity to its window.
    ///
    /// # Errors
    ///
    /// `UnresolvedKey` if the dependency is not in the slice.
    pub fn get(&mut self, key: ConditionKey) -> Result<&'a Arc<Condition>, ResolutionError> {
        let condition = self
            .slice
            .get_key(&key)
            .ok_or(ResolutionError::UnresolvedKey { key })?;
        let narrowed = match &self.validity {
            Some(current) => current.intersection(&condition.validity),
            None => Some(condition.validity),
        };
        // Every pooled condition covers the slice IOV, so the windows always intersect.
        self.validity = narrowed.or(Some(self.iov));
        Ok(condition)
    }

    /// Shorthand for [`get`](Self::get) with an entity and item.
    ///
    /// # Errors
    ///
    /// `UnresolvedKey` if the dependency is not in the slice.
    pub fn get_item(&mut self, entity: EntityId, item: ItemCode) -> Result<&'a Arc<Condition>, ResolutionError> {
        self.get(ConditionKey::new(entity, item))
    }

    /// Validity of the value being computed: the intersection of every dependency
    /// read so far, or the prepared IOV when nothing was read.
    #[must_use]
    pub fn validity(&self) -> Iov {
        self.validity.unwrap_or(self.iov)
    }
}

impl fmt::Debug for DerivationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivationContext")
            .field("slice", &self.slice.id())
            .field("iov", &self.iov)
            .field("validity", &self.validity)
            .finish()
    }
}

/// Adapts a closure into a [`ConditionRule`].
pub struct FnRule<F> {
    name: String,
    compute: F,
}

impl<F> FnRule<F>
where
    F: Fn(ConditionKey, &mut DerivationContext<'_>) -> Result<Payload, ResolutionError> + Send + Sync,
{
    /// Wraps `compute` as a rule called `name`.
    pub fn new(name: impl Into<String>, compute: F) -> Self {
        Self {
            name: name.into(),
            compute,
        }
    }
}

impl<F> ConditionRule for FnRule<F>
where
    F: Fn(ConditionKey, &mut DerivationContext<'_>) -> Result<Payload, ResolutionError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(&self, key: ConditionKey, ctx: &mut DerivationContext<'_>) -> Result<Payload, ResolutionError> {
        (self.compute)(key, ctx)
    }
}
