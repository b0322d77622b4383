//! Condition keys and resolved conditions.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::entity::{digest32, EntityId};
use crate::iov::Iov;
use crate::payload::Payload;

/// Item code: the per-entity part of a condition key.
///
/// Codes of well-known items are fixed constants; every other name is hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemCode(u32);

impl ItemCode {
    /// Absolute (derived) alignment of an entity.
    pub const ALIGNMENT: Self = Self(0xA11C_0001);

    /// Raw alignment delta of an entity.
    pub const ALIGNMENT_DELTA: Self = Self(0xA11C_0002);

    /// Name of the absolute alignment item.
    pub const ALIGNMENT_NAME: &'static str = "alignment";

    /// Name of the alignment delta item.
    pub const ALIGNMENT_DELTA_NAME: &'static str = "alignment_delta";

    /// Returns the code for an item name.
    ///
    /// # Examples
    ///
    /// ```
    /// use iovcond::ItemCode;
    ///
    /// assert_eq!(ItemCode::from_name("alignment"), ItemCode::ALIGNMENT);
    /// assert_eq!(ItemCode::from_name("temperature"), ItemCode::from_name("temperature"));
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            Self::ALIGNMENT_NAME => Self::ALIGNMENT,
            Self::ALIGNMENT_DELTA_NAME => Self::ALIGNMENT_DELTA,
            other => Self(digest32(other.as_bytes())),
        }
    }

    /// Creates a code from its raw value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ItemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Cache and lookup key of a condition: `(entity, item)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConditionKey {
    /// Owning entity.
    pub entity: EntityId,

    /// Item within the entity.
    pub item: ItemCode,
}

impl ConditionKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(entity: EntityId, item: ItemCode) -> Self {
        Self { entity, item }
    }

    /// Creates a key from an item name.
    #[must_use]
    pub fn named(entity: EntityId, item: &str) -> Self {
        Self::new(entity, ItemCode::from_name(item))
    }

    /// 64-bit hash: entity id in the high word, item code in the low word.
    ///
    /// Injective, so equal hashes mean equal keys.
    #[must_use]
    pub const fn hash(&self) -> u64 {
        ((self.entity.raw() as u64) << 32) | self.item.raw() as u64
    }

    /// Inverse of [`ConditionKey::hash`].
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_hash(hash: u64) -> Self {
        Self {
            entity: EntityId::from_raw((hash >> 32) as u32),
            item: ItemCode::from_raw(hash as u32),
        }
    }
}

impl fmt::Display for ConditionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:016X}]", self.hash())
    }
}

/// Role markers of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionFlags(u32);

impl ConditionFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Loaded from the backing store.
    pub const RAW: Self = Self(1);
    /// Produced by computation, never persisted.
    pub const DERIVED: Self = Self(1 << 1);
    /// Payload is an alignment delta.
    pub const ALIGNMENT_DELTA: Self = Self(1 << 2);
    /// Payload is an absolute alignment.
    pub const ALIGNMENT: Self = Self(1 << 3);

    /// True if every flag of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ConditionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A named, typed value valid for an IOV.
///
/// Conditions are immutable once resolved and are shared as `Arc<Condition>` between
/// the manager cache and the slices that use them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Lookup key.
    pub key: ConditionKey,

    /// Item name, for diagnostics.
    pub name: String,

    /// Window for which the value is authoritative.
    pub validity: Iov,

    /// Role markers.
    #[serde(default)]
    pub flags: ConditionFlags,

    /// The value.
    pub payload: Payload,
}

impl Condition {
    /// Creates a raw condition, flagged as a delta when the payload is one.
    #[must_use]
    pub fn raw(key: ConditionKey, name: impl Into<String>, validity: Iov, payload: Payload) -> Self {
        let mut flags = ConditionFlags::RAW;
        if key.item == ItemCode::ALIGNMENT_DELTA {
            flags = flags | ConditionFlags::ALIGNMENT_DELTA;
        }
        Self {
            key,
            name: name.into(),
            validity,
            flags,
            payload,
        }
    }

    /// Creates a derived condition.
    #[must_use]
    pub fn derived(
        key: ConditionKey,
        name: impl Into<String>,
        validity: Iov,
        flags: ConditionFlags,
        payload: Payload,
    ) -> Self {
        Self {
            key,
            name: name.into(),
            validity,
            flags: flags | ConditionFlags::DERIVED,
            payload,
        }
    }

    /// True if all of `flag` is set.
    #[must_use]
    pub const fn test_flag(&self, flag: ConditionFlags) -> bool {
        self.flags.contains(flag)
    }

    /// True if this condition may serve a request for `iov`.
    #[must_use]
    pub fn is_valid_for(&self, iov: &Iov) -> bool {
        self.validity.contains(iov)
    }
}
