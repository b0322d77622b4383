//! Entity identity.
//!
//! Entities are the nodes of the structural tree that conditions hang off. Their ids
//! are derived from the entity path, so the same tree always yields the same ids and
//! condition keys are stable across processes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Deterministic 32-bit entity identifier.
///
/// The id is the leading four bytes of the blake3 digest of the entity path. The
/// tree rejects paths whose ids collide, which lets the rest of the engine treat
/// id equality as identity.
///
/// # Examples
///
/// ```
/// use iovcond::EntityId;
///
/// let a = EntityId::from_path("/world/VP");
/// assert_eq!(a, EntityId::from_path("/world/VP"));
/// assert_ne!(a, EntityId::from_path("/world/IT"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u32);

impl EntityId {
    /// Derives the id of an entity from its path.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        Self(digest32(path.as_bytes()))
    }

    /// Creates an id from its raw value.
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

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Leading 32 bits of the blake3 digest of `bytes`, little-endian.
pub(crate) fn digest32(bytes: &[u8]) -> u32 {
    let hash = blake3::hash(bytes);
    let b = hash.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
