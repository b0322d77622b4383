//! Error types for iovcond.
//!
//! Errors are split by how far they are allowed to travel:
//! - [`ValidationError`]: rejected input (bad IOV ranges, duplicate entities, bad config).
//! - [`ResolutionError`]: a failure local to one key or one entity. These never abort a
//!   `prepare` or `compute` call; they are recorded as diagnostics and counted as missing.
//! - [`CondError`]: the top-level error for the few operations that can fail as a whole.

use thiserror::Error;

use crate::condition::ConditionKey;
use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid IOV range: start ({start}) must not be after end ({end})")]
    InvalidIovRange {
        start: i64,
        end: i64,
    },

    #[error("Unknown IOV type: {name}")]
    UnknownIovType {
        name: String,
    },

    #[error("Entity name cannot be empty")]
    EmptyEntityName,

    #[error("Entity name '{name}' must not contain '/'")]
    InvalidEntityName {
        name: String,
    },

    #[error("Entity '{path}' collides with existing entity '{existing}' (id {id:08X})")]
    DuplicateEntity {
        path: String,
        existing: String,
        id: u32,
    },

    #[error("Unknown entity id {id:08X}")]
    UnknownEntity {
        id: u32,
    },

    #[error("Invalid configuration field '{field}': {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },
}

/// Per-key or per-entity failures.
///
/// A `ResolutionError` is never returned from `prepare` or `compute`; it is attached to a
/// [`Diagnostic`](crate::result::Diagnostic) and the affected key is counted as missing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("no value for {key} in cache, store or rules")]
    UnresolvedKey {
        key: ConditionKey,
    },

    #[error("malformed payload: expected {expected}, found {found}")]
    MalformedPayload {
        expected: String,
        found: String,
    },

    #[error("backing store unavailable after {attempts} attempt(s): {reason}")]
    StoreUnavailable {
        attempts: u32,
        reason: String,
    },

    #[error("invalid tree extension: {reason}")]
    InvalidTreeExtension {
        reason: String,
    },

    #[error("parent alignment of {parent} is unresolved")]
    MissingParent {
        parent: String,
    },

    #[error("{key} is not declared in the slice content")]
    UndeclaredKey {
        key: ConditionKey,
    },

    #[error("condition for {key} is valid for {validity}, which does not cover {requested}")]
    StaleCondition {
        key: ConditionKey,
        validity: String,
        requested: String,
    },

    #[error("entity is not reachable from the tree root")]
    Unreachable,

    #[error("deadline expired before the key was resolved")]
    Timeout,
}

impl ResolutionError {
    /// Creates a malformed payload error.
    #[must_use]
    pub fn malformed(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::MalformedPayload {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Returns true if this failure is ordinary sparseness rather than a fault.
    ///
    /// Conditions are routinely absent for some entities in some IOVs; operators only
    /// need to look at the other variants.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        matches!(self, Self::UnresolvedKey { .. })
    }
}

/// Top-level error type for iovcond.
#[derive(Debug, Error)]
pub enum CondError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl CondError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Storage(e) => e.is_transient(),
        }
    }
}

/// Result type alias for iovcond operations.
pub type CondResult<T> = Result<T, CondError>;
