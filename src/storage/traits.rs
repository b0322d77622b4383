//! Abstract storage trait for condition backends.
//!
//! The backing store owns persisted conditions and their payload schema. The engine
//! only asks it one question: which condition is valid for this key at this IOV.

use thiserror::Error;

use crate::condition::{Condition, ConditionKey};
use crate::iov::Iov;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Transient failure; the same query may succeed later.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The connection to the backend is gone.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The backend refused a write.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StorageError {
    /// True if retrying the same request may help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::ConnectionLost(_))
    }

    /// True if the backend cannot be reached at all.
    #[must_use]
    pub const fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

/// Storage trait for condition lookups.
///
/// # Contract
/// - A returned condition has the requested key and a validity containing `iov`.
///   The manager checks this and drops violators, but never repairs them.
/// - `Ok(None)` means the store has no value for this IOV; it is not an error.
/// - Implementations must be safe to call from several threads at once.
pub trait ConditionStore: Send + Sync {
    /// Find the condition for `key` valid at `iov`.
    fn lookup(&self, key: ConditionKey, iov: &Iov) -> Result<Option<Condition>, StorageError>;
}
