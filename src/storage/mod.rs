//! Backing store seam and the in-memory backend.

mod memory;
mod traits;

pub use memory::InMemoryConditionStore;
pub use traits::{ConditionStore, StorageError};
