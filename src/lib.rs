//! # iovcond - Conditions resolution and dependency computation
//!
//! iovcond resolves time-scoped *conditions* (calibration constants, alignment
//! corrections, environmental readings) attached to the entities of a structural
//! tree, for a requested Interval Of Validity (IOV).
//!
//! ## Core Concepts
//!
//! - **Iov**: a typed, inclusive `[start, end]` window over which a value is valid
//! - **ConditionKey**: `(entity, item)` pair naming one condition of one entity
//! - **ConditionsContent**: the set of keys a consumer needs, built once from the tree
//! - **ConditionsSlice**: the resolved values of a content for one IOV
//! - **ConditionsManager**: resolves a slice from its IOV cache, the backing store and
//!   on-demand rules
//! - **DependencyCalculator**: derives absolute alignments from per-entity deltas by
//!   walking the tree
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use iovcond::{
//!     build_content, collect_deltas, Catalog, Condition, ConditionKey, ConditionsManager,
//!     ConditionsSlice, Delta, DependencyCalculator, DetectorTree, Extension,
//!     InMemoryConditionStore, Iov, IovType, ItemCode, StructuralTree, TranslationComposition,
//! };
//!
//! let mut tree = DetectorTree::new("world")?;
//! let root = tree.root();
//! let vp = tree.add_child(root, "VP")?;
//! tree.set_extension(root, Extension::Catalog(Catalog::new()))?;
//! tree.set_extension(vp, Extension::Catalog(Catalog::new().aligned("VPSystem")))?;
//! let tree = Arc::new(tree);
//!
//! let store = Arc::new(InMemoryConditionStore::new());
//! store.insert(Condition::raw(
//!     ConditionKey::new(vp, ItemCode::ALIGNMENT_DELTA),
//!     "VPSystem",
//!     Iov::new(IovType::RUN, 0, 100)?,
//!     Delta::translation(0.5, 0.0, 0.0).into(),
//! ))?;
//!
//! let content = Arc::new(build_content(tree.as_ref(), root).content);
//! let manager = ConditionsManager::new(store);
//! let mut slice = ConditionsSlice::new(content);
//! let prepared = manager.prepare(&Iov::point(IovType::RUN, 42), &mut slice);
//! assert_eq!(prepared.loaded, 1);
//!
//! let collected = collect_deltas(tree.as_ref(), root, &slice);
//! let calculator = DependencyCalculator::new(tree.clone(), TranslationComposition);
//! let computed = calculator.compute(&collected.deltas, &mut slice);
//! assert_eq!(computed.computed, 1);
//!
//! let alignment = slice.get(vp, ItemCode::ALIGNMENT).and_then(|c| c.payload.as_transform());
//! assert_eq!(alignment.map(|t| t.translation), Some([0.5, 0.0, 0.0]));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod condition;
pub mod entity;
pub mod error;
pub mod iov;
pub mod payload;
pub mod tree;

// Resolution
pub mod alignment;
pub mod content;
pub mod manager;
pub mod result;
pub mod slice;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use condition::{Condition, ConditionFlags, ConditionKey, ItemCode};
pub use entity::EntityId;
pub use error::{CondError, CondResult, ResolutionError, ValidationError};
pub use iov::{Iov, IovRange, IovType, IovTypeRegistry};
pub use payload::Payload;
pub use tree::{preorder, Catalog, DetectorTree, Extension, StructuralTree};

pub use alignment::{
    collect_deltas, CalculatorConfig, CompositionRule, Delta, DeltaCollection, Deltas,
    DependencyCalculator, Matrix3, RigidComposition, Rotation, Transform, TranslationComposition,
    Vector3,
};
pub use content::{build_content, ConditionsContent, ContentBuild, DeclaredKey, KeyOrigin};
pub use manager::{ConditionRule, ConditionsManager, DerivationContext, FnRule, ManagerConfig};
pub use result::{Diagnostic, ResolutionResult};
pub use slice::{ConditionsSlice, SliceId};
pub use storage::{ConditionStore, InMemoryConditionStore, StorageError};
