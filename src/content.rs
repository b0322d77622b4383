//! Declarative manifest of the condition keys a consumer needs.
//!
//! Content is built once per tree (or subtree) and shared read-only by every slice
//! created over it. It is a snapshot: entities that declare conditions after the
//! content was built stay invisible until the content is rebuilt.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::condition::{ConditionKey, ItemCode};
use crate::entity::EntityId;
use crate::error::ResolutionError;
use crate::result::Diagnostic;
use crate::tree::{display_path, preorder, Extension, StructuralTree};

/// How a declared key gets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyOrigin {
    /// Resolved from the manager cache or backing store.
    Stored,
    /// Taken from the store if present, otherwise computed by a manager rule.
    OnDemand,
    /// Filled in by the dependency calculator; `prepare` leaves it alone.
    Calculated,
}

/// One declared key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredKey {
    /// The key itself.
    pub key: ConditionKey,
    /// Item name as written in the catalog.
    pub name: String,
    /// How the key gets its value.
    pub origin: KeyOrigin,
}

/// Set of declared keys, grouped by entity.
#[derive(Debug, Clone, Default)]
pub struct ConditionsContent {
    entries: BTreeMap<EntityId, BTreeMap<ItemCode, DeclaredKey>>,
    len: usize,
}

impl ConditionsContent {
    /// Creates empty content.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a key. Returns false if it was already declared, in which case the
    /// first declaration wins.
    pub fn add(&mut self, key: ConditionKey, name: impl Into<String>, origin: KeyOrigin) -> bool {
        let items = self.entries.entry(key.entity).or_default();
        if items.contains_key(&key.item) {
            return false;
        }
        items.insert(
            key.item,
            DeclaredKey {
                key,
                name: name.into(),
                origin,
            },
        );
        self.len += 1;
        true
    }

    /// Declares a stored key.
    pub fn add_stored(&mut self, key: ConditionKey, name: impl Into<String>) -> bool {
        self.add(key, name, KeyOrigin::Stored)
    }

    /// True if the key is declared.
    #[must_use]
    pub fn contains(&self, key: &ConditionKey) -> bool {
        self.declared(key).is_some()
    }

    /// Returns the declaration of a key.
    #[must_use]
    pub fn declared(&self, key: &ConditionKey) -> Option<&DeclaredKey> {
        self.entries.get(&key.entity).and_then(|items| items.get(&key.item))
    }

    /// Declared keys of one entity.
    pub fn keys_of(&self, entity: EntityId) -> impl Iterator<Item = &DeclaredKey> {
        self.entries.get(&entity).into_iter().flat_map(BTreeMap::values)
    }

    /// All declarations, ordered by entity then item.
    pub fn iter(&self) -> impl Iterator<Item = &DeclaredKey> {
        self.entries.values().flat_map(BTreeMap::values)
    }

    /// Entities with at least one declared key.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entries.keys().copied()
    }

    /// Number of declared keys.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True if nothing is declared.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Output of [`build_content`].
#[derive(Debug, Default)]
pub struct ContentBuild {
    /// Declared keys.
    pub content: ConditionsContent,
    /// One entry per entity whose descriptor could not be used.
    pub diagnostics: Vec<Diagnostic>,
}

/// Walks the tree below `root` and declares every key the entity catalogs name.
///
/// Per catalog: each stored item becomes a `Stored` key, each on-demand item an
/// `OnDemand` key, and an alignment entry declares the entity's delta (`Stored`)
/// and its absolute alignment (`Calculated`). An entity without a catalog is
/// reported and skipped; its descendants are still visited.
#[must_use]
pub fn build_content(tree: &dyn StructuralTree, root: EntityId) -> ContentBuild {
    let mut build = ContentBuild::default();

    for (entity, _depth) in preorder(tree, root) {
        let catalog = match tree.extension(entity) {
            Some(Extension::Catalog(catalog)) => catalog,
            other => {
                let reason = match other {
                    Some(ext) => format!("expected a catalog, found a '{}' descriptor", ext.kind()),
                    None => "no catalog available".to_string(),
                };
                let path = display_path(tree, entity);
                debug!(entity = %path, %reason, "skipping entity without catalog");
                build.diagnostics.push(Diagnostic::for_entity(
                    path,
                    ResolutionError::InvalidTreeExtension { reason },
                ));
                continue;
            }
        };

        let content = &mut build.content;
        for name in &catalog.conditions {
            if !content.add(ConditionKey::named(entity, name), name.as_str(), KeyOrigin::Stored) {
                warn!(entity = %display_path(tree, entity), item = %name, "item declared twice");
            }
        }
        for name in &catalog.on_demand {
            if !content.add(ConditionKey::named(entity, name), name.as_str(), KeyOrigin::OnDemand) {
                warn!(entity = %display_path(tree, entity), item = %name, "item declared twice");
            }
        }
        if let Some(delta_name) = &catalog.alignment {
            if !content.add(
                ConditionKey::new(entity, ItemCode::ALIGNMENT_DELTA),
                delta_name.as_str(),
                KeyOrigin::Stored,
            ) {
                let entity = display_path(tree, entity);
                warn!(entity = %entity, item = ItemCode::ALIGNMENT_DELTA_NAME, "item declared twice");
            }
            if !content.add(
                ConditionKey::new(entity, ItemCode::ALIGNMENT),
                ItemCode::ALIGNMENT_NAME,
                KeyOrigin::Calculated,
            ) {
                let entity = display_path(tree, entity);
                warn!(entity = %entity, item = ItemCode::ALIGNMENT_NAME, "item declared twice");
            }
        }
    }

    debug!(
        keys = build.content.len(),
        skipped = build.diagnostics.len(),
        "content built"
    );
    build
}
