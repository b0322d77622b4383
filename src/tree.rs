//! Structural tree seam.
//!
//! The engine never owns the tree; it only needs to walk it parent-before-children
//! and to ask each entity which conditions it owns. [`StructuralTree`] is that
//! contract. [`DetectorTree`] is the in-memory implementation used for embedded use
//! and tests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::error::ValidationError;

/// Condition catalog attached to an entity.
///
/// Lists the items the entity owns, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Items resolved from the backing store.
    #[serde(default)]
    pub conditions: Vec<String>,

    /// Items taken from the store if present, otherwise computed by a manager rule.
    #[serde(default)]
    pub on_demand: Vec<String>,

    /// Name of the entity's alignment delta condition, if it is aligned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<String>,
}

impl Catalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stored item.
    #[must_use]
    pub fn condition(mut self, name: impl Into<String>) -> Self {
        self.conditions.push(name.into());
        self
    }

    /// Adds an on-demand item.
    #[must_use]
    pub fn on_demand(mut self, name: impl Into<String>) -> Self {
        self.on_demand.push(name.into());
        self
    }

    /// Marks the entity as aligned through the named delta condition.
    #[must_use]
    pub fn aligned(mut self, delta_condition: impl Into<String>) -> Self {
        self.alignment = Some(delta_condition.into());
        self
    }
}

/// Per-entity descriptor, keyed by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Extension {
    /// Condition catalog.
    Catalog(Catalog),

    /// A descriptor of some other kind, unknown to the engine.
    Opaque {
        /// Descriptor kind name.
        name: String,
    },
}

impl Extension {
    /// Returns the catalog, if this is one.
    #[must_use]
    pub const fn as_catalog(&self) -> Option<&Catalog> {
        match self {
            Self::Catalog(c) => Some(c),
            Self::Opaque { .. } => None,
        }
    }

    /// Descriptor kind name.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Catalog(_) => "catalog",
            Self::Opaque { name } => name,
        }
    }
}

/// Read-only view of a hierarchical structure.
///
/// Children are returned in a stable order; walks built on this trait are pre-order.
pub trait StructuralTree: Send + Sync {
    /// Root entity.
    fn root(&self) -> EntityId;

    /// Ordered children of an entity. Unknown entities have none.
    fn children(&self, entity: EntityId) -> Vec<EntityId>;

    /// Parent of an entity. `None` for the root and unknown entities.
    fn parent(&self, entity: EntityId) -> Option<EntityId>;

    /// Full path of an entity, e.g. `/world/VP/module_00`.
    fn path(&self, entity: EntityId) -> Option<String>;

    /// Descriptor attached to an entity.
    fn extension(&self, entity: EntityId) -> Option<&Extension>;
}

/// Pre-order walk from `root`, returning `(entity, depth)` pairs.
///
/// Every entity is visited after its parent and before its children.
#[must_use]
pub fn preorder(tree: &dyn StructuralTree, root: EntityId) -> Vec<(EntityId, usize)> {
    let mut out = Vec::new();
    let mut stack = vec![(root, 0usize)];
    while let Some((entity, depth)) = stack.pop() {
        out.push((entity, depth));
        // Reverse so the first child is popped first.
        for child in tree.children(entity).into_iter().rev() {
            stack.push((child, depth + 1));
        }
    }
    out
}

/// Path of an entity for diagnostics, falling back to its id.
pub(crate) fn display_path(tree: &dyn StructuralTree, entity: EntityId) -> String {
    tree.path(entity).unwrap_or_else(|| format!("<{entity}>"))
}

#[derive(Debug, Clone)]
struct Node {
    path: String,
    parent: Option<EntityId>,
    children: Vec<EntityId>,
    extension: Option<Extension>,
}

/// In-memory structural tree.
///
/// Entity ids are derived from paths; adding an entity whose id collides with an
/// existing one fails, so ids are unique within a tree.
///
/// # Examples
///
/// ```
/// use iovcond::{Catalog, DetectorTree, Extension, StructuralTree};
///
/// let mut tree = DetectorTree::new("world").unwrap();
/// let vp = tree.add_child(tree.root(), "VP").unwrap();
/// tree.set_extension(vp, Extension::Catalog(Catalog::new().aligned("VPSystem"))).unwrap();
/// assert_eq!(tree.path(vp).as_deref(), Some("/world/VP"));
/// ```
#[derive(Debug, Clone)]
pub struct DetectorTree {
    root: EntityId,
    nodes: HashMap<EntityId, Node>,
}

impl DetectorTree {
    /// Creates a tree holding only its root.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if the root name is empty or contains `/`.
    pub fn new(root_name: &str) -> Result<Self, ValidationError> {
        validate_name(root_name)?;
        let path = format!("/{root_name}");
        let root = EntityId::from_path(&path);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                path,
                parent: None,
                children: Vec::new(),
                extension: None,
            },
        );
        Ok(Self { root, nodes })
    }

    /// Adds a child entity under `parent`.
    ///
    /// # Errors
    ///
    /// - `UnknownEntity` if `parent` is not in the tree
    /// - `EmptyEntityName` / `InvalidEntityName` for bad names
    /// - `DuplicateEntity` if the derived id is already taken
    pub fn add_child(&mut self, parent: EntityId, name: &str) -> Result<EntityId, ValidationError> {
        validate_name(name)?;
        let parent_path = self
            .nodes
            .get(&parent)
            .map(|n| n.path.clone())
            .ok_or(ValidationError::UnknownEntity { id: parent.raw() })?;
        let path = format!("{parent_path}/{name}");
        let id = EntityId::from_path(&path);
        if let Some(existing) = self.nodes.get(&id) {
            return Err(ValidationError::DuplicateEntity {
                path,
                existing: existing.path.clone(),
                id: id.raw(),
            });
        }
        self.nodes.insert(
            id,
            Node {
                path,
                parent: Some(parent),
                children: Vec::new(),
                extension: None,
            },
        );
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(id);
        }
        Ok(id)
    }

    /// Attaches (or replaces) the descriptor of an entity.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity` if the entity is not in the tree.
    pub fn set_extension(&mut self, entity: EntityId, extension: Extension) -> Result<(), ValidationError> {
        let node = self
            .nodes
            .get_mut(&entity)
            .ok_or(ValidationError::UnknownEntity { id: entity.raw() })?;
        node.extension = Some(extension);
        Ok(())
    }

    /// Looks up an entity by path.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<EntityId> {
        let id = EntityId::from_path(path);
        self.nodes.get(&id).filter(|n| n.path == path).map(|_| id)
    }

    /// Number of entities, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a tree has at least its root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl StructuralTree for DetectorTree {
    fn root(&self) -> EntityId {
        self.root
    }

    fn children(&self, entity: EntityId) -> Vec<EntityId> {
        self.nodes
            .get(&entity)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn parent(&self, entity: EntityId) -> Option<EntityId> {
        self.nodes.get(&entity).and_then(|n| n.parent)
    }

    fn path(&self, entity: EntityId) -> Option<String> {
        self.nodes.get(&entity).map(|n| n.path.clone())
    }

    fn extension(&self, entity: EntityId) -> Option<&Extension> {
        self.nodes.get(&entity).and_then(|n| n.extension.as_ref())
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyEntityName);
    }
    if name.contains('/') {
        return Err(ValidationError::InvalidEntityName {
            name: name.to_string(),
        });
    }
    Ok(())
}
