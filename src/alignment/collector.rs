//! Gathers the alignment deltas of a prepared slice.

use std::sync::Arc;

use tracing::debug;

use super::Deltas;
use crate::condition::{ConditionKey, ItemCode};
use crate::entity::EntityId;
use crate::error::ResolutionError;
use crate::result::Diagnostic;
use crate::slice::ConditionsSlice;
use crate::tree::{display_path, preorder, Extension, StructuralTree};

/// Output of [`collect_deltas`].
#[derive(Debug, Default)]
pub struct DeltaCollection {
    /// Resolved deltas by entity.
    pub deltas: Deltas,
    /// Aligned entities without a delta, and entities without a catalog.
    pub diagnostics: Vec<Diagnostic>,
}

/// Collects `(entity, ALIGNMENT_DELTA)` from `slice` for every aligned entity below
/// `root`.
///
/// Entities whose catalog has no alignment entry are ignored. Entities without a
/// catalog, and aligned entities whose delta was not resolved, are reported.
#[must_use]
pub fn collect_deltas(tree: &dyn StructuralTree, root: EntityId, slice: &ConditionsSlice) -> DeltaCollection {
    let mut out = DeltaCollection::default();

    for (entity, _depth) in preorder(tree, root) {
        match tree.extension(entity) {
            Some(Extension::Catalog(catalog)) if catalog.alignment.is_some() => {
                let key = ConditionKey::new(entity, ItemCode::ALIGNMENT_DELTA);
                match slice.get_key(&key) {
                    Some(delta) => {
                        out.deltas.insert(entity, Arc::clone(delta));
                    }
                    None => out.diagnostics.push(
                        Diagnostic::for_key(key, ResolutionError::UnresolvedKey { key }).at(display_path(tree, entity)),
                    ),
                }
            }
            Some(Extension::Catalog(_)) => {}
            other => {
                let reason = other.map_or_else(
                    || "no catalog available".to_string(),
                    |ext| format!("expected a catalog, found a '{}' descriptor", ext.kind()),
                );
                out.diagnostics.push(Diagnostic::for_entity(
                    display_path(tree, entity),
                    ResolutionError::InvalidTreeExtension { reason },
                ));
            }
        }
    }

    debug!(deltas = out.deltas.len(), issues = out.diagnostics.len(), "deltas collected");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::Delta;
    use crate::condition::Condition;
    use crate::content::build_content;
    use crate::iov::{Iov, IovType};
    use crate::tree::{Catalog, DetectorTree};

    #[test]
    fn test_collects_resolved_deltas_and_reports_gaps() {
        let mut tree = DetectorTree::new("world").unwrap();
        let root = tree.root();
        let a = tree.add_child(root, "A").unwrap();
        let b = tree.add_child(root, "B").unwrap();
        let bare = tree.add_child(root, "bare").unwrap();
        tree.set_extension(root, Extension::Catalog(Catalog::new().condition("temperature"))).unwrap();
        tree.set_extension(a, Extension::Catalog(Catalog::new().aligned("delta"))).unwrap();
        tree.set_extension(b, Extension::Catalog(Catalog::new().aligned("delta"))).unwrap();
        tree.set_extension(bare, Extension::Opaque { name: "readout".into() }).unwrap();

        let content = build_content(&tree, root).content;
        let mut slice = ConditionsSlice::new(Arc::new(content));
        slice.reset(Iov::point(IovType::RUN, 1));
        let key = ConditionKey::new(a, ItemCode::ALIGNMENT_DELTA);
        slice
            .insert(Arc::new(Condition::raw(
                key,
                "delta",
                Iov::forever(IovType::RUN),
                Delta::translation(1.0, 0.0, 0.0).into(),
            )))
            .unwrap();

        let collected = collect_deltas(&tree, root, &slice);
        assert_eq!(collected.deltas.len(), 1);
        assert!(collected.deltas.contains_key(&a));
        assert_eq!(collected.diagnostics.len(), 2);
        assert!(collected.diagnostics[0].is_expected());
        assert_eq!(collected.diagnostics[0].path.as_deref(), Some("/world/B"));
        assert!(matches!(
            collected.diagnostics[1].error,
            ResolutionError::InvalidTreeExtension { .. }
        ));
    }
}
