//! Hierarchical dependency calculator.
//!
//! Walks the structural tree pre-order and derives each aligned entity's absolute
//! transform from its own delta and the absolute transform of its nearest aligned
//! ancestor. A failing entity is reported and only poisons its own subtree.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use super::{Delta, Transform};
use crate::condition::{Condition, ConditionFlags, ConditionKey, ItemCode};
use crate::entity::EntityId;
use crate::error::ResolutionError;
use crate::iov::Iov;
use crate::payload::Payload;
use crate::result::{Diagnostic, ResolutionResult};
use crate::slice::ConditionsSlice;
use crate::tree::{display_path, preorder, Extension, StructuralTree};

/// Raw delta conditions by entity, as produced by
/// [`collect_deltas`](super::collect_deltas).
pub type Deltas = BTreeMap<EntityId, Arc<Condition>>;

/// How a child's delta is combined with its parent's absolute value.
pub trait CompositionRule: Send + Sync {
    /// Rule name, used in logs.
    fn name(&self) -> &str;

    /// Absolute value of an entity with no aligned ancestor.
    fn identity(&self) -> Transform;

    /// Absolute value of a child given its parent's absolute value and its delta.
    ///
    /// # Errors
    ///
    /// `MalformedPayload` if the delta cannot be combined under this rule.
    fn combine(&self, parent: &Transform, delta: &Delta) -> Result<Transform, ResolutionError>;
}

/// Full rigid-body composition: `parent * delta`. Not commutative.
#[derive(Debug, Clone, Copy, Default)]
pub struct RigidComposition;

impl CompositionRule for RigidComposition {
    fn name(&self) -> &str {
        "rigid"
    }

    fn identity(&self) -> Transform {
        Transform::identity()
    }

    fn combine(&self, parent: &Transform, delta: &Delta) -> Result<Transform, ResolutionError> {
        Ok(parent.compose(&delta.to_transform()))
    }
}

/// Additive translations. Deltas carrying a rotation are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslationComposition;

impl CompositionRule for TranslationComposition {
    fn name(&self) -> &str {
        "translation"
    }

    fn identity(&self) -> Transform {
        Transform::identity()
    }

    fn combine(&self, parent: &Transform, delta: &Delta) -> Result<Transform, ResolutionError> {
        if delta.has_rotation() {
            return Err(ResolutionError::malformed("translation-only delta", "delta with rotation"));
        }
        let t = delta.translation.unwrap_or([0.0; 3]);
        let p = parent.translation;
        Ok(Transform {
            rotation: parent.rotation,
            translation: [p[0] + t[0], p[1] + t[1], p[2] + t[2]],
        })
    }
}

/// Calculator options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculatorConfig {
    /// Compose children of a failed entity against the identity instead of
    /// reporting them missing.
    pub missing_parent_as_identity: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Computing,
    Computed,
    Missing,
}

/// What an entity inherits from its nearest aligned ancestor.
#[derive(Debug, Clone)]
enum Inherited {
    Identity,
    Resolved { transform: Transform, validity: Iov },
    Broken { path: String },
}

/// Derives absolute alignments from deltas.
pub struct DependencyCalculator {
    tree: Arc<dyn StructuralTree>,
    rule: Box<dyn CompositionRule>,
    config: CalculatorConfig,
}

impl DependencyCalculator {
    /// Creates a calculator over `tree` using `rule`, with default options.
    #[must_use]
    pub fn new(tree: Arc<dyn StructuralTree>, rule: impl CompositionRule + 'static) -> Self {
        Self {
            tree,
            rule: Box::new(rule),
            config: CalculatorConfig::default(),
        }
    }

    /// Replaces the options.
    #[must_use]
    pub const fn with_config(mut self, config: CalculatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Current options.
    #[must_use]
    pub const fn config(&self) -> &CalculatorConfig {
        &self.config
    }

    /// Computes the absolute alignment of every entity in `deltas` and writes it into
    /// `slice` as `(entity, ALIGNMENT)`.
    ///
    /// Only `computed` and `missing` are filled in the result. Values are recomputed
    /// on every call.
    ///
    /// An aligned entity with no delta in `deltas`, or an entity whose descriptor is
    /// not a catalog, is missing itself and counts as a broken parent for its
    /// subtree.
    pub fn compute(&self, deltas: &Deltas, slice: &mut ConditionsSlice) -> ResolutionResult {
        self.run(deltas, slice, None)
    }

    /// Like [`compute`](Self::compute); entities not reached before `deadline` are
    /// reported missing with `Timeout`.
    pub fn compute_until(&self, deltas: &Deltas, slice: &mut ConditionsSlice, deadline: Instant) -> ResolutionResult {
        self.run(deltas, slice, Some(deadline))
    }

    fn run(&self, deltas: &Deltas, slice: &mut ConditionsSlice, deadline: Option<Instant>) -> ResolutionResult {
        let span = info_span!("compute", slice = %slice.id(), rule = self.rule.name());
        let _enter = span.enter();

        let tree = self.tree.as_ref();
        let mut result = ResolutionResult::default();
        let mut states: HashMap<EntityId, NodeState> =
            deltas.keys().map(|e| (*e, NodeState::Pending)).collect();
        let mut inherited: HashMap<EntityId, Inherited> = HashMap::new();

        for (entity, _depth) in preorder(tree, tree.root()) {
            let from_parent = tree
                .parent(entity)
                .and_then(|p| inherited.get(&p).cloned())
                .unwrap_or(Inherited::Identity);

            let aligned = match tree.extension(entity) {
                Some(Extension::Catalog(catalog)) => catalog.alignment.is_some(),
                other => {
                    let reason = other.map_or_else(
                        || "no catalog available".to_string(),
                        |ext| format!("expected a catalog, found a '{}' descriptor", ext.kind()),
                    );
                    let path = display_path(tree, entity);
                    warn!(entity = %path, %reason, "entity descriptor unusable");
                    if states.contains_key(&entity) {
                        states.insert(entity, NodeState::Missing);
                    }
                    inherited.insert(entity, Inherited::Broken { path: path.clone() });
                    result.record_missing(Diagnostic::for_entity(
                        path,
                        ResolutionError::InvalidTreeExtension { reason },
                    ));
                    continue;
                }
            };

            let Some(delta) = deltas.get(&entity) else {
                if aligned {
                    let path = display_path(tree, entity);
                    let delta_key = ConditionKey::new(entity, ItemCode::ALIGNMENT_DELTA);
                    debug!(entity = %path, "aligned entity without a delta");
                    inherited.insert(entity, Inherited::Broken { path: path.clone() });
                    result.record_missing(
                        Diagnostic::for_key(
                            ConditionKey::new(entity, ItemCode::ALIGNMENT),
                            ResolutionError::UnresolvedKey { key: delta_key },
                        )
                        .at(path),
                    );
                } else {
                    inherited.insert(entity, from_parent);
                }
                continue;
            };
            match states.get(&entity) {
                Some(NodeState::Pending) => {}
                state => {
                    debug!(entity = %display_path(tree, entity), ?state, "entity already visited");
                    continue;
                }
            }
            states.insert(entity, NodeState::Computing);

            let path = display_path(tree, entity);
            let key = ConditionKey::new(entity, ItemCode::ALIGNMENT);
            let outcome = if deadline.is_some_and(|d| Instant::now() >= d) {
                Err(ResolutionError::Timeout)
            } else {
                check_delta(entity, delta)
                    .and_then(|()| self.resolve_node(delta, &from_parent))
                    .and_then(|(transform, validity)| {
                        let condition = Condition::derived(
                            key,
                            ItemCode::ALIGNMENT_NAME,
                            validity,
                            ConditionFlags::ALIGNMENT,
                            Payload::Transform(transform),
                        );
                        slice.insert(Arc::new(condition))?;
                        Ok((transform, validity))
                    })
            };

            match outcome {
                Ok((transform, validity)) => {
                    debug!(entity = %path, translation = ?transform.translation, "alignment computed");
                    states.insert(entity, NodeState::Computed);
                    inherited.insert(entity, Inherited::Resolved { transform, validity });
                    result.computed += 1;
                }
                Err(error) => {
                    warn!(entity = %path, error = %error, "alignment not computed");
                    states.insert(entity, NodeState::Missing);
                    inherited.insert(entity, Inherited::Broken { path: path.clone() });
                    result.record_missing(Diagnostic::for_key(key, error).at(path));
                }
            }
        }

        for (entity, state) in &states {
            if *state == NodeState::Pending {
                let path = display_path(tree, *entity);
                warn!(entity = %path, "delta for an entity outside the tree");
                let key = ConditionKey::new(*entity, ItemCode::ALIGNMENT);
                result.record_missing(Diagnostic::for_key(key, ResolutionError::Unreachable).at(path));
            }
        }

        info!(computed = result.computed, missing = result.missing, "{result}");
        result
    }

    fn resolve_node(&self, delta: &Condition, from_parent: &Inherited) -> Result<(Transform, Iov), ResolutionError> {
        let (parent, parent_validity) = match from_parent {
            Inherited::Identity => (self.rule.identity(), None),
            Inherited::Resolved { transform, validity } => (*transform, Some(*validity)),
            Inherited::Broken { .. } if self.config.missing_parent_as_identity => (self.rule.identity(), None),
            Inherited::Broken { path } => return Err(ResolutionError::MissingParent { parent: path.clone() }),
        };

        let transform = self.rule.combine(&parent, delta.payload.as_delta()?)?;
        let validity = match parent_validity {
            Some(v) => v
                .intersection(&delta.validity)
                .ok_or_else(|| ResolutionError::StaleCondition {
                    key: delta.key,
                    validity: delta.validity.to_string(),
                    requested: v.to_string(),
                })?,
            None => delta.validity,
        };
        Ok((transform, validity))
    }
}

/// A delta must be the flagged `ALIGNMENT_DELTA` condition of the entity it is
/// filed under.
fn check_delta(entity: EntityId, delta: &Condition) -> Result<(), ResolutionError> {
    let expected = ConditionKey::new(entity, ItemCode::ALIGNMENT_DELTA);
    if delta.key != expected {
        return Err(ResolutionError::malformed(
            format!("delta keyed {expected}"),
            format!("condition keyed {}", delta.key),
        ));
    }
    if !delta.test_flag(ConditionFlags::ALIGNMENT_DELTA) {
        return Err(ResolutionError::malformed("condition flagged as alignment delta", "unflagged condition"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::Rotation;
    use crate::content::build_content;
    use crate::iov::IovType;
    use crate::tree::{Catalog, DetectorTree, Extension};

    struct Fixture {
        tree: Arc<DetectorTree>,
        a: EntityId,
        b: EntityId,
        c: EntityId,
        slice: ConditionsSlice,
    }

    /// world -> A -> B, world -> C; every entity below the root aligned.
    fn fixture() -> Fixture {
        let mut tree = DetectorTree::new("world").unwrap();
        let root = tree.root();
        let a = tree.add_child(root, "A").unwrap();
        let b = tree.add_child(a, "B").unwrap();
        let c = tree.add_child(root, "C").unwrap();
        tree.set_extension(root, Extension::Catalog(Catalog::new())).unwrap();
        for e in [a, b, c] {
            tree.set_extension(e, Extension::Catalog(Catalog::new().aligned("delta"))).unwrap();
        }
        let content = build_content(&tree, root).content;
        let mut slice = ConditionsSlice::new(Arc::new(content));
        slice.reset(Iov::point(IovType::RUN, 5));
        Fixture {
            tree: Arc::new(tree),
            a,
            b,
            c,
            slice,
        }
    }

    fn delta(entity: EntityId, start: i64, end: i64, payload: Payload) -> Arc<Condition> {
        Arc::new(Condition::raw(
            ConditionKey::new(entity, ItemCode::ALIGNMENT_DELTA),
            "delta",
            Iov::new(IovType::RUN, start, end).unwrap(),
            payload,
        ))
    }

    fn translation_of(slice: &ConditionsSlice, entity: EntityId) -> [f64; 3] {
        slice
            .get(entity, ItemCode::ALIGNMENT)
            .and_then(|c| c.payload.as_transform())
            .map(|t| t.translation)
            .unwrap()
    }

    #[test]
    fn test_child_composes_with_nearest_aligned_ancestor() {
        let mut f = fixture();
        let deltas: Deltas = [
            (f.a, delta(f.a, 0, 10, Delta::translation(1.0, 0.0, 0.0).into())),
            (f.b, delta(f.b, 3, 20, Delta::translation(0.0, 1.0, 0.0).into())),
            (f.c, delta(f.c, 0, 10, Delta::default().into())),
        ]
        .into_iter()
        .collect();

        let calc = DependencyCalculator::new(f.tree.clone(), TranslationComposition);
        let result = calc.compute(&deltas, &mut f.slice);
        assert_eq!((result.computed, result.missing), (3, 0));
        assert_eq!(translation_of(&f.slice, f.b), [1.0, 1.0, 0.0]);

        let b = f.slice.get(f.b, ItemCode::ALIGNMENT).unwrap();
        assert!(b.test_flag(ConditionFlags::DERIVED));
        assert!(b.test_flag(ConditionFlags::ALIGNMENT));
        assert_eq!(b.validity, Iov::new(IovType::RUN, 3, 10).unwrap());
    }

    #[test]
    fn test_rigid_composition_applies_parent_rotation() {
        let mut f = fixture();
        let quarter = std::f64::consts::FRAC_PI_2;
        let deltas: Deltas = [
            (f.a, delta(f.a, 0, 10, Delta::rotation(Rotation::zyx(quarter, 0.0, 0.0)).into())),
            (f.b, delta(f.b, 0, 10, Delta::translation(1.0, 0.0, 0.0).into())),
            (f.c, delta(f.c, 0, 10, Delta::default().into())),
        ]
        .into_iter()
        .collect();

        let calc = DependencyCalculator::new(f.tree.clone(), RigidComposition);
        let result = calc.compute(&deltas, &mut f.slice);
        assert!(result.is_complete());
        let b = translation_of(&f.slice, f.b);
        assert!((b[0]).abs() < 1e-12);
        assert!((b[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_failure_only_poisons_subtree() {
        let mut f = fixture();
        let deltas: Deltas = [
            (f.a, delta(f.a, 0, 10, Payload::Text("garbage".into()))),
            (f.b, delta(f.b, 0, 10, Delta::translation(0.0, 1.0, 0.0).into())),
            (f.c, delta(f.c, 0, 10, Delta::translation(0.0, 0.0, 1.0).into())),
        ]
        .into_iter()
        .collect();

        let calc = DependencyCalculator::new(f.tree.clone(), TranslationComposition);
        let result = calc.compute(&deltas, &mut f.slice);
        assert_eq!((result.computed, result.missing), (1, 2));
        assert!(matches!(result.diagnostics[0].error, ResolutionError::MalformedPayload { .. }));
        assert!(matches!(
            result.diagnostics[1].error,
            ResolutionError::MissingParent { ref parent } if parent == "/world/A"
        ));
        assert_eq!(translation_of(&f.slice, f.c), [0.0, 0.0, 1.0]);
        assert!(f.slice.get(f.b, ItemCode::ALIGNMENT).is_none());
    }

    #[test]
    fn test_missing_parent_as_identity() {
        let mut f = fixture();
        let deltas: Deltas = [
            (f.a, delta(f.a, 0, 10, Payload::Null)),
            (f.b, delta(f.b, 0, 10, Delta::translation(0.0, 1.0, 0.0).into())),
            (f.c, delta(f.c, 0, 10, Delta::default().into())),
        ]
        .into_iter()
        .collect();

        let calc = DependencyCalculator::new(f.tree.clone(), TranslationComposition).with_config(CalculatorConfig {
            missing_parent_as_identity: true,
        });
        let result = calc.compute(&deltas, &mut f.slice);
        assert_eq!((result.computed, result.missing), (2, 1));
        assert_eq!(translation_of(&f.slice, f.b), [0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_delta_outside_tree_is_unreachable() {
        let mut f = fixture();
        let stray = EntityId::from_path("/elsewhere");
        let deltas: Deltas = [(stray, delta(stray, 0, 10, Delta::translation(1.0, 0.0, 0.0).into()))]
            .into_iter()
            .collect();

        let calc = DependencyCalculator::new(f.tree.clone(), TranslationComposition);
        let result = calc.compute(&deltas, &mut f.slice);
        // A, B and C declare alignments but have no delta here.
        assert_eq!(result.missing, 4);
        assert_eq!(result.diagnostics.last().map(|d| &d.error), Some(&ResolutionError::Unreachable));
    }

    #[test]
    fn test_translation_rule_rejects_rotation() {
        let rule = TranslationComposition;
        let d = Delta::rotation(Rotation::zyx(0.1, 0.0, 0.0));
        assert!(rule.combine(&rule.identity(), &d).is_err());
    }

    #[test]
    fn test_expired_deadline_reports_timeout() {
        let mut f = fixture();
        let deltas: Deltas = [(f.a, delta(f.a, 0, 10, Delta::translation(1.0, 0.0, 0.0).into()))]
            .into_iter()
            .collect();
        let calc = DependencyCalculator::new(f.tree.clone(), TranslationComposition);
        let result = calc.compute_until(&deltas, &mut f.slice, Instant::now());
        assert_eq!(result.computed, 0);
        assert_eq!(result.diagnostics[0].error, ResolutionError::Timeout);
    }

    #[test]
    fn test_aligned_entity_without_delta_breaks_its_subtree() {
        let mut f = fixture();
        let deltas: Deltas = [
            (f.b, delta(f.b, 0, 10, Delta::translation(0.0, 0.0, 1.0).into())),
            (f.c, delta(f.c, 0, 10, Delta::translation(1.0, 0.0, 0.0).into())),
        ]
        .into_iter()
        .collect();

        let calc = DependencyCalculator::new(f.tree.clone(), TranslationComposition);
        let result = calc.compute(&deltas, &mut f.slice);
        assert_eq!((result.computed, result.missing), (1, 2));
        assert!(matches!(
            result.diagnostics[0].error,
            ResolutionError::UnresolvedKey { key } if key == ConditionKey::new(f.a, ItemCode::ALIGNMENT_DELTA)
        ));
        assert!(matches!(
            result.diagnostics[1].error,
            ResolutionError::MissingParent { ref parent } if parent == "/world/A"
        ));
        assert!(f.slice.get(f.b, ItemCode::ALIGNMENT).is_none());
        assert_eq!(translation_of(&f.slice, f.c), [1.0, 0.0, 0.0]);

        let lenient = DependencyCalculator::new(f.tree.clone(), TranslationComposition).with_config(CalculatorConfig {
            missing_parent_as_identity: true,
        });
        let result = lenient.compute(&deltas, &mut f.slice);
        assert_eq!((result.computed, result.missing), (2, 1));
        assert_eq!(translation_of(&f.slice, f.b), [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_unusable_descriptor_breaks_its_subtree() {
        let mut tree = DetectorTree::new("world").unwrap();
        let root = tree.root();
        let odd = tree.add_child(root, "odd").unwrap();
        let below = tree.add_child(odd, "below").unwrap();
        tree.set_extension(root, Extension::Catalog(Catalog::new())).unwrap();
        tree.set_extension(odd, Extension::Opaque { name: "readout".to_string() }).unwrap();
        tree.set_extension(below, Extension::Catalog(Catalog::new().aligned("delta"))).unwrap();
        let mut slice = ConditionsSlice::new(Arc::new(build_content(&tree, root).content));
        slice.reset(Iov::point(IovType::RUN, 5));

        let deltas: Deltas = [(below, delta(below, 0, 10, Delta::translation(1.0, 0.0, 0.0).into()))]
            .into_iter()
            .collect();
        let result = DependencyCalculator::new(Arc::new(tree), TranslationComposition).compute(&deltas, &mut slice);
        assert_eq!((result.computed, result.missing), (0, 2));
        assert!(matches!(
            result.diagnostics[0].error,
            ResolutionError::InvalidTreeExtension { ref reason } if reason.contains("readout")
        ));
        assert!(matches!(result.diagnostics[1].error, ResolutionError::MissingParent { .. }));
    }

    #[test]
    fn test_misfiled_delta_is_rejected() {
        let mut f = fixture();
        let unflagged = Arc::new(Condition::derived(
            ConditionKey::new(f.c, ItemCode::ALIGNMENT_DELTA),
            "delta",
            Iov::new(IovType::RUN, 0, 10).unwrap(),
            ConditionFlags::NONE,
            Delta::translation(0.0, 0.0, 1.0).into(),
        ));
        let deltas: Deltas = [
            (f.a, delta(f.a, 0, 10, Delta::translation(1.0, 0.0, 0.0).into())),
            // C's delta filed under B.
            (f.b, delta(f.c, 0, 10, Delta::translation(0.0, 1.0, 0.0).into())),
            (f.c, unflagged),
        ]
        .into_iter()
        .collect();

        let calc = DependencyCalculator::new(f.tree.clone(), TranslationComposition);
        let result = calc.compute(&deltas, &mut f.slice);
        assert_eq!((result.computed, result.missing), (1, 2));
        assert!(result
            .diagnostics
            .iter()
            .all(|d| matches!(d.error, ResolutionError::MalformedPayload { .. })));
        assert!(f.slice.get(f.b, ItemCode::ALIGNMENT).is_none());
        assert!(f.slice.get(f.c, ItemCode::ALIGNMENT).is_none());
    }
}
