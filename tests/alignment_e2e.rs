use std::sync::Arc;

use iovcond::{
    build_content, collect_deltas, Catalog, Condition, ConditionFlags, ConditionKey, ConditionsManager,
    ConditionsSlice, Delta, DependencyCalculator, DetectorTree, EntityId, Extension, InMemoryConditionStore,
    Iov, IovType, ItemCode, Payload, ResolutionError, RigidComposition, Rotation, StructuralTree, Transform,
    TranslationComposition,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn aligned(tree: &mut DetectorTree, entity: EntityId) {
    tree.set_extension(entity, Extension::Catalog(Catalog::new().aligned("delta")))
        .unwrap();
}

fn delta_condition(entity: EntityId, start: i64, end: i64, payload: Payload) -> Condition {
    Condition::raw(
        ConditionKey::new(entity, ItemCode::ALIGNMENT_DELTA),
        "delta",
        Iov::new(IovType::RUN, start, end).unwrap(),
        payload,
    )
}

fn absolute(slice: &ConditionsSlice, entity: EntityId) -> Option<Transform> {
    slice
        .get(entity, ItemCode::ALIGNMENT)
        .and_then(|c| c.payload.as_transform())
        .copied()
}

/// world -> A -> B, each with a stored delta.
struct Chain {
    tree: Arc<DetectorTree>,
    a: EntityId,
    b: EntityId,
    store: Arc<InMemoryConditionStore>,
}

fn chain() -> Chain {
    let mut tree = DetectorTree::new("world").unwrap();
    let root = tree.root();
    let a = tree.add_child(root, "A").unwrap();
    let b = tree.add_child(a, "B").unwrap();
    for e in [root, a, b] {
        aligned(&mut tree, e);
    }

    let store = Arc::new(InMemoryConditionStore::new());
    store
        .insert(delta_condition(root, 0, 100, Delta::translation(1.0, 0.0, 0.0).into()))
        .unwrap();
    store
        .insert(delta_condition(a, 0, 50, Delta::translation(0.0, 1.0, 0.0).into()))
        .unwrap();
    store
        .insert(delta_condition(b, 10, 100, Delta::translation(0.0, 0.0, 1.0).into()))
        .unwrap();

    Chain {
        tree: Arc::new(tree),
        a,
        b,
        store,
    }
}

#[test]
fn prepare_collect_compute_workflow() {
    init_tracing();
    let c = chain();
    let root = c.tree.root();
    let content = Arc::new(build_content(c.tree.as_ref(), root).content);
    let manager = ConditionsManager::new(c.store.clone());
    let calculator = DependencyCalculator::new(c.tree.clone(), TranslationComposition);
    let mut slice = ConditionsSlice::new(content);

    let prepared = manager.prepare(&Iov::point(IovType::RUN, 20), &mut slice);
    assert_eq!(prepared.loaded, 3);
    assert!(prepared.is_complete());

    let collected = collect_deltas(c.tree.as_ref(), root, &slice);
    assert!(collected.diagnostics.is_empty());
    assert_eq!(collected.deltas.len(), 3);

    let computed = calculator.compute(&collected.deltas, &mut slice);
    assert_eq!((computed.computed, computed.missing), (3, 0));
    assert_eq!(computed.selected + computed.loaded, 0);

    let b = absolute(&slice, c.b).unwrap();
    assert_eq!(b.translation, [1.0, 1.0, 1.0]);
    let b_condition = slice.get(c.b, ItemCode::ALIGNMENT).unwrap();
    assert!(b_condition.test_flag(ConditionFlags::DERIVED | ConditionFlags::ALIGNMENT));
    // Intersection of [0,100], [0,50] and [10,100].
    assert_eq!(b_condition.validity, Iov::new(IovType::RUN, 10, 50).unwrap());

    // Derived values are never pushed back to the store.
    assert_eq!(c.store.len().unwrap(), 3);
}

#[test]
fn recompute_after_reprepare_breaks_stale_subtree() {
    init_tracing();
    let c = chain();
    let root = c.tree.root();
    let content = Arc::new(build_content(c.tree.as_ref(), root).content);
    let manager = ConditionsManager::new(c.store.clone());
    let calculator = DependencyCalculator::new(c.tree.clone(), TranslationComposition);
    let mut slice = ConditionsSlice::new(content);

    manager.prepare(&Iov::point(IovType::RUN, 20), &mut slice);
    let deltas = collect_deltas(c.tree.as_ref(), root, &slice).deltas;
    calculator.compute(&deltas, &mut slice);
    assert!(absolute(&slice, c.b).is_some());

    // At run 70 the delta of A is not valid any more.
    let prepared = manager.prepare(&Iov::point(IovType::RUN, 70), &mut slice);
    assert_eq!(prepared.missing, 1);
    assert!(absolute(&slice, c.b).is_none());

    let collected = collect_deltas(c.tree.as_ref(), root, &slice);
    assert_eq!(collected.diagnostics.len(), 1);
    assert!(collected.diagnostics[0].is_expected());

    // A is still aligned, so B cannot compose against the root instead.
    let computed = calculator.compute(&collected.deltas, &mut slice);
    assert_eq!((computed.computed, computed.missing), (1, 2));
    assert!(absolute(&slice, c.a).is_none());
    assert!(absolute(&slice, c.b).is_none());
    assert!(matches!(
        computed.diagnostics[1].error,
        ResolutionError::MissingParent { ref parent } if parent == "/world/A"
    ));
}

#[test]
fn failed_entity_isolated_to_its_subtree() {
    init_tracing();
    let mut tree = DetectorTree::new("world").unwrap();
    let root = tree.root();
    let bad = tree.add_child(root, "bad").unwrap();
    let below_bad = tree.add_child(bad, "child").unwrap();
    let good = tree.add_child(root, "good").unwrap();
    let below_good = tree.add_child(good, "child").unwrap();
    tree.set_extension(root, Extension::Catalog(Catalog::new())).unwrap();
    for e in [bad, below_bad, good, below_good] {
        aligned(&mut tree, e);
    }
    let tree = Arc::new(tree);

    let store = Arc::new(InMemoryConditionStore::new());
    store
        .insert(delta_condition(bad, 0, 100, Payload::Text("not a delta".into())))
        .unwrap();
    for e in [below_bad, good, below_good] {
        store
            .insert(delta_condition(e, 0, 100, Delta::translation(1.0, 0.0, 0.0).into()))
            .unwrap();
    }

    let mut slice = ConditionsSlice::new(Arc::new(build_content(tree.as_ref(), root).content));
    let manager = ConditionsManager::new(store);
    let prepared = manager.prepare(&Iov::point(IovType::RUN, 1), &mut slice);
    assert_eq!((prepared.loaded, prepared.missing), (4, 0));

    let deltas = collect_deltas(tree.as_ref(), root, &slice).deltas;
    let calculator = DependencyCalculator::new(tree.clone(), TranslationComposition);
    let result = calculator.compute(&deltas, &mut slice);

    assert_eq!((result.computed, result.missing), (2, 2));
    assert_eq!(absolute(&slice, below_good).unwrap().translation, [2.0, 0.0, 0.0]);
    assert!(absolute(&slice, bad).is_none());
    assert!(absolute(&slice, below_bad).is_none());

    let errors: Vec<_> = result.diagnostics.iter().map(|d| (d.path.as_deref(), &d.error)).collect();
    assert!(matches!(errors[0], (Some("/world/bad"), ResolutionError::MalformedPayload { .. })));
    assert!(matches!(
        errors[1],
        (Some("/world/bad/child"), ResolutionError::MissingParent { .. })
    ));
}

#[test]
fn unusable_descriptor_isolates_its_subtree() {
    init_tracing();
    let mut tree = DetectorTree::new("world").unwrap();
    let root = tree.root();
    let odd = tree.add_child(root, "odd").unwrap();
    let below_odd = tree.add_child(odd, "child").unwrap();
    let good = tree.add_child(root, "good").unwrap();
    aligned(&mut tree, root);
    tree.set_extension(odd, Extension::Opaque { name: "readout".to_string() })
        .unwrap();
    aligned(&mut tree, below_odd);
    aligned(&mut tree, good);
    let tree = Arc::new(tree);

    let store = Arc::new(InMemoryConditionStore::new());
    for e in [root, below_odd, good] {
        store
            .insert(delta_condition(e, 0, 100, Delta::translation(1.0, 0.0, 0.0).into()))
            .unwrap();
    }

    let build = build_content(tree.as_ref(), root);
    assert_eq!(build.diagnostics.len(), 1);
    let mut slice = ConditionsSlice::new(Arc::new(build.content));
    let prepared = ConditionsManager::new(store).prepare(&Iov::point(IovType::RUN, 1), &mut slice);
    assert!(prepared.is_complete());

    let deltas = collect_deltas(tree.as_ref(), root, &slice).deltas;
    let result = DependencyCalculator::new(tree.clone(), TranslationComposition).compute(&deltas, &mut slice);

    // The odd entity and the one aligned entity below it.
    assert_eq!((result.computed, result.missing), (2, 2));
    assert!(matches!(
        result.diagnostics[0].error,
        ResolutionError::InvalidTreeExtension { .. }
    ));
    assert!(matches!(
        result.diagnostics[1].error,
        ResolutionError::MissingParent { ref parent } if parent == "/world/odd"
    ));
    assert!(absolute(&slice, below_odd).is_none());
    assert_eq!(absolute(&slice, good).unwrap().translation, [2.0, 0.0, 0.0]);
}

#[test]
fn rigid_composition_is_order_sensitive() {
    init_tracing();
    let quarter = std::f64::consts::FRAC_PI_2;
    let mut tree = DetectorTree::new("world").unwrap();
    let root = tree.root();
    let arm = tree.add_child(root, "arm").unwrap();
    let tip = tree.add_child(arm, "tip").unwrap();
    tree.set_extension(root, Extension::Catalog(Catalog::new())).unwrap();
    for e in [arm, tip] {
        aligned(&mut tree, e);
    }
    let tree = Arc::new(tree);
    let mut slice = ConditionsSlice::new(Arc::new(build_content(tree.as_ref(), root).content));

    let store = Arc::new(InMemoryConditionStore::new());
    store
        .insert(delta_condition(arm, 0, 10, Delta::rotation(Rotation::zyx(quarter, 0.0, 0.0)).into()))
        .unwrap();
    store
        .insert(delta_condition(tip, 0, 10, Delta::translation(2.0, 0.0, 0.0).into()))
        .unwrap();
    ConditionsManager::new(store).prepare(&Iov::point(IovType::RUN, 1), &mut slice);

    let deltas = collect_deltas(tree.as_ref(), root, &slice).deltas;
    let result = DependencyCalculator::new(tree.clone(), RigidComposition).compute(&deltas, &mut slice);
    assert_eq!(result.computed, 2);

    let tip_abs = absolute(&slice, tip).unwrap();
    let expected = Transform::identity()
        .compose(&Delta::rotation(Rotation::zyx(quarter, 0.0, 0.0)).to_transform())
        .compose(&Transform::translation(2.0, 0.0, 0.0));
    assert!(tip_abs.approx_eq(&expected, 1e-12));
    // The arm's rotation carries the tip's offset from x onto y.
    let p = tip_abs.apply(&[0.0, 0.0, 0.0]);
    assert!(p[0].abs() < 1e-12 && (p[1] - 2.0).abs() < 1e-12);
}

#[test]
fn parameter_block_deltas_are_accepted() {
    init_tracing();
    let mut tree = DetectorTree::new("world").unwrap();
    let root = tree.root();
    aligned(&mut tree, root);
    let tree = Arc::new(tree);

    let mut params = std::collections::BTreeMap::new();
    params.insert("delta".to_string(), Payload::Delta(Delta::translation(0.0, 0.0, 3.0)));
    let store = Arc::new(InMemoryConditionStore::new());
    store
        .insert(delta_condition(root, 0, 10, Payload::Params(params)))
        .unwrap();

    let mut slice = ConditionsSlice::new(Arc::new(build_content(tree.as_ref(), root).content));
    ConditionsManager::new(store).prepare(&Iov::point(IovType::RUN, 1), &mut slice);
    let deltas = collect_deltas(tree.as_ref(), root, &slice).deltas;
    let result = DependencyCalculator::new(tree.clone(), TranslationComposition).compute(&deltas, &mut slice);
    assert!(result.is_complete());
    assert_eq!(absolute(&slice, root).unwrap().translation, [0.0, 0.0, 3.0]);
}
