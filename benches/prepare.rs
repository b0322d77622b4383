use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use iovcond::{
    build_content, collect_deltas, Catalog, Condition, ConditionKey, ConditionsContent, ConditionsManager,
    ConditionsSlice, Delta, DependencyCalculator, DetectorTree, EntityId, Extension, InMemoryConditionStore, Iov,
    IovType, ItemCode, Payload, RigidComposition, StructuralTree,
};

/// Two-level tree: `stations` children of the root, each with `modules` children.
/// Every entity is aligned and carries one temperature reading.
fn make_tree(stations: usize, modules: usize) -> (Arc<DetectorTree>, Vec<EntityId>) {
    let mut tree = DetectorTree::new("world").unwrap();
    let root = tree.root();
    let mut entities = vec![root];
    for s in 0..stations {
        let station = tree.add_child(root, &format!("station_{s:02}")).unwrap();
        entities.push(station);
        for m in 0..modules {
            entities.push(tree.add_child(station, &format!("module_{m:02}")).unwrap());
        }
    }
    for e in &entities {
        tree.set_extension(
            *e,
            Extension::Catalog(Catalog::new().condition("temperature").aligned("delta")),
        )
        .unwrap();
    }
    (Arc::new(tree), entities)
}

fn make_store(entities: &[EntityId]) -> Arc<InMemoryConditionStore> {
    let store = Arc::new(InMemoryConditionStore::new());
    for (i, e) in entities.iter().enumerate() {
        // Seed several validity windows per key so lookups have to choose.
        for w in 0..4_i64 {
            let validity = Iov::new(IovType::RUN, w * 1000, w * 1000 + 999).unwrap();
            store
                .insert(Condition::raw(
                    ConditionKey::named(*e, "temperature"),
                    "temperature",
                    validity,
                    Payload::Float(20.0 + f64::from(u32::try_from(i).unwrap_or(0)) * 0.01),
                ))
                .unwrap();
            store
                .insert(Condition::raw(
                    ConditionKey::new(*e, ItemCode::ALIGNMENT_DELTA),
                    "delta",
                    validity,
                    Delta::translation(0.001, 0.0, 0.0).into(),
                ))
                .unwrap();
        }
    }
    store
}

fn bench_prepare(c: &mut Criterion) {
    let mut group = c.benchmark_group("prepare");
    for (stations, modules) in [(4, 8), (16, 32)] {
        let (tree, entities) = make_tree(stations, modules);
        let store = make_store(&entities);
        let content: Arc<ConditionsContent> = Arc::new(build_content(tree.as_ref(), tree.root()).content);
        group.throughput(Throughput::Elements(content.len() as u64));

        let warm = ConditionsManager::new(store.clone());
        let mut slice = ConditionsSlice::new(Arc::clone(&content));
        warm.prepare(&Iov::point(IovType::RUN, 500), &mut slice);
        group.bench_with_input(BenchmarkId::new("cached", entities.len()), &entities.len(), |b, _| {
            b.iter(|| warm.prepare(&Iov::point(IovType::RUN, 500), &mut slice));
        });

        group.bench_with_input(BenchmarkId::new("cold", entities.len()), &entities.len(), |b, _| {
            b.iter(|| {
                let manager = ConditionsManager::new(store.clone());
                let mut slice = ConditionsSlice::new(Arc::clone(&content));
                manager.prepare(&Iov::point(IovType::RUN, 1500), &mut slice)
            });
        });
    }
    group.finish();
}

fn bench_compute(c: &mut Criterion) {
    let (tree, entities) = make_tree(16, 32);
    let store = make_store(&entities);
    let content = Arc::new(build_content(tree.as_ref(), tree.root()).content);
    let manager = ConditionsManager::new(store);
    let mut slice = ConditionsSlice::new(content);
    manager.prepare(&Iov::point(IovType::RUN, 500), &mut slice);
    let deltas = collect_deltas(tree.as_ref(), tree.root(), &slice).deltas;
    let calculator = DependencyCalculator::new(tree.clone(), RigidComposition);

    c.bench_function("compute/rigid", |b| {
        b.iter(|| calculator.compute(&deltas, &mut slice));
    });
}

criterion_group!(benches, bench_prepare, bench_compute);
criterion_main!(benches);
