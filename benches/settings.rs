use std::collections::BTreeMap;
use std::sync::Arc;

use chunkline::settings::{SettingsManager, SettingsMap, SettingsRegistry};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn request(event_count: usize, threshold_ms: u64) -> SettingsMap {
    let mut map = BTreeMap::new();
    for i in 0..event_count {
        map.insert(format!("app.Event{i}#enabled"), "true".to_string());
        map.insert(
            format!("app.Event{i}#threshold"),
            format!("{threshold_ms} ms"),
        );
        map.insert(format!("app.Event{i}#stackTrace"), (i % 2 == 0).to_string());
    }
    map
}

fn bench_apply(c: &mut Criterion) {
    let registry = Arc::new(SettingsRegistry::new());
    for i in 0..50 {
        registry.register_event(&format!("app.Event{i}"));
    }
    let manager = SettingsManager::new(registry);

    let requests: Vec<SettingsMap> = (0..4).map(|i| request(50, 5 + i * 5)).collect();
    let refs: Vec<&SettingsMap> = requests.iter().collect();

    c.bench_function("apply_4_recordings_50_events", |b| {
        b.iter(|| {
            manager.apply(black_box(&refs));
        });
    });

    c.bench_function("resolve_4_recordings_50_events", |b| {
        b.iter(|| black_box(manager.resolve(black_box(&refs))));
    });
}

criterion_group!(benches, bench_apply);
criterion_main!(benches);
