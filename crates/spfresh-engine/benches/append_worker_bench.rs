use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use spfresh_core::{EngineConfig, Metric, ValueType};
use spfresh_engine::Engine;

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_insert");
    for dim in [32usize, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(dim), &dim, |b, &dim| {
            let dir = tempfile::tempdir().unwrap();
            let engine = Engine::open(
                dir.path(),
                &dir.path().join("postings.bin"),
                dim,
                ValueType::Float,
                Metric::L2,
                1 << 20,
                EngineConfig::new(4),
            )
            .unwrap();
            let vector = vec![0.5f32; dim];
            b.iter(|| {
                engine.insert(vector.clone()).unwrap();
            });
            engine.drain();
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert);
criterion_main!(benches);
