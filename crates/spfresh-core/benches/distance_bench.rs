use criterion::{black_box, criterion_group, criterion_main, Criterion};
use spfresh_core::Metric;

fn bench_distance(c: &mut Criterion) {
    let a: Vec<f32> = (0..128).map(|i| i as f32 * 0.01).collect();
    let b: Vec<f32> = (0..128).map(|i| (127 - i) as f32 * 0.01).collect();

    let mut group = c.benchmark_group("distance");
    for metric in [Metric::L2, Metric::Cosine, Metric::InnerProduct] {
        group.bench_function(format!("{metric:?}"), |bencher| {
            bencher.iter(|| black_box(metric.distance(black_box(&a), black_box(&b))));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_distance);
criterion_main!(benches);
