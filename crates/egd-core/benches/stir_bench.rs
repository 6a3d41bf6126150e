use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use egd_core::stirrer::stir;

fn stir_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("stir");
    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let input = vec![0x5Au8; size];
        group.throughput(criterion::Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| stir(black_box(input)));
        });
    }
    group.finish();
}

criterion_group!(benches, stir_throughput);
criterion_main!(benches);
