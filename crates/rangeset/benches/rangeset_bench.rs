use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rangeset::{remove_xor_add_segment, RangeSet};

const N_SEGMENTS: u64 = 10_000;

fn build_striped_set() -> RangeSet {
    let mut rs = RangeSet::new();
    for i in 0..N_SEGMENTS {
        // Disjoint 4K segments with 4K holes between them.
        let lo = i * 8192;
        rs.add(lo, lo + 4096);
    }
    rs
}

fn add_benchmark(c: &mut Criterion) {
    c.bench_function("rangeset_add_10k_striped", |b| {
        b.iter_batched(
            RangeSet::new,
            |mut rs| {
                for i in 0..N_SEGMENTS {
                    let lo = i * 8192;
                    rs.add(lo, lo + 4096);
                }
                rs
            },
            BatchSize::SmallInput,
        );
    });
}

fn xor_cancel_benchmark(c: &mut Criterion) {
    c.bench_function("rangeset_xor_cancel_10k", |b| {
        b.iter_batched(
            || (build_striped_set(), RangeSet::new()),
            |(mut allocs, mut frees)| {
                // Free every allocated stripe; each application cancels
                // exactly one segment.
                for i in 0..N_SEGMENTS {
                    let lo = i * 8192;
                    remove_xor_add_segment(lo, lo + 4096, &mut allocs, &mut frees);
                }
                (allocs, frees)
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, add_benchmark, xor_cancel_benchmark);
criterion_main!(benches);
