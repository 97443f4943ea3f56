use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use mos::Mos;
use pool::{Pool, VdevLayout};
use tempfile::tempdir;

const MS_SHIFT: u32 = 22;
const N_METASLABS: u32 = 64;

fn dirty_pool() -> (tempfile::TempDir, Pool) {
    let dir = tempdir().unwrap();
    let mos = Mos::create(dir.path()).unwrap();
    let mut pool = Pool::create(
        mos,
        &[VdevLayout {
            ashift: 9,
            ms_shift: MS_SHIFT,
            ms_count: N_METASLABS,
        }],
        100,
        config::Tunables::default(),
    )
    .unwrap();

    let tx = pool.txg_begin();
    for ms in 0..u64::from(N_METASLABS) {
        pool.alloc(&tx, 0, ms << MS_SHIFT, 8 * 1024);
    }
    drop(tx);
    (dir, pool)
}

fn sync_benchmark(c: &mut Criterion) {
    c.bench_function("txg_sync_64_dirty_metaslabs", |b| {
        b.iter_batched(
            dirty_pool,
            |(_dir, mut pool)| {
                let tx = pool.txg_begin();
                pool.txg_sync(tx).unwrap();
                pool
            },
            BatchSize::SmallInput,
        );
    });
}

fn export_benchmark(c: &mut Criterion) {
    c.bench_function("export_flush_all_64_metaslabs", |b| {
        b.iter_batched(
            || {
                let (dir, mut pool) = dirty_pool();
                let tx = pool.txg_begin();
                pool.txg_sync(tx).unwrap();
                (dir, pool)
            },
            |(_dir, mut pool)| {
                pool.export().unwrap();
                pool
            },
            BatchSize::SmallInput,
        );
    });
}

fn load_benchmark(c: &mut Criterion) {
    c.bench_function("load_replay_64_metaslabs", |b| {
        b.iter_batched(
            || {
                let (dir, mut pool) = dirty_pool();
                let tx = pool.txg_begin();
                pool.txg_sync(tx).unwrap();
                drop(pool);
                dir
            },
            |dir| {
                let pool =
                    Pool::load(Mos::open(dir.path()).unwrap(), config::Tunables::default())
                        .unwrap();
                (dir, pool)
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, sync_benchmark, export_benchmark, load_benchmark);
criterion_main!(benches);
