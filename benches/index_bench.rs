use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use scratchbin::{BlockAddress, BlockIndex, Hash};

fn index_ops(c: &mut Criterion) {
    let index = BlockIndex::new();
    let addr = BlockAddress::from_packed(1);

    // Pre-populate one chain-heavy bucket and a spread of singleton buckets.
    for i in 0..64u64 {
        index.add(1, Hash::new(i, (i << 32) | 0xAB_CDEF), addr).unwrap();
    }
    for i in 0..100_000u64 {
        index.add(1, Hash::new(i, i), addr).unwrap();
    }

    c.bench_function("get_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 100_000;
            index.get(1, Hash::new(i, i))
        })
    });

    c.bench_function("get_miss", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            index.get(1, Hash::new(i, 0x7FFF_0000_0000_0000 | i))
        })
    });

    c.bench_function("get_chained_bucket", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 64;
            index.get(1, Hash::new(i, (i << 32) | 0xAB_CDEF))
        })
    });

    c.bench_function("add_remove_cycle", |b| {
        b.iter_batched(
            || Hash::new(0xFEED, 0x12_3456),
            |h| {
                index.add(2, h, addr).unwrap();
                index.remove(2, h, addr);
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, index_ops);
criterion_main!(benches);
