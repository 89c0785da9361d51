use std::sync::atomic::{AtomicU64, Ordering};

use criterion::{black_box, BatchSize, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use mlog::{Log, OpenFlags};

const SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
const RECORDS: u64 = 20_000;

fn bench_read(c: &mut Criterion) {
    let dir = tempdir().expect("tempdir");
    let log = Log::open(dir.path(), SEGMENT_SIZE, OpenFlags::ReadDirty).expect("open log");
    for i in 0..RECORDS {
        log.write(format!("message-{i}").as_bytes()).expect("write");
    }
    log.sync().expect("sync");

    let mut group = c.benchmark_group("read");
    let cursor = AtomicU64::new(0);

    group.bench_function("sequential", |b| {
        b.iter_batched(
            || cursor.fetch_add(1, Ordering::Relaxed) % RECORDS,
            |offset| {
                let frame = log.read(black_box(offset)).expect("read");
                black_box(frame.payload().len());
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_read);
criterion_main!(benches);
