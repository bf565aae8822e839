//! Store and recall latency benchmark.
//!
//! Measures WAL-durable store throughput and recall latency per query kind
//! against a pre-populated engine.
//!
//! Run: cargo bench --bench store_recall

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;

use voltdb::config::BleedConfig;
use voltdb::frame::{Frame, SLOT_DIM};
use voltdb::{Codebook, Query, VoltConfig, VoltDb};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn unit(seed: usize) -> [f32; SLOT_DIM] {
    let mut v = [0.0f32; SLOT_DIM];
    v[seed % SLOT_DIM] = 1.0;
    v[(seed * 7 + 3) % SLOT_DIM] += 0.5;
    v
}

fn make_frame(i: usize) -> Frame {
    let mut frame = Frame::new(&format!("strand_{}", i % 16));
    frame.concepts = vec![format!("topic_{}", i % 32)];
    let v = unit(i);
    frame.fill_slot(0, 0.5 + (i % 5) as f32 * 0.1, &[(0, v), (1, v)]).unwrap();
    frame
}

fn open(dir: &TempDir) -> VoltDb {
    Codebook::generate(1024, 1).unwrap().save(&dir.path().join("codebook.bin")).unwrap();
    let mut config = VoltConfig {
        codebook_entries: None,
        bleed: BleedConfig {
            enabled: false,
            ..BleedConfig::default()
        },
        ..VoltConfig::default()
    };
    config.storage.sync_wal = false;
    VoltDb::open(dir.path(), config).unwrap()
}

fn populated(count: usize) -> (TempDir, VoltDb) {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    for i in 0..count {
        db.store(make_frame(i)).unwrap();
    }
    db.maintain().unwrap();
    (dir, db)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_store(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let mut i = 0usize;
    c.bench_function("store", |b| {
        b.iter(|| {
            i += 1;
            black_box(db.store(make_frame(i)).unwrap())
        })
    });
}

fn bench_recall(c: &mut Criterion) {
    let mut group = c.benchmark_group("recall");
    for count in [1_000usize, 5_000] {
        let (_dir, db) = populated(count);
        let vector = Query::Vector(unit(17).to_vec());
        let strand = Query::Strand("strand_3".to_string());
        let concept = Query::Concept("topic_9".to_string());
        let window = Query::TimeRange { start: 0, end: u64::MAX };

        group.bench_with_input(BenchmarkId::new("vector", count), &vector, |b, q| {
            b.iter(|| black_box(db.recall(q, 10).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("strand", count), &strand, |b, q| {
            b.iter(|| black_box(db.recall(q, 10).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("concept", count), &concept, |b, q| {
            b.iter(|| black_box(db.recall(q, 10).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("time_range", count), &window, |b, q| {
            b.iter(|| black_box(db.recall(q, 10).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_store, bench_recall);
criterion_main!(benches);
