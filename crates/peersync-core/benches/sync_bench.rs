//! Benchmarks for peersync hot paths
//!
//! Run with: cargo bench -p peersync-core
//!
//! Baselines for:
//! - Content-addressed writes
//! - Conflict resolution
//! - Publishing through the bus
//! - Header selection for an exchange

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use peersync_core::resolver::resolve_records;
use peersync_core::{
    Candidate, ContentId, EngineConfig, LastWriterWins, MemoryTransport, PublishedRecord,
    SyncEngine,
};
use std::sync::Arc;
use tempfile::TempDir;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn started_engine(rt: &tokio::runtime::Runtime) -> (SyncEngine, TempDir) {
    let dir = TempDir::new().unwrap();
    let engine = SyncEngine::builder(EngineConfig::new(dir.path()))
        .transport(Arc::new(MemoryTransport::detached()))
        .open()
        .unwrap();
    rt.block_on(engine.start()).unwrap();
    (engine, dir)
}

// ============================================================================
// Content Store
// ============================================================================

fn bench_content_put(c: &mut Criterion) {
    let rt = runtime();
    let (engine, _dir) = started_engine(&rt);
    let mut group = c.benchmark_group("content_put");

    for size in [64usize, 4 * 1024, 64 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                let mut blob = vec![0u8; size];
                blob[..8].copy_from_slice(&n.to_le_bytes());
                black_box(engine.put_content(&blob).unwrap())
            })
        });
    }
    group.finish();

    c.bench_function("content_id_4k", |b| {
        let blob = vec![7u8; 4 * 1024];
        b.iter(|| black_box(ContentId::of(&blob)))
    });
}

// ============================================================================
// Resolution
// ============================================================================

fn bench_resolve(c: &mut Criterion) {
    let record = |version, payload: &[u8]| PublishedRecord {
        record_type: "task".into(),
        record_id: "1".into(),
        content_id: ContentId::of(payload),
        version,
    };
    let a = record(3, b"left");
    let b = record(3, b"right");

    c.bench_function("resolve_lww_tie", |bench| {
        bench.iter(|| {
            black_box(resolve_records(
                &LastWriterWins,
                Candidate::new(&a),
                Candidate::new(&b),
            ))
        })
    });
}

// ============================================================================
// Publishing
// ============================================================================

fn bench_publish(c: &mut Criterion) {
    let rt = runtime();
    let (engine, _dir) = started_engine(&rt);
    let _sub = engine.subscribe("task", |d| {
        black_box(d.record.version);
    });

    let mut group = c.benchmark_group("publish");
    group.bench_function("same_record", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            engine
                .publish_raw("task", "1", format!("{{\"n\":{}}}", n).into_bytes())
                .unwrap()
        })
    });
    group.bench_function("distinct_records", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            engine
                .publish_raw("task", &n.to_string(), b"{}".to_vec())
                .unwrap()
        })
    });
    group.finish();

    c.bench_function("list_records_1000", |b| {
        let rt = runtime();
        let (engine, _dir) = started_engine(&rt);
        for i in 0..1000 {
            engine
                .publish_raw("note", &i.to_string(), b"{}".to_vec())
                .unwrap();
        }
        b.iter(|| black_box(engine.records(Some("note")).len()))
    });
}

criterion_group!(benches, bench_content_put, bench_resolve, bench_publish);
criterion_main!(benches);
