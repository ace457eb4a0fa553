//! Performance benchmarks for the state engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lix_state::{ChangeInput, CreateVersion, Engine, EngineConfig, Rewriter, RewriteContext, Value};
use serde_json::json;

fn populated_engine(entities: usize) -> Engine {
    let engine = Engine::new(EngineConfig::deterministic()).unwrap();
    let main = engine.active_version().unwrap();
    let mut tx = engine.begin().unwrap();
    for n in 0..entities {
        tx.stage(ChangeInput::new(format!("e{n}"), "todo", json!({ "n": n })))
            .unwrap();
    }
    tx.commit().unwrap();
    engine.create_checkpoint(&main.id).unwrap();
    engine
}

/// Rewritten reads served from a fresh cache versus a cache rebuilt first.
fn bench_cached_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_read");
    let sql = "SELECT entity_id, snapshot_content FROM state WHERE schema_key = 'todo'";

    for entities in [100, 1_000, 10_000] {
        let engine = populated_engine(entities);

        group.bench_with_input(BenchmarkId::new("warm", entities), &entities, |b, _| {
            engine.query(sql, &[]).unwrap();
            b.iter(|| black_box(engine.query(sql, &[]).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("cold", entities), &entities, |b, _| {
            b.iter(|| {
                engine.mark_stale(Some("todo"), None).unwrap();
                black_box(engine.query(sql, &[]).unwrap())
            });
        });
    }

    group.finish();
}

/// Point lookups: graph-walk resolver against the cache-backed fast path.
fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("point_lookup");
    let engine = populated_engine(1_000);
    let main = engine.active_version().unwrap();
    engine.state("todo", &main.id).unwrap();

    group.bench_function("resolver", |b| {
        b.iter(|| black_box(engine.resolve("e500", "todo", &main.id).unwrap()));
    });

    let sql = "SELECT snapshot_content FROM state WHERE schema_key = 'todo' AND entity_id = ?";
    let params = [Value::from("e500")];
    group.bench_function("rewritten_query", |b| {
        b.iter(|| black_box(engine.query(sql, &params).unwrap()));
    });

    group.finish();
}

/// Resolution cost as history and inheritance deepen.
fn bench_history_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("history_depth");

    for depth in [10, 100, 500] {
        let engine = Engine::new(EngineConfig::deterministic()).unwrap();
        let main = engine.active_version().unwrap();
        engine.stage(ChangeInput::new("root", "todo", json!(0))).unwrap();
        engine.create_checkpoint(&main.id).unwrap();
        for n in 0..depth {
            engine.stage(ChangeInput::new("counter", "todo", json!(n))).unwrap();
            engine.create_checkpoint(&main.id).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("commits", depth), &depth, |b, _| {
            b.iter(|| black_box(engine.resolve("root", "todo", &main.id).unwrap()));
        });
    }

    for depth in [1, 8, 32] {
        let engine = populated_engine(200);
        let mut parent = engine.active_version().unwrap().id;
        for level in 0..depth {
            parent = engine
                .create_version(CreateVersion::named(format!("level-{level}")).inheriting(parent))
                .unwrap()
                .id;
        }

        group.bench_with_input(BenchmarkId::new("inheritance", depth), &depth, |b, _| {
            b.iter(|| {
                engine.mark_stale(Some("todo"), Some(&parent)).unwrap();
                black_box(engine.state("todo", &parent).unwrap())
            });
        });
    }

    group.finish();
}

/// Parsing and planning alone, without execution.
fn bench_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewrite");
    let context = RewriteContext::default();
    let queries = [
        ("pruned", "SELECT entity_id FROM state WHERE schema_key = 'todo' AND version_id = ?"),
        ("generic", "SELECT * FROM state_all WHERE schema_key IN ('a', 'b') ORDER BY entity_id"),
        ("passthrough", "SELECT * FROM lix_internal_change WHERE id = ?"),
    ];

    for (name, sql) in queries {
        let params = [Value::from("v")];
        group.bench_function(name, |b| {
            let mut rewriter = Rewriter::default();
            b.iter(|| black_box(rewriter.rewrite(sql, &params, &context)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_cached_reads,
    bench_point_lookup,
    bench_history_depth,
    bench_rewrite,
);
criterion_main!(benches);
