//! End-to-end tests for query rewriting.
//!
//! A schema-qualified name (`main.state`) is never rewritten, so it reads the
//! generic view and serves as the reference for every rewritten query.

use lix_state::{
    ChangeInput, CreateVersion, Engine, EngineConfig, QueryResult, RewriteContext, RewriteOutcome,
    Rewriter, Value,
};
use serde_json::json;

fn test_engine() -> Engine {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let engine = Engine::new(EngineConfig::deterministic()).unwrap();
    let main = engine.active_version().unwrap();
    for n in 0..5 {
        engine
            .stage(ChangeInput::new(format!("t{n}"), "todo", json!({ "n": n })))
            .unwrap();
        engine
            .stage(ChangeInput::new(format!("n{n}"), "note", json!(format!("note {n}"))))
            .unwrap();
    }
    engine.create_checkpoint(&main.id).unwrap();
    engine.delete_entity(&main.id, "t4", "todo").unwrap();

    let child = engine
        .create_version(CreateVersion::named("child").inheriting(main.id.clone()))
        .unwrap();
    engine
        .stage_change(&child.id, ChangeInput::new("t0", "todo", json!({ "n": 100 })))
        .unwrap();
    engine
}

/// Run `sql` rewritten and again against the views, and compare.
fn assert_same_rows(engine: &Engine, sql: &str, params: &[Value]) -> QueryResult {
    let rewritten = engine.query(sql, params).unwrap();
    let passthrough_sql = sql
        .replace("FROM state_all", "FROM main.state_all")
        .replace("JOIN state_all", "JOIN main.state_all")
        .replace("FROM state ", "FROM main.state ");
    assert_ne!(sql, passthrough_sql, "test query must reference a virtual relation");
    let passthrough = engine.query(&passthrough_sql, params).unwrap();
    assert_eq!(rewritten, passthrough, "rewritten and passthrough results differ for {sql}");
    rewritten
}

#[test]
fn test_fast_path_matches_views() {
    let engine = test_engine();
    let result = assert_same_rows(
        &engine,
        "SELECT entity_id, snapshot_content FROM state WHERE schema_key = 'todo' ORDER BY entity_id",
        &[],
    );
    assert_eq!(result.len(), 4);
}

#[test]
fn test_bound_parameters_match_views() {
    let engine = test_engine();
    let child = engine.version_by_name("child").unwrap().unwrap();
    let result = assert_same_rows(
        &engine,
        "SELECT entity_id, snapshot_content, inherited_from_version_id FROM state_all \
         WHERE schema_key = ? AND version_id = ? ORDER BY entity_id",
        &[Value::from("todo"), Value::from(child.id.as_str())],
    );
    assert_eq!(result.len(), 4);
    // t0 is overridden locally; the rest are inherited.
    assert_eq!(result.get(0, "inherited_from_version_id"), Some(&Value::Null));
    assert!(!result.get(1, "inherited_from_version_id").unwrap().is_null());
}

#[test]
fn test_generic_path_matches_views() {
    let engine = test_engine();
    let result = assert_same_rows(
        &engine,
        "SELECT schema_key, entity_id, version_id FROM state_all \
         WHERE schema_key IN ('todo', 'note') ORDER BY version_id, schema_key, entity_id",
        &[],
    );
    // 4 todos + 5 notes in each of two versions.
    assert_eq!(result.len(), 18);
}

#[test]
fn test_unfiltered_wildcard_matches_views() {
    let engine = test_engine();
    assert_same_rows(
        &engine,
        "SELECT * FROM state_all ORDER BY version_id, schema_key, entity_id",
        &[],
    );
}

#[test]
fn test_join_and_aggregate_match_views() {
    let engine = test_engine();
    assert_same_rows(
        &engine,
        "SELECT a.entity_id, a.version_id, b.version_id AS other FROM state_all AS a \
         JOIN state_all AS b ON a.entity_id = b.entity_id AND a.version_id < b.version_id \
         WHERE a.schema_key = 'todo' AND b.schema_key = 'todo' ORDER BY a.entity_id",
        &[],
    );
    let counts = assert_same_rows(
        &engine,
        "SELECT schema_key, COUNT(*) AS n FROM state GROUP BY schema_key ORDER BY schema_key",
        &[],
    );
    assert_eq!(counts.column_values("n"), vec![Value::from(5), Value::from(4)]);
}

#[test]
fn test_subquery_matches_views() {
    let engine = test_engine();
    assert_same_rows(
        &engine,
        "SELECT entity_id FROM (SELECT * FROM state WHERE schema_key = 'note') AS notes \
         WHERE entity_id > 'n1' ORDER BY entity_id",
        &[],
    );
}

#[test]
fn test_writes_are_visible_to_next_rewritten_read() {
    let engine = test_engine();
    let sql = "SELECT entity_id FROM state WHERE schema_key = 'todo' ORDER BY entity_id";
    assert_eq!(engine.query(sql, &[]).unwrap().len(), 4);

    engine.stage(ChangeInput::new("t9", "todo", json!(9))).unwrap();
    assert_eq!(engine.query(sql, &[]).unwrap().len(), 5);

    let main = engine.active_version().unwrap();
    engine.delete_entity(&main.id, "t9", "todo").unwrap();
    assert_same_rows(&engine, sql, &[]);
    assert_eq!(engine.query(sql, &[]).unwrap().len(), 4);
}

#[test]
fn test_overlay_inside_transaction_only() {
    let engine = test_engine();
    let sql = "SELECT entity_id FROM state WHERE schema_key = 'todo' ORDER BY entity_id";

    let mut tx = engine.begin().unwrap();
    tx.stage(ChangeInput::new("pending", "todo", json!(1))).unwrap();
    tx.stage(ChangeInput::tombstone("t0", "todo")).unwrap();
    let inside = tx.query(sql, &[]).unwrap();
    assert_eq!(
        inside.column_values("entity_id"),
        vec!["pending", "t1", "t2", "t3"].into_iter().map(Value::from).collect::<Vec<_>>()
    );
    tx.rollback().unwrap();

    let outside = engine.query(sql, &[]).unwrap();
    assert_eq!(
        outside.column_values("entity_id"),
        vec!["t0", "t1", "t2", "t3"].into_iter().map(Value::from).collect::<Vec<_>>()
    );
}

#[test]
fn test_overlay_applies_to_generic_path() {
    let engine = test_engine();
    let main = engine.active_version().unwrap();
    let mut tx = engine.begin().unwrap();
    tx.stage_change(&main.id, ChangeInput::new("pending", "todo", json!(1)))
        .unwrap();
    let result = tx
        .query(
            "SELECT entity_id FROM state_all WHERE version_id = ? AND entity_id = 'pending'",
            &[Value::from(main.id.as_str())],
        )
        .unwrap();
    assert_eq!(result.len(), 1);
    tx.commit().unwrap();
}

#[test]
fn test_rewrite_decisions() {
    let mut rewriter = Rewriter::default();
    let context = RewriteContext::default();

    let pruned = rewriter.rewrite(
        "SELECT entity_id FROM state WHERE schema_key = 'todo'",
        &[],
        &context,
    );
    assert!(matches!(&pruned, RewriteOutcome::Rewritten(r) if r.pruned));

    let wildcard = rewriter.rewrite("SELECT * FROM state WHERE schema_key = 'todo'", &[], &context);
    assert!(matches!(&wildcard, RewriteOutcome::Rewritten(r) if !r.pruned));

    let insert = rewriter.rewrite("INSERT INTO state (entity_id) VALUES ('x')", &[], &context);
    assert!(!insert.is_rewritten());
    assert_eq!(
        insert.sql("INSERT INTO state (entity_id) VALUES ('x')"),
        "INSERT INTO state (entity_id) VALUES ('x')"
    );

    let overlay = rewriter.rewrite(
        "SELECT entity_id FROM state WHERE schema_key = 'todo'",
        &[],
        &RewriteContext { overlay: true },
    );
    assert!(matches!(&overlay, RewriteOutcome::Rewritten(r) if r.sql.contains("lix_internal_transaction_state")));
    assert!(matches!(&pruned, RewriteOutcome::Rewritten(r) if !r.sql.contains("lix_internal_transaction_state")));
}
