//! Error handling tests.

use lix_state::{
    ChangeInput, CommitId, CreateVersion, Engine, EngineConfig, EngineError, IntegrityViolation,
    VersionId,
};
use serde_json::json;
use tempfile::TempDir;

fn test_engine() -> Engine {
    Engine::new(EngineConfig::deterministic()).unwrap()
}

#[test]
fn test_create_duplicate_version() {
    let engine = test_engine();
    engine.create_version(CreateVersion::named("draft")).unwrap();
    let result = engine.create_version(CreateVersion::named("draft"));
    assert!(matches!(result, Err(EngineError::VersionExists(name)) if name == "draft"));
}

#[test]
fn test_switch_to_nonexistent_version() {
    let engine = test_engine();
    let result = engine.switch_version(&VersionId::new("missing"));
    assert!(matches!(result, Err(EngineError::VersionNotFound(_))));
}

#[test]
fn test_stage_into_nonexistent_version() {
    let engine = test_engine();
    let result = engine.stage_change(&VersionId::new("missing"), ChangeInput::new("e", "s", json!(1)));
    assert!(matches!(result, Err(EngineError::VersionNotFound(_))));
    assert_eq!(engine.stats().unwrap().change_count, 0);
}

#[test]
fn test_fork_from_nonexistent_version() {
    let engine = test_engine();
    let result = engine.create_version(CreateVersion::named("x").from_version(VersionId::new("missing")));
    assert!(matches!(result, Err(EngineError::VersionNotFound(_))));
    assert!(engine.version_by_name("x").unwrap().is_none());
}

#[test]
fn test_hide_active_version() {
    let engine = test_engine();
    let main = engine.active_version().unwrap();
    assert!(matches!(
        engine.hide_version(&main.id),
        Err(EngineError::InvalidOperation(_))
    ));
}

#[test]
fn test_undo_unknown_commit() {
    let engine = test_engine();
    let result = engine.create_undo_commit(&CommitId::new("missing"));
    assert!(matches!(result, Err(EngineError::CommitNotFound(_))));
}

#[test]
fn test_graft_commit_with_parents() {
    let engine = test_engine();
    let main = engine.active_version().unwrap();
    engine.stage(ChangeInput::new("e", "s", json!(1))).unwrap();
    let checkpoint = engine.create_checkpoint(&main.id).unwrap();

    let result = engine.graft_commit(&main.id, &checkpoint.id);
    assert!(matches!(result, Err(EngineError::InvalidOperation(_))));
}

#[test]
fn test_inheritance_cycle_rejected() {
    let engine = test_engine();
    let a = engine.create_version(CreateVersion::named("a")).unwrap();
    let b = engine
        .create_version(CreateVersion::named("b").inheriting(a.id.clone()))
        .unwrap();

    let result = engine.set_inherits_from(&a.id, Some(&b.id));
    assert!(matches!(
        result,
        Err(EngineError::Integrity(IntegrityViolation::InheritanceCycle(_)))
    ));
    let self_cycle = engine.set_inherits_from(&a.id, Some(&a.id));
    assert!(self_cycle.unwrap_err().is_integrity());

    // The rejected update left nothing behind.
    assert!(engine.get_version(&a.id).unwrap().unwrap().inherits_from_version_id.is_none());
    assert!(engine.verify_integrity().unwrap().is_empty());
}

#[test]
fn test_failed_write_rolls_back() {
    let engine = test_engine();
    let main = engine.active_version().unwrap();
    engine.stage(ChangeInput::new("e", "s", json!(1))).unwrap();
    let checkpoint = engine.create_checkpoint(&main.id).unwrap();
    let before = engine.stats().unwrap();

    // The undo commit is built before the graft target is looked up.
    let result = engine.undo(&VersionId::new("missing"), &checkpoint.id);
    assert!(matches!(result, Err(EngineError::VersionNotFound(_))));

    let after = engine.stats().unwrap();
    assert_eq!(before.change_count, after.change_count);
    assert_eq!(before.commit_count, after.commit_count);
}

#[test]
fn test_raw_sql_error_is_reported() {
    let engine = test_engine();
    assert!(matches!(
        engine.query("SELECT * FROM no_such_table", &[]),
        Err(EngineError::Sql(_))
    ));
    assert!(matches!(
        engine.execute("NOT EVEN SQL", &[]),
        Err(EngineError::Sql(_))
    ));
}

#[test]
fn test_unparseable_query_falls_back_to_sqlite() {
    let engine = test_engine();
    // sqlparser rejects this; SQLite decides.
    let result = engine.query("SELECT entity_id FROM state WHERE", &[]);
    assert!(matches!(result, Err(EngineError::Sql(_))));
}

#[test]
fn test_from_garbage_snapshot() {
    let result = Engine::from_snapshot(b"definitely not a snapshot", EngineConfig::default());
    assert!(matches!(result, Err(EngineError::InvalidFormat(_))));
}

#[test]
fn test_concurrent_open_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("engine.lix");
    let first = Engine::open_path(&path, EngineConfig::default()).unwrap();
    assert!(matches!(
        Engine::open_path(&path, EngineConfig::default()),
        Err(EngineError::Locked)
    ));

    drop(first);
    assert!(Engine::open_path(&path, EngineConfig::default()).is_ok());
}

#[test]
fn test_delete_absent_entity_is_noop() {
    let engine = test_engine();
    let main = engine.active_version().unwrap();
    assert!(engine.delete_entity(&main.id, "ghost", "s").unwrap().is_none());
    assert_eq!(engine.stats().unwrap().change_count, 0);
}

#[test]
fn test_unicode_entity_ids() {
    let engine = test_engine();
    let main = engine.active_version().unwrap();
    engine
        .stage(ChangeInput::new("émoji-🚀", "s", json!({ "name": "日本語" })))
        .unwrap();
    let entity = engine
        .resolve("émoji-🚀", "s", &main.id)
        .unwrap()
        .into_entity()
        .unwrap();
    assert_eq!(entity.snapshot_content["name"], "日本語");
}

#[test]
fn test_wildcard_schema_key_is_rejected() {
    let engine = test_engine();
    let main = engine.active_version().unwrap();
    engine.stage(ChangeInput::new("e1", "todo", json!(1))).unwrap();
    engine.state("todo", &main.id).unwrap();

    assert!(matches!(
        engine.stage(ChangeInput::new("e1", "*", json!(1))),
        Err(EngineError::InvalidOperation(_))
    ));
    let mut tx = engine.begin().unwrap();
    assert!(matches!(
        tx.stage(ChangeInput::new("e1", "*", json!(1))),
        Err(EngineError::InvalidOperation(_))
    ));
    drop(tx);

    // Nothing was written, so the cached scope is untouched.
    assert!(engine.is_fresh("todo", &main.id).unwrap());
    assert_eq!(engine.stats().unwrap().change_count, 1);
}
