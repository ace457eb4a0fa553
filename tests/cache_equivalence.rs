//! The cache must reproduce the graph-walk resolver exactly.
//!
//! Random histories of stages, deletes, checkpoints, forks, inheritance,
//! undo and merges are replayed; after each history every (schema, version)
//! scope is compared three ways: resolver, cache, and the generic view.
//! Undoing a checkpoint must also bring its version back to the state it had
//! at the checkpoint's parent, inherited values included.

use lix_state::{ChangeInput, CreateVersion, Engine, EngineConfig, Value, VersionId};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;

const SCHEMAS: [&str; 2] = ["alpha", "beta"];
const ENTITIES: u8 = 4;

#[derive(Clone, Debug)]
enum Op {
    Stage { version: usize, entity: u8, schema: usize, value: i64 },
    Delete { version: usize, entity: u8, schema: usize },
    Checkpoint { version: usize },
    Fork { from: usize },
    Inherit { from: usize },
    Undo { version: usize },
    Merge { target: usize, source: usize },
    Read { version: usize, schema: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..8usize, 0..ENTITIES, 0..2usize, -5..5i64)
            .prop_map(|(version, entity, schema, value)| Op::Stage { version, entity, schema, value }),
        2 => (0..8usize, 0..ENTITIES, 0..2usize)
            .prop_map(|(version, entity, schema)| Op::Delete { version, entity, schema }),
        3 => (0..8usize).prop_map(|version| Op::Checkpoint { version }),
        1 => (0..8usize).prop_map(|from| Op::Fork { from }),
        1 => (0..8usize).prop_map(|from| Op::Inherit { from }),
        1 => (0..8usize).prop_map(|version| Op::Undo { version }),
        1 => (0..8usize, 0..8usize).prop_map(|(target, source)| Op::Merge { target, source }),
        2 => (0..8usize, 0..2usize).prop_map(|(version, schema)| Op::Read { version, schema }),
    ]
}

fn apply(engine: &Engine, versions: &mut Vec<VersionId>, op: &Op) {
    let pick = |index: usize| versions[index % versions.len()].clone();
    match *op {
        Op::Stage { version, entity, schema, value } => {
            engine
                .stage_change(
                    &pick(version),
                    ChangeInput::new(format!("e{entity}"), SCHEMAS[schema], json!(value)),
                )
                .unwrap();
        }
        Op::Delete { version, entity, schema } => {
            engine
                .delete_entity(&pick(version), &format!("e{entity}"), SCHEMAS[schema])
                .unwrap();
        }
        Op::Checkpoint { version } => {
            engine.create_checkpoint(&pick(version)).unwrap();
        }
        Op::Fork { from } => {
            let name = format!("v{}", versions.len());
            let created = engine
                .create_version(CreateVersion::named(name).from_version(pick(from)))
                .unwrap();
            versions.push(created.id);
        }
        Op::Inherit { from } => {
            let name = format!("v{}", versions.len());
            let created = engine
                .create_version(CreateVersion::named(name).inheriting(pick(from)))
                .unwrap();
            versions.push(created.id);
        }
        Op::Undo { version } => {
            let version = pick(version);
            if let Some(latest) = engine.checkpoints(&version).unwrap().first() {
                engine.undo(&version, &latest.id).unwrap();
            }
        }
        Op::Merge { target, source } => {
            let (target, source) = (pick(target), pick(source));
            if target != source {
                engine.merge_version(&target, &source).unwrap();
            }
        }
        Op::Read { version, schema } => {
            engine.state(SCHEMAS[schema], &pick(version)).unwrap();
        }
    }
}

fn check_equivalence(engine: &Engine, versions: &[VersionId]) {
    for schema in SCHEMAS {
        for version in versions {
            let cached: BTreeMap<String, serde_json::Value> = engine
                .state(schema, version)
                .unwrap()
                .into_iter()
                .map(|entity| (entity.entity_id, entity.snapshot_content))
                .collect();

            let mut resolved = BTreeMap::new();
            for entity in 0..ENTITIES {
                let entity_id = format!("e{entity}");
                if let Some(found) = engine.resolve(&entity_id, schema, version).unwrap().into_entity() {
                    resolved.insert(entity_id, found.snapshot_content);
                }
            }
            assert_eq!(cached, resolved, "cache diverged for {schema} in {version}");
        }

        let sql = "SELECT version_id, entity_id, snapshot_content, change_id, inherited_from_version_id \
                   FROM state_all WHERE schema_key = ? ORDER BY version_id, entity_id";
        let rewritten = engine.query(sql, &[Value::from(schema)]).unwrap();
        let passthrough = engine
            .query(&sql.replace("FROM state_all", "FROM main.state_all"), &[Value::from(schema)])
            .unwrap();
        assert_eq!(rewritten, passthrough, "rewritten query diverged for {schema}");
    }
}

fn engine_with_depth(max_inheritance_depth: usize) -> Engine {
    Engine::new(EngineConfig {
        max_inheritance_depth,
        ..EngineConfig::deterministic()
    })
    .unwrap()
}

fn inheritance_depth() -> impl Strategy<Value = usize> {
    prop_oneof![Just(64usize), 1..4usize]
}

/// Every schema's state in `version`.
fn snapshot(engine: &Engine, version: &VersionId) -> Vec<BTreeMap<String, serde_json::Value>> {
    SCHEMAS
        .iter()
        .map(|schema| {
            engine
                .state(schema, version)
                .unwrap()
                .into_iter()
                .map(|entity| (entity.entity_id, entity.snapshot_content))
                .collect()
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_cache_matches_resolver(
        ops in prop::collection::vec(op(), 1..40),
        depth in inheritance_depth(),
    ) {
        let engine = engine_with_depth(depth);
        let mut versions = vec![engine.active_version().unwrap().id];
        for op in &ops {
            apply(&engine, &mut versions, op);
        }
        check_equivalence(&engine, &versions);
        prop_assert!(engine.verify_integrity().unwrap().is_empty());
    }

    #[test]
    fn prop_undo_restores_parent_state(
        history in prop::collection::vec(op(), 0..25),
        edits in prop::collection::vec((0..ENTITIES, 0..2usize, prop::option::of(-5..5i64)), 1..6),
        target in 0..8usize,
        depth in inheritance_depth(),
    ) {
        let engine = engine_with_depth(depth);
        let mut versions = vec![engine.active_version().unwrap().id];
        for op in &history {
            apply(&engine, &mut versions, op);
        }

        let version = versions[target % versions.len()].clone();
        let head = engine.create_checkpoint(&version).unwrap();
        let before = snapshot(&engine, &version);
        for &(entity, schema, value) in &edits {
            let entity_id = format!("e{entity}");
            match value {
                Some(value) => {
                    engine
                        .stage_change(&version, ChangeInput::new(entity_id, SCHEMAS[schema], json!(value)))
                        .unwrap();
                }
                None => {
                    engine.delete_entity(&version, &entity_id, SCHEMAS[schema]).unwrap();
                }
            }
        }
        // Edits that staged nothing leave the head where it was.
        let edited = engine.create_checkpoint(&version).unwrap();
        if edited.id != head.id {
            engine.undo(&version, &edited.id).unwrap();
        }
        prop_assert_eq!(snapshot(&engine, &version), before);
        check_equivalence(&engine, &versions);
        prop_assert!(engine.verify_integrity().unwrap().is_empty());
    }
}

#[test]
fn test_equivalence_with_shallow_inheritance() {
    let engine = engine_with_depth(1);
    let mut versions = vec![engine.active_version().unwrap().id];
    let history = [
        Op::Stage { version: 0, entity: 0, schema: 0, value: 1 },
        Op::Inherit { from: 0 },
        Op::Inherit { from: 1 },
        Op::Read { version: 2, schema: 0 },
        Op::Stage { version: 1, entity: 1, schema: 0, value: 2 },
        Op::Checkpoint { version: 1 },
    ];
    for op in &history {
        apply(&engine, &mut versions, op);
    }
    check_equivalence(&engine, &versions);
    assert!(engine.resolve("e0", "alpha", &versions[2]).unwrap().into_entity().is_none());
    assert!(engine.resolve("e1", "alpha", &versions[2]).unwrap().into_entity().is_some());
}

#[test]
fn test_equivalence_after_inherited_delete_and_undo() {
    let engine = Engine::new(EngineConfig::deterministic()).unwrap();
    let mut versions = vec![engine.active_version().unwrap().id];
    let history = [
        Op::Stage { version: 0, entity: 0, schema: 0, value: 1 },
        Op::Checkpoint { version: 0 },
        Op::Inherit { from: 0 },
        Op::Read { version: 1, schema: 0 },
        Op::Delete { version: 1, entity: 0, schema: 0 },
        Op::Checkpoint { version: 1 },
        Op::Undo { version: 1 },
        Op::Stage { version: 0, entity: 0, schema: 0, value: 2 },
        Op::Fork { from: 1 },
        Op::Merge { target: 2, source: 0 },
        Op::Checkpoint { version: 2 },
    ];
    for op in &history {
        apply(&engine, &mut versions, op);
    }
    check_equivalence(&engine, &versions);
}
