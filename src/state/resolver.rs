//! Ground-truth state resolution by walking the commit graph.
//!
//! No caching happens here. The cache tables and the generic state SQL both
//! have to reproduce what [`resolve`] returns.

use crate::changes::get_change;
use crate::error::{EngineError, Result};
use crate::graph::parents;
use crate::schema::{CHANGE_SET_ELEMENT_TABLE, CHANGE_TABLE, COMMIT_TABLE};
use crate::types::{Change, ChangeId, CommitId, Resolution, ResolvedEntity, VersionId};
use crate::versions::{lineage, require_version};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashSet, VecDeque};

fn change_in_commit(
    conn: &Connection,
    commit_id: &CommitId,
    entity_id: &str,
    schema_key: &str,
) -> Result<Option<ChangeId>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT e.change_id FROM {COMMIT_TABLE} AS c
         JOIN {CHANGE_SET_ELEMENT_TABLE} AS e ON e.change_set_id = c.change_set_id
         WHERE c.id = ?1 AND e.entity_id = ?2 AND e.schema_key = ?3"
    ))?;
    Ok(stmt
        .query_row(params![commit_id, entity_id, schema_key], |row| row.get(0))
        .optional()?)
}

/// First change to `(entity_id, schema_key)` reachable from `starts`.
///
/// Breadth-first, nearest first, parents in recorded order. The returned
/// change may be a tombstone. Version inheritance is not consulted.
pub fn resolve_at_commits(
    conn: &Connection,
    entity_id: &str,
    schema_key: &str,
    starts: &[CommitId],
) -> Result<Option<(Change, CommitId)>> {
    let mut seen: HashSet<CommitId> = HashSet::new();
    let mut queue: VecDeque<CommitId> = VecDeque::new();
    for start in starts {
        if seen.insert(start.clone()) {
            queue.push_back(start.clone());
        }
    }

    while let Some(commit_id) = queue.pop_front() {
        if let Some(change_id) = change_in_commit(conn, &commit_id, entity_id, schema_key)? {
            let change = get_change(conn, &change_id)?
                .ok_or_else(|| EngineError::ChangeNotFound(change_id.clone()))?;
            return Ok(Some((change, commit_id)));
        }
        for parent in parents(conn, &commit_id)? {
            if seen.insert(parent.clone()) {
                queue.push_back(parent);
            }
        }
    }
    Ok(None)
}

/// Value of `(entity_id, schema_key)` in `version_id`.
///
/// The walk starts at the version's working commit, whose first parent is
/// the head, so staged changes shadow committed ones. When the graph is
/// exhausted the inherited version is tried next, up to `max_depth` hops.
/// A tombstone ends the search.
pub fn resolve(
    conn: &Connection,
    entity_id: &str,
    schema_key: &str,
    version_id: &VersionId,
    max_depth: usize,
) -> Result<Resolution> {
    for (depth, source_id) in lineage(conn, version_id, max_depth)?.into_iter().enumerate() {
        let source = require_version(conn, &source_id)?;
        let found = resolve_at_commits(
            conn,
            entity_id,
            schema_key,
            std::slice::from_ref(&source.working_commit_id),
        )?;
        let Some((change, commit_id)) = found else {
            continue;
        };
        let Some(snapshot_content) = change.snapshot_content else {
            return Ok(Resolution::Tombstone {
                change_id: change.id,
                commit_id,
            });
        };
        return Ok(Resolution::Snapshot(ResolvedEntity {
            entity_id: change.entity_id,
            schema_key: change.schema_key,
            schema_version: change.schema_version,
            file_id: change.file_id,
            plugin_key: change.plugin_key,
            snapshot_content,
            metadata: change.metadata,
            version_id: version_id.clone(),
            change_id: change.id,
            commit_id,
            inherited_from_version_id: (depth > 0).then_some(source_id),
            created_at: change.created_at,
        }));
    }
    Ok(Resolution::NotFound)
}

/// Every live entity of one schema in a version, ordered by entity id.
pub fn resolve_schema(
    conn: &Connection,
    schema_key: &str,
    version_id: &VersionId,
    max_depth: usize,
) -> Result<Vec<ResolvedEntity>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT entity_id FROM {CHANGE_TABLE} WHERE schema_key = ?1 ORDER BY entity_id"
    ))?;
    let entity_ids = stmt
        .query_map(params![schema_key], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut entities = Vec::new();
    for entity_id in entity_ids {
        if let Resolution::Snapshot(entity) =
            resolve(conn, &entity_id, schema_key, version_id, max_depth)?
        {
            entities.push(entity);
        }
    }
    Ok(entities)
}
