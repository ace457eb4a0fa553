//! Change sets, commits and the parent DAG.
//!
//! Parent edges are rows ordered by `position`. Every commit also carries a
//! materialized ancestry closure: the breadth-first discovery order of all
//! its ancestors starting from itself (depth 0, order 0), following parents
//! in recorded order. Resolution in SQL ranks candidates by that order, so
//! it is recomputed whenever a commit's parents change.

use crate::changes::get_change;
use crate::error::{IntegrityViolation, Result};
use crate::schema::{
    CHANGE_SET_ELEMENT_TABLE, CHANGE_SET_TABLE, COMMIT_ANCESTRY_TABLE, COMMIT_EDGE_TABLE,
    COMMIT_TABLE,
};
use crate::session::Session;
use crate::types::{Change, ChangeId, ChangeSet, ChangeSetElement, ChangeSetId, Commit, CommitId, Timestamp};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashSet, VecDeque};
use tracing::trace;

/// Allocate a change set with no elements.
pub fn create_empty_change_set(session: &mut Session<'_>) -> Result<ChangeSetId> {
    let id = ChangeSetId::new(session.next_id());
    session.conn.execute(
        &format!("INSERT INTO {CHANGE_SET_TABLE} (id) VALUES (?1)"),
        params![id],
    )?;
    Ok(id)
}

/// Build a change set from existing changes.
///
/// Every listed change must exist. When several changes touch the same
/// entity, the last one listed is kept.
pub fn create_change_set(session: &mut Session<'_>, change_ids: &[ChangeId]) -> Result<ChangeSet> {
    let id = ChangeSetId::new(session.next_id());
    let mut changes = Vec::with_capacity(change_ids.len());
    for change_id in change_ids {
        let change = get_change(session.conn, change_id)?.ok_or_else(|| {
            IntegrityViolation::MissingChange {
                change_set: id.clone(),
                change: change_id.clone(),
            }
        })?;
        changes.push(change);
    }

    session.conn.execute(
        &format!("INSERT INTO {CHANGE_SET_TABLE} (id) VALUES (?1)"),
        params![id],
    )?;
    for change in &changes {
        add_to_change_set(session.conn, &id, change)?;
    }

    Ok(ChangeSet {
        elements: change_set_elements(session.conn, &id)?,
        id,
    })
}

/// Put a change into a change set, replacing any element for the same entity.
pub fn add_to_change_set(conn: &Connection, change_set_id: &ChangeSetId, change: &Change) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {CHANGE_SET_ELEMENT_TABLE}
               (change_set_id, change_id, entity_id, schema_key, file_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(change_set_id, entity_id, schema_key)
             DO UPDATE SET change_id = excluded.change_id, file_id = excluded.file_id"
        ),
        params![
            change_set_id,
            change.id,
            change.entity_id,
            change.schema_key,
            change.file_id
        ],
    )?;
    Ok(())
}

pub fn change_set_exists(conn: &Connection, id: &ChangeSetId) -> Result<bool> {
    Ok(conn
        .query_row(
            &format!("SELECT 1 FROM {CHANGE_SET_TABLE} WHERE id = ?1"),
            params![id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

pub fn change_set_elements(conn: &Connection, id: &ChangeSetId) -> Result<Vec<ChangeSetElement>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT change_set_id, change_id, entity_id, schema_key, file_id
         FROM {CHANGE_SET_ELEMENT_TABLE} WHERE change_set_id = ?1
         ORDER BY schema_key, entity_id"
    ))?;
    let elements = stmt
        .query_map(params![id], |row| {
            Ok(ChangeSetElement {
                change_set_id: row.get(0)?,
                change_id: row.get(1)?,
                entity_id: row.get(2)?,
                schema_key: row.get(3)?,
                file_id: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(elements)
}

fn dedup_parents(parents: &[CommitId]) -> Vec<CommitId> {
    let mut seen = HashSet::new();
    parents
        .iter()
        .filter(|parent| seen.insert((*parent).clone()))
        .cloned()
        .collect()
}

/// Create a commit over an existing change set.
///
/// Parents must exist; their order is preserved and duplicates are dropped.
pub fn create_commit(
    session: &mut Session<'_>,
    change_set_id: &ChangeSetId,
    parents: &[CommitId],
) -> Result<Commit> {
    let id = CommitId::new(session.next_id());
    if !change_set_exists(session.conn, change_set_id)? {
        return Err(IntegrityViolation::MissingChangeSet {
            commit: id,
            change_set: change_set_id.clone(),
        }
        .into());
    }
    let parents = dedup_parents(parents);
    for parent in &parents {
        if !commit_exists(session.conn, parent)? {
            return Err(IntegrityViolation::MissingParent {
                commit: id,
                parent: parent.clone(),
            }
            .into());
        }
    }

    let created_at = session.now();
    let seq = session.sequencer.next_sequence() as i64;
    session.conn.execute(
        &format!("INSERT INTO {COMMIT_TABLE} (id, change_set_id, created_at, seq) VALUES (?1, ?2, ?3, ?4)"),
        params![id, change_set_id, created_at, seq],
    )?;
    write_edges(session.conn, &id, &parents)?;
    compute_ancestry(session.conn, &id)?;
    trace!(commit = %id, parents = parents.len(), "created commit");

    Ok(Commit {
        id,
        change_set_id: change_set_id.clone(),
        parent_commit_ids: parents,
        change_ids: change_set_elements(session.conn, change_set_id)?
            .into_iter()
            .map(|element| element.change_id)
            .collect(),
        created_at,
    })
}

fn write_edges(conn: &Connection, child: &CommitId, parents: &[CommitId]) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {COMMIT_EDGE_TABLE} WHERE child_id = ?1"),
        params![child],
    )?;
    for (position, parent) in parents.iter().enumerate() {
        conn.execute(
            &format!("INSERT INTO {COMMIT_EDGE_TABLE} (child_id, parent_id, position) VALUES (?1, ?2, ?3)"),
            params![child, parent, position as i64],
        )?;
    }
    Ok(())
}

pub fn commit_exists(conn: &Connection, id: &CommitId) -> Result<bool> {
    Ok(conn
        .query_row(
            &format!("SELECT 1 FROM {COMMIT_TABLE} WHERE id = ?1"),
            params![id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

pub fn commit_change_set_id(conn: &Connection, id: &CommitId) -> Result<Option<ChangeSetId>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT change_set_id FROM {COMMIT_TABLE} WHERE id = ?1"
    ))?;
    Ok(stmt.query_row(params![id], |row| row.get(0)).optional()?)
}

/// Parents of a commit in recorded order.
pub fn parents(conn: &Connection, id: &CommitId) -> Result<Vec<CommitId>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT parent_id FROM {COMMIT_EDGE_TABLE} WHERE child_id = ?1 ORDER BY position"
    ))?;
    let parents = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<CommitId>>>()?;
    Ok(parents)
}

pub fn get_commit(conn: &Connection, id: &CommitId) -> Result<Option<Commit>> {
    let row = conn
        .query_row(
            &format!("SELECT change_set_id, created_at FROM {COMMIT_TABLE} WHERE id = ?1"),
            params![id],
            |row| Ok((row.get::<_, ChangeSetId>(0)?, row.get::<_, Timestamp>(1)?)),
        )
        .optional()?;
    let Some((change_set_id, created_at)) = row else {
        return Ok(None);
    };
    let change_ids = change_set_elements(conn, &change_set_id)?
        .into_iter()
        .map(|element| element.change_id)
        .collect();
    Ok(Some(Commit {
        id: id.clone(),
        parent_commit_ids: parents(conn, id)?,
        change_set_id,
        change_ids,
        created_at,
    }))
}

/// Breadth-first walk over parents, nearest first, first parent preferred.
///
/// Returns `(commit, depth)` in discovery order, starting with `starts`
/// themselves at depth 0.
pub fn breadth_first(conn: &Connection, starts: &[CommitId]) -> Result<Vec<(CommitId, i64)>> {
    let mut seen: HashSet<CommitId> = HashSet::new();
    let mut queue: VecDeque<(CommitId, i64)> = VecDeque::new();
    for start in starts {
        if seen.insert(start.clone()) {
            queue.push_back((start.clone(), 0));
        }
    }

    let mut order = Vec::new();
    while let Some((commit, depth)) = queue.pop_front() {
        for parent in parents(conn, &commit)? {
            if seen.insert(parent.clone()) {
                queue.push_back((parent, depth + 1));
            }
        }
        order.push((commit, depth));
    }
    Ok(order)
}

/// Recompute the ancestry closure of one commit.
pub fn compute_ancestry(conn: &Connection, id: &CommitId) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {COMMIT_ANCESTRY_TABLE} WHERE commit_id = ?1"),
        params![id],
    )?;
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO {COMMIT_ANCESTRY_TABLE} (commit_id, ancestor_id, ancestor_depth, discovery_order)
         VALUES (?1, ?2, ?3, ?4)"
    ))?;
    for (order, (ancestor, depth)) in breadth_first(conn, std::slice::from_ref(id))?
        .into_iter()
        .enumerate()
    {
        stmt.execute(params![id, ancestor, depth, order as i64])?;
    }
    Ok(())
}

/// All transitive descendants of a commit, parents before children.
fn descendants(conn: &Connection, id: &CommitId) -> Result<Vec<CommitId>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT commit_id FROM {COMMIT_ANCESTRY_TABLE}
         WHERE ancestor_id = ?1 AND commit_id != ?1
         ORDER BY ancestor_depth, commit_id"
    ))?;
    let descendants = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<CommitId>>>()?;
    Ok(descendants)
}

/// True when `ancestor` is reachable from `descendant` (or equal to it).
pub fn is_ancestor(conn: &Connection, ancestor: &CommitId, descendant: &CommitId) -> Result<bool> {
    Ok(conn
        .query_row(
            &format!("SELECT 1 FROM {COMMIT_ANCESTRY_TABLE} WHERE commit_id = ?1 AND ancestor_id = ?2"),
            params![descendant, ancestor],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Ancestors of a commit in discovery order, with their depth.
pub fn ancestry(conn: &Connection, id: &CommitId) -> Result<Vec<(CommitId, i64)>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT ancestor_id, ancestor_depth FROM {COMMIT_ANCESTRY_TABLE}
         WHERE commit_id = ?1 ORDER BY discovery_order"
    ))?;
    let rows = stmt
        .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Replace the parents of a commit.
///
/// Rejects any parent that descends from the commit. The ancestry closure of
/// the commit and of all its descendants is recomputed.
pub fn set_parents(conn: &Connection, id: &CommitId, new_parents: &[CommitId]) -> Result<()> {
    let new_parents = dedup_parents(new_parents);
    for parent in &new_parents {
        if !commit_exists(conn, parent)? {
            return Err(IntegrityViolation::MissingParent {
                commit: id.clone(),
                parent: parent.clone(),
            }
            .into());
        }
        if is_ancestor(conn, id, parent)? {
            return Err(IntegrityViolation::CyclicParent {
                child: id.clone(),
                parent: parent.clone(),
            }
            .into());
        }
    }

    let affected = descendants(conn, id)?;
    write_edges(conn, id, &new_parents)?;
    compute_ancestry(conn, id)?;
    for descendant in affected {
        compute_ancestry(conn, &descendant)?;
    }
    Ok(())
}

/// Stamp a commit with a fresh sequence number (used by the sync outbox).
pub fn touch_commit(session: &mut Session<'_>, id: &CommitId) -> Result<()> {
    let seq = session.sequencer.next_sequence() as i64;
    session.conn.execute(
        &format!("UPDATE {COMMIT_TABLE} SET seq = ?2 WHERE id = ?1"),
        params![id, seq],
    )?;
    Ok(())
}

/// Store a commit produced elsewhere under its original ids.
///
/// The change set is created with the given elements; every element's change
/// and every parent must already exist. Returns false when the commit is
/// already known.
pub fn import_commit(session: &mut Session<'_>, commit: &Commit, elements: &[ChangeSetElement]) -> Result<bool> {
    if commit_exists(session.conn, &commit.id)? {
        return Ok(false);
    }
    session.conn.execute(
        &format!("INSERT OR IGNORE INTO {CHANGE_SET_TABLE} (id) VALUES (?1)"),
        params![commit.change_set_id],
    )?;
    for element in elements {
        let change = get_change(session.conn, &element.change_id)?.ok_or_else(|| {
            IntegrityViolation::MissingChange {
                change_set: commit.change_set_id.clone(),
                change: element.change_id.clone(),
            }
        })?;
        add_to_change_set(session.conn, &commit.change_set_id, &change)?;
    }
    let parents = dedup_parents(&commit.parent_commit_ids);
    for parent in &parents {
        if !commit_exists(session.conn, parent)? {
            return Err(IntegrityViolation::MissingParent {
                commit: commit.id.clone(),
                parent: parent.clone(),
            }
            .into());
        }
    }

    let seq = session.sequencer.next_sequence() as i64;
    session.conn.execute(
        &format!("INSERT INTO {COMMIT_TABLE} (id, change_set_id, created_at, seq) VALUES (?1, ?2, ?3, ?4)"),
        params![commit.id, commit.change_set_id, commit.created_at, seq],
    )?;
    write_edges(session.conn, &commit.id, &parents)?;
    compute_ancestry(session.conn, &commit.id)?;
    trace!(commit = %commit.id, "imported commit");
    Ok(true)
}

/// Commits stamped after `after_seq`, oldest first, with their sequence.
pub fn commits_since(conn: &Connection, after_seq: i64, limit: usize) -> Result<Vec<(Commit, i64)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, seq FROM {COMMIT_TABLE} WHERE seq > ?1 ORDER BY seq LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![after_seq, limit as i64], |row| {
            Ok((row.get::<_, CommitId>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut commits = Vec::with_capacity(rows.len());
    for (id, seq) in rows {
        if let Some(commit) = get_commit(conn, &id)? {
            commits.push((commit, seq));
        }
    }
    Ok(commits)
}

/// Highest sequence number stamped on any commit.
pub fn max_commit_seq(conn: &Connection) -> Result<i64> {
    let seq: Option<i64> = conn.query_row(&format!("SELECT MAX(seq) FROM {COMMIT_TABLE}"), [], |row| {
        row.get(0)
    })?;
    Ok(seq.unwrap_or(0))
}

pub fn commit_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {COMMIT_TABLE}"), [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

pub fn change_set_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {CHANGE_SET_TABLE}"),
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::insert_change;
    use crate::error::EngineError;
    use crate::schema::migrate;
    use crate::sequence::{DeterministicConfig, Sequencer};
    use crate::types::ChangeInput;
    use serde_json::json;

    fn setup() -> (Connection, Sequencer) {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let sequencer =
            Sequencer::load_or_init(&conn, Some(&DeterministicConfig::default())).unwrap();
        (conn, sequencer)
    }

    fn empty_commit(session: &mut Session<'_>, parents: &[CommitId]) -> Commit {
        let cs = create_empty_change_set(session).unwrap();
        create_commit(session, &cs, parents).unwrap()
    }

    #[test]
    fn test_change_set_keeps_last_change_per_entity() {
        let (conn, mut sequencer) = setup();
        let mut session = Session::new(&conn, &mut sequencer);

        let a = insert_change(&mut session, &ChangeInput::new("e1", "s", json!(1))).unwrap();
        let b = insert_change(&mut session, &ChangeInput::new("e1", "s", json!(2))).unwrap();
        let c = insert_change(&mut session, &ChangeInput::new("e2", "s", json!(3))).unwrap();

        let set = create_change_set(&mut session, &[a.id, b.id.clone(), c.id.clone()]).unwrap();
        let ids: Vec<_> = set.elements.iter().map(|e| e.change_id.clone()).collect();
        assert_eq!(ids, vec![b.id, c.id]);
    }

    #[test]
    fn test_change_set_with_missing_change_is_integrity_error() {
        let (conn, mut sequencer) = setup();
        let mut session = Session::new(&conn, &mut sequencer);

        let err = create_change_set(&mut session, &[ChangeId::new("missing")]).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_parent_order_and_dedup() {
        let (conn, mut sequencer) = setup();
        let mut session = Session::new(&conn, &mut sequencer);

        let a = empty_commit(&mut session, &[]);
        let b = empty_commit(&mut session, &[]);
        let merge = empty_commit(&mut session, &[b.id.clone(), a.id.clone(), b.id.clone()]);
        assert_eq!(merge.parent_commit_ids, vec![b.id.clone(), a.id.clone()]);

        let loaded = get_commit(&conn, &merge.id).unwrap().unwrap();
        assert_eq!(loaded.parent_commit_ids, vec![b.id, a.id]);
    }

    #[test]
    fn test_ancestry_is_breadth_first_first_parent_preferred() {
        let (conn, mut sequencer) = setup();
        let mut session = Session::new(&conn, &mut sequencer);

        //   root
        //   /  \
        //  l1   r1
        //  |    |
        //  l2   |
        //   \  /
        //   merge (parents: l2, r1)
        let root = empty_commit(&mut session, &[]);
        let l1 = empty_commit(&mut session, &[root.id.clone()]);
        let l2 = empty_commit(&mut session, &[l1.id.clone()]);
        let r1 = empty_commit(&mut session, &[root.id.clone()]);
        let merge = empty_commit(&mut session, &[l2.id.clone(), r1.id.clone()]);

        let order: Vec<_> = ancestry(&conn, &merge.id)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(order, vec![merge.id.clone(), l2.id, r1.id, l1.id, root.id.clone()]);
        assert!(is_ancestor(&conn, &root.id, &merge.id).unwrap());
        assert!(!is_ancestor(&conn, &merge.id, &root.id).unwrap());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let (conn, mut sequencer) = setup();
        let mut session = Session::new(&conn, &mut sequencer);

        let a = empty_commit(&mut session, &[]);
        let b = empty_commit(&mut session, &[a.id.clone()]);

        let err = set_parents(&conn, &a.id, &[b.id.clone()]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Integrity(IntegrityViolation::CyclicParent { .. })
        ));
        let err = set_parents(&conn, &a.id, &[a.id.clone()]).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_reparenting_updates_descendants() {
        let (conn, mut sequencer) = setup();
        let mut session = Session::new(&conn, &mut sequencer);

        let a = empty_commit(&mut session, &[]);
        let b = empty_commit(&mut session, &[]);
        let child = empty_commit(&mut session, &[b.id.clone()]);
        let grandchild = empty_commit(&mut session, &[child.id.clone()]);

        set_parents(&conn, &b.id, &[a.id.clone()]).unwrap();
        assert!(is_ancestor(&conn, &a.id, &grandchild.id).unwrap());
    }

    #[test]
    fn test_missing_parent_is_rejected() {
        let (conn, mut sequencer) = setup();
        let mut session = Session::new(&conn, &mut sequencer);

        let cs = create_empty_change_set(&mut session).unwrap();
        let err = create_commit(&mut session, &cs, &[CommitId::new("nope")]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Integrity(IntegrityViolation::MissingParent { .. })
        ));
    }
}
