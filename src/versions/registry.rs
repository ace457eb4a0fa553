//! Version rows and the active-version pointer.

use crate::error::{EngineError, IntegrityViolation, Result};
use crate::graph::{create_commit, create_empty_change_set};
use crate::schema::{ACTIVE_VERSION_TABLE, VERSION_TABLE};
use crate::session::Session;
use crate::subscriptions::{EngineEvent, VersionSummary};
use crate::types::{CommitId, CreateVersion, Version, VersionId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{HashSet, VecDeque};
use tracing::info;

/// Name of the version created when an engine is initialized.
pub const MAIN_VERSION_NAME: &str = "main";

const VERSION_COLUMNS: &str =
    "id, name, head_commit_id, working_commit_id, inherits_from_version_id, hidden";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<Version> {
    Ok(Version {
        id: row.get(0)?,
        name: row.get(1)?,
        head_commit_id: row.get(2)?,
        working_commit_id: row.get(3)?,
        inherits_from_version_id: row.get(4)?,
        hidden: row.get::<_, i64>(5)? != 0,
    })
}

pub fn get_version(conn: &Connection, id: &VersionId) -> Result<Option<Version>> {
    Ok(conn
        .query_row(
            &format!("SELECT {VERSION_COLUMNS} FROM {VERSION_TABLE} WHERE id = ?1"),
            params![id],
            version_from_row,
        )
        .optional()?)
}

pub fn require_version(conn: &Connection, id: &VersionId) -> Result<Version> {
    get_version(conn, id)?.ok_or_else(|| EngineError::VersionNotFound(id.to_string()))
}

pub fn version_by_name(conn: &Connection, name: &str) -> Result<Option<Version>> {
    Ok(conn
        .query_row(
            &format!("SELECT {VERSION_COLUMNS} FROM {VERSION_TABLE} WHERE name = ?1"),
            params![name],
            version_from_row,
        )
        .optional()?)
}

pub fn list_versions(conn: &Connection, include_hidden: bool) -> Result<Vec<Version>> {
    let filter = if include_hidden { "" } else { " WHERE hidden = 0" };
    let mut stmt = conn.prepare(&format!(
        "SELECT {VERSION_COLUMNS} FROM {VERSION_TABLE}{filter} ORDER BY name"
    ))?;
    let versions = stmt
        .query_map([], version_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(versions)
}

/// Create a version.
///
/// With `from` the new version forks that version's head; otherwise a
/// genesis commit is created. Either way a fresh empty working commit is
/// opened on top of the head.
pub fn create_version(session: &mut Session<'_>, options: &CreateVersion) -> Result<Version> {
    let id = VersionId::new(session.next_id());
    let name = options.name.clone().unwrap_or_else(|| id.to_string());
    if version_by_name(session.conn, &name)?.is_some() {
        return Err(EngineError::VersionExists(name));
    }
    if let Some(parent) = &options.inherits_from {
        require_version(session.conn, parent)?;
    }

    let head_commit_id = match &options.from {
        Some(source) => require_version(session.conn, source)?.head_commit_id,
        None => {
            let change_set = create_empty_change_set(session)?;
            create_commit(session, &change_set, &[])?.id
        }
    };
    let working_change_set = create_empty_change_set(session)?;
    let working = create_commit(session, &working_change_set, &[head_commit_id.clone()])?;

    let version = Version {
        id,
        name,
        head_commit_id,
        working_commit_id: working.id,
        inherits_from_version_id: options.inherits_from.clone(),
        hidden: options.hidden,
    };
    insert_version(session.conn, &version)?;

    info!(version = %version.id, name = %version.name, "created version");
    session.emit(EngineEvent::VersionCreated {
        version: VersionSummary::from_version(&version),
    });
    Ok(version)
}

/// Write a version row as given (ids included).
pub(crate) fn insert_version(conn: &Connection, version: &Version) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO {VERSION_TABLE} ({VERSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
        params![
            version.id,
            version.name,
            version.head_commit_id,
            version.working_commit_id,
            version.inherits_from_version_id,
            version.hidden as i64
        ],
    )?;
    Ok(())
}

/// Move both pointers of a version.
pub fn update_pointers(
    conn: &Connection,
    id: &VersionId,
    head_commit_id: &CommitId,
    working_commit_id: &CommitId,
) -> Result<()> {
    let updated = conn.execute(
        &format!(
            "UPDATE {VERSION_TABLE} SET head_commit_id = ?2, working_commit_id = ?3 WHERE id = ?1"
        ),
        params![id, head_commit_id, working_commit_id],
    )?;
    if updated == 0 {
        return Err(EngineError::VersionNotFound(id.to_string()));
    }
    Ok(())
}

pub fn active_version_id(conn: &Connection) -> Result<VersionId> {
    conn.query_row(
        &format!("SELECT version_id FROM {ACTIVE_VERSION_TABLE} WHERE id = 1"),
        [],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| EngineError::VersionNotFound("active version".to_string()))
}

/// Point the active-version row at `id`. Touches nothing else.
pub fn set_active_version(conn: &Connection, id: &VersionId) -> Result<()> {
    require_version(conn, id)?;
    conn.execute(
        &format!(
            "INSERT INTO {ACTIVE_VERSION_TABLE} (id, version_id) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version_id = excluded.version_id"
        ),
        params![id],
    )?;
    Ok(())
}

pub fn hide_version(conn: &Connection, id: &VersionId) -> Result<()> {
    require_version(conn, id)?;
    if active_version_id(conn)? == *id {
        return Err(EngineError::InvalidOperation(format!(
            "cannot hide the active version {id}"
        )));
    }
    conn.execute(
        &format!("UPDATE {VERSION_TABLE} SET hidden = 1 WHERE id = ?1"),
        params![id],
    )?;
    Ok(())
}

/// `id` followed by the versions it inherits from, nearest first.
pub fn lineage(conn: &Connection, id: &VersionId, max_depth: usize) -> Result<Vec<VersionId>> {
    let mut chain = vec![id.clone()];
    let mut seen: HashSet<VersionId> = chain.iter().cloned().collect();
    let mut current = require_version(conn, id)?;
    while let Some(parent) = current.inherits_from_version_id.clone() {
        if !seen.insert(parent.clone()) {
            return Err(IntegrityViolation::InheritanceCycle(id.clone()).into());
        }
        if chain.len() > max_depth {
            break;
        }
        chain.push(parent.clone());
        current = require_version(conn, &parent)?;
    }
    Ok(chain)
}

/// Versions that inherit from `id`, directly or transitively.
pub fn inheritors(conn: &Connection, id: &VersionId) -> Result<Vec<VersionId>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT id FROM {VERSION_TABLE} WHERE inherits_from_version_id = ?1 ORDER BY id"
    ))?;
    let mut found = Vec::new();
    let mut seen: HashSet<VersionId> = HashSet::from([id.clone()]);
    let mut queue = VecDeque::from([id.clone()]);
    while let Some(current) = queue.pop_front() {
        let direct = stmt
            .query_map(params![current], |row| row.get::<_, VersionId>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for child in direct {
            if seen.insert(child.clone()) {
                found.push(child.clone());
                queue.push_back(child);
            }
        }
    }
    Ok(found)
}

/// Change which version `id` falls back to. Rejects inheritance cycles.
pub fn set_inherits_from(conn: &Connection, id: &VersionId, parent: Option<&VersionId>) -> Result<()> {
    require_version(conn, id)?;
    if let Some(parent) = parent {
        require_version(conn, parent)?;
        if parent == id || inheritors(conn, id)?.contains(parent) {
            return Err(IntegrityViolation::InheritanceCycle(id.clone()).into());
        }
    }
    conn.execute(
        &format!("UPDATE {VERSION_TABLE} SET inherits_from_version_id = ?2 WHERE id = ?1"),
        params![id, parent],
    )?;
    Ok(())
}

pub fn version_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {VERSION_TABLE}"), [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}
