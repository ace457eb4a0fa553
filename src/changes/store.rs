//! Change rows.

use crate::error::{EngineError, Result};
use crate::schema::{CHANGE_SET_ELEMENT_TABLE, CHANGE_TABLE};
use crate::session::Session;
use crate::types::{Change, ChangeId, ChangeInput, ChangeSetId};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Column list matching [`change_from_row`].
pub const CHANGE_COLUMNS: &str = "id, entity_id, schema_key, schema_version, file_id, plugin_key, \
     snapshot_content, metadata, created_at";

fn json_to_text(value: &Option<serde_json::Value>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(EngineError::from)
}

fn text_to_json(raw: Option<String>, index: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
    })
    .transpose()
}

/// Map a row selected with [`CHANGE_COLUMNS`].
pub fn change_from_row(row: &Row<'_>) -> rusqlite::Result<Change> {
    Ok(Change {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        schema_key: row.get(2)?,
        schema_version: row.get(3)?,
        file_id: row.get(4)?,
        plugin_key: row.get(5)?,
        snapshot_content: text_to_json(row.get(6)?, 6)?,
        metadata: text_to_json(row.get(7)?, 7)?,
        created_at: row.get(8)?,
    })
}

/// Append a new change, assigning id and timestamp.
/// Schema key that stands for "every schema" in cache staleness records.
pub const RESERVED_SCHEMA_KEY: &str = "*";

/// Reject schema keys the cache cannot tell apart from its wildcard.
pub fn validate_schema_key(schema_key: &str) -> Result<()> {
    if schema_key.is_empty() || schema_key == RESERVED_SCHEMA_KEY {
        return Err(EngineError::InvalidOperation(format!(
            "schema key {schema_key:?} is reserved"
        )));
    }
    Ok(())
}

pub fn insert_change(session: &mut Session<'_>, input: &ChangeInput) -> Result<Change> {
    let change = Change {
        id: ChangeId::new(session.next_id()),
        entity_id: input.entity_id.clone(),
        schema_key: input.schema_key.clone(),
        schema_version: input.schema_version.clone(),
        file_id: input.file_id.clone(),
        plugin_key: input.plugin_key.clone(),
        snapshot_content: input.snapshot_content.clone(),
        metadata: input.metadata.clone(),
        created_at: session.now(),
    };
    insert_change_with_id(session.conn, &change)?;
    Ok(change)
}

/// Write a fully formed change.
///
/// Returns false when a change with that id already exists; existing rows
/// are never overwritten.
pub fn insert_change_with_id(conn: &Connection, change: &Change) -> Result<bool> {
    validate_schema_key(&change.schema_key)?;
    let inserted = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {CHANGE_TABLE} ({CHANGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            change.id,
            change.entity_id,
            change.schema_key,
            change.schema_version,
            change.file_id,
            change.plugin_key,
            json_to_text(&change.snapshot_content)?,
            json_to_text(&change.metadata)?,
            change.created_at,
        ],
    )?;
    Ok(inserted == 1)
}

pub fn get_change(conn: &Connection, id: &ChangeId) -> Result<Option<Change>> {
    Ok(conn
        .query_row(
            &format!("SELECT {CHANGE_COLUMNS} FROM {CHANGE_TABLE} WHERE id = ?1"),
            params![id],
            change_from_row,
        )
        .optional()?)
}

/// Changes that are members of a change set, ordered by entity.
pub fn changes_in_change_set(conn: &Connection, change_set_id: &ChangeSetId) -> Result<Vec<Change>> {
    let columns = CHANGE_COLUMNS
        .split(", ")
        .map(|column| format!("ch.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {columns} FROM {CHANGE_SET_ELEMENT_TABLE} AS e
         JOIN {CHANGE_TABLE} AS ch ON ch.id = e.change_id
         WHERE e.change_set_id = ?1
         ORDER BY e.schema_key, e.entity_id"
    ))?;
    let changes = stmt
        .query_map(params![change_set_id], change_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(changes)
}

pub fn change_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {CHANGE_TABLE}"), [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::migrate;
    use crate::sequence::{DeterministicConfig, Sequencer};
    use serde_json::json;

    #[test]
    fn test_insert_and_read_back() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let mut sequencer =
            Sequencer::load_or_init(&conn, Some(&DeterministicConfig::default())).unwrap();
        let mut session = Session::new(&conn, &mut sequencer);

        let change = insert_change(
            &mut session,
            &ChangeInput::new("e1", "s", json!({"value": "a"})).with_metadata(json!({"by": "t"})),
        )
        .unwrap();
        let tombstone = insert_change(&mut session, &ChangeInput::tombstone("e1", "s")).unwrap();

        let read = get_change(&conn, &change.id).unwrap().unwrap();
        assert_eq!(read, change);
        assert!(get_change(&conn, &tombstone.id).unwrap().unwrap().is_tombstone());
        assert_eq!(change_count(&conn).unwrap(), 2);
    }

    #[test]
    fn test_existing_change_is_never_overwritten() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let mut sequencer = Sequencer::load_or_init(&conn, None).unwrap();
        let mut session = Session::new(&conn, &mut sequencer);

        let mut change =
            insert_change(&mut session, &ChangeInput::new("e1", "s", json!(1))).unwrap();
        change.snapshot_content = Some(json!(2));
        assert!(!insert_change_with_id(&conn, &change).unwrap());

        let read = get_change(&conn, &change.id).unwrap().unwrap();
        assert_eq!(read.snapshot_content, Some(json!(1)));
    }
}
