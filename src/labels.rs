//! Named labels attached to entities.
//!
//! Commits are tagged through the same mechanism as any other entity: an
//! entity label row keyed by the commit id under [`COMMIT_SCHEMA_KEY`].

use crate::error::{EngineError, Result};
use crate::schema::{ENTITY_LABEL_TABLE, LABEL_TABLE};
use crate::session::Session;
use crate::types::{CommitId, Label, LabelId, COMMIT_SCHEMA_KEY, ENGINE_FILE_ID};
use rusqlite::{params, Connection, OptionalExtension};

/// Label marking user-visible save points.
pub const CHECKPOINT_LABEL: &str = "checkpoint";

pub fn label_by_name(conn: &Connection, name: &str) -> Result<Option<Label>> {
    Ok(conn
        .query_row(
            &format!("SELECT id, name FROM {LABEL_TABLE} WHERE name = ?1"),
            params![name],
            |row| {
                Ok(Label {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?)
}

/// Return the label with this name, creating it if needed.
pub fn ensure_label(session: &mut Session<'_>, name: &str) -> Result<Label> {
    if let Some(label) = label_by_name(session.conn, name)? {
        return Ok(label);
    }
    let label = Label {
        id: LabelId::new(session.next_id()),
        name: name.to_string(),
    };
    session.conn.execute(
        &format!("INSERT INTO {LABEL_TABLE} (id, name) VALUES (?1, ?2)"),
        params![label.id, label.name],
    )?;
    Ok(label)
}

/// The checkpoint label; it is created when the engine initializes.
pub fn checkpoint_label(conn: &Connection) -> Result<Label> {
    label_by_name(conn, CHECKPOINT_LABEL)?
        .ok_or_else(|| EngineError::LabelNotFound(CHECKPOINT_LABEL.to_string()))
}

pub fn list_labels(conn: &Connection) -> Result<Vec<Label>> {
    let mut stmt = conn.prepare(&format!("SELECT id, name FROM {LABEL_TABLE} ORDER BY name"))?;
    let labels = stmt
        .query_map([], |row| {
            Ok(Label {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(labels)
}

pub fn attach_label(
    conn: &Connection,
    entity_id: &str,
    schema_key: &str,
    file_id: &str,
    label_id: &LabelId,
) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {ENTITY_LABEL_TABLE} (entity_id, schema_key, file_id, label_id)
             VALUES (?1, ?2, ?3, ?4)"
        ),
        params![entity_id, schema_key, file_id, label_id],
    )?;
    Ok(())
}

/// Labels attached to one entity.
pub fn labels_for_entity(
    conn: &Connection,
    entity_id: &str,
    schema_key: &str,
    file_id: &str,
) -> Result<Vec<Label>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT l.id, l.name FROM {ENTITY_LABEL_TABLE} AS el
         JOIN {LABEL_TABLE} AS l ON l.id = el.label_id
         WHERE el.entity_id = ?1 AND el.schema_key = ?2 AND el.file_id = ?3
         ORDER BY l.name"
    ))?;
    let labels = stmt
        .query_map(params![entity_id, schema_key, file_id], |row| {
            Ok(Label {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(labels)
}

pub fn label_commit(conn: &Connection, commit_id: &CommitId, label_id: &LabelId) -> Result<()> {
    attach_label(conn, commit_id.as_str(), COMMIT_SCHEMA_KEY, ENGINE_FILE_ID, label_id)
}

pub fn commit_has_label(conn: &Connection, commit_id: &CommitId, label_id: &LabelId) -> Result<bool> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT 1 FROM {ENTITY_LABEL_TABLE}
                 WHERE entity_id = ?1 AND schema_key = ?2 AND file_id = ?3 AND label_id = ?4"
            ),
            params![commit_id, COMMIT_SCHEMA_KEY, ENGINE_FILE_ID, label_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::migrate;
    use crate::sequence::Sequencer;

    #[test]
    fn test_ensure_label_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let mut sequencer = Sequencer::load_or_init(&conn, None).unwrap();
        let mut session = Session::new(&conn, &mut sequencer);

        let first = ensure_label(&mut session, CHECKPOINT_LABEL).unwrap();
        let second = ensure_label(&mut session, CHECKPOINT_LABEL).unwrap();
        assert_eq!(first, second);
        assert_eq!(list_labels(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_commit_labels() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let mut sequencer = Sequencer::load_or_init(&conn, None).unwrap();
        let mut session = Session::new(&conn, &mut sequencer);

        let label = ensure_label(&mut session, "release").unwrap();
        let commit = CommitId::new("c1");
        assert!(!commit_has_label(&conn, &commit, &label.id).unwrap());

        label_commit(&conn, &commit, &label.id).unwrap();
        label_commit(&conn, &commit, &label.id).unwrap();
        assert!(commit_has_label(&conn, &commit, &label.id).unwrap());
        assert_eq!(
            labels_for_entity(&conn, "c1", COMMIT_SCHEMA_KEY, ENGINE_FILE_ID).unwrap(),
            vec![label]
        );
    }
}
