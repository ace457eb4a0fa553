//! Explicit write transactions.
//!
//! Writes inside a transaction are buffered as pending rows; queries inside
//! the transaction see them through the overlay (pending rows shadow
//! committed rows of the same entity in the same version). `commit` flushes
//! the pending rows into the change store and the working commits in one
//! SQLite transaction; `rollback` or dropping the transaction discards them.

use crate::changes::{insert_change_with_id, validate_schema_key};
use crate::engine::{run_query, Engine, Inner};
use crate::error::{EngineError, Result};
use crate::graph;
use crate::schema::TRANSACTION_STATE_TABLE;
use crate::session::Session;
use crate::state::resolver::resolve;
use crate::subscriptions::EngineEvent;
use crate::types::{
    Change, ChangeId, ChangeInput, Commit, QueryResult, Resolution, Timestamp, Value, VersionId,
};
use crate::versions::{self, stage_existing};
use parking_lot::MutexGuard;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

/// An open transaction. Holds the engine lock until finished; calling
/// [`Engine`] methods from the same thread meanwhile returns an error.
pub struct Transaction<'e> {
    engine: &'e Engine,
    inner: MutexGuard<'e, Inner>,
    events: Vec<EngineEvent>,
    finished: bool,
}

struct PendingRow {
    change: Change,
    version_id: VersionId,
}

fn pending_rows(conn: &Connection) -> Result<Vec<PendingRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT change_id, entity_id, schema_key, schema_version, file_id, plugin_key,
                snapshot_content, metadata, created_at, version_id
         FROM {TRANSACTION_STATE_TABLE} ORDER BY rowid"
    ))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, ChangeId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Timestamp>(8)?,
                row.get::<_, VersionId>(9)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(
            |(id, entity_id, schema_key, schema_version, file_id, plugin_key, snapshot, metadata, created_at, version_id)| {
                Ok(PendingRow {
                    change: Change {
                        id,
                        entity_id,
                        schema_key,
                        schema_version,
                        file_id,
                        plugin_key,
                        snapshot_content: snapshot.map(|raw| serde_json::from_str(&raw)).transpose()?,
                        metadata: metadata.map(|raw| serde_json::from_str(&raw)).transpose()?,
                        created_at,
                    },
                    version_id,
                })
            },
        )
        .collect()
}

fn pending_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {TRANSACTION_STATE_TABLE}"),
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

impl<'e> Transaction<'e> {
    pub(crate) fn begin(engine: &'e Engine) -> Result<Self> {
        let inner = engine.lock()?;
        inner.conn.execute_batch("BEGIN IMMEDIATE")?;
        if let Err(e) = inner
            .conn
            .execute(&format!("DELETE FROM {TRANSACTION_STATE_TABLE}"), [])
        {
            if let Err(rollback) = inner.conn.execute_batch("ROLLBACK") {
                warn!(error = %rollback, "failed to roll back unopened transaction");
            }
            return Err(e.into());
        }
        engine.set_transaction_thread(Some(std::thread::current().id()));
        debug!("began transaction");
        Ok(Self {
            engine,
            inner,
            events: Vec::new(),
            finished: false,
        })
    }

    /// Buffer a change for `version_id`. Replaces an earlier pending write
    /// to the same entity in the same version.
    pub fn stage_change(&mut self, version_id: &VersionId, input: ChangeInput) -> Result<Change> {
        validate_schema_key(&input.schema_key)?;
        let inner = &mut *self.inner;
        let version = versions::require_version(&inner.conn, version_id)?;
        let change = Change {
            id: ChangeId::new(inner.sequencer.next_id()),
            entity_id: input.entity_id,
            schema_key: input.schema_key,
            schema_version: input.schema_version,
            file_id: input.file_id,
            plugin_key: input.plugin_key,
            snapshot_content: input.snapshot_content,
            metadata: input.metadata,
            created_at: inner.sequencer.next_timestamp(),
        };
        let snapshot = change
            .snapshot_content
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = change.metadata.as_ref().map(serde_json::to_string).transpose()?;

        inner.conn.execute(
            &format!(
                "INSERT INTO {TRANSACTION_STATE_TABLE}
                   (entity_id, schema_key, file_id, plugin_key, schema_version, snapshot_content,
                    metadata, version_id, change_id, commit_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(entity_id, schema_key, version_id) DO UPDATE SET
                   file_id = excluded.file_id, plugin_key = excluded.plugin_key,
                   schema_version = excluded.schema_version,
                   snapshot_content = excluded.snapshot_content, metadata = excluded.metadata,
                   change_id = excluded.change_id, commit_id = excluded.commit_id,
                   created_at = excluded.created_at"
            ),
            params![
                change.entity_id,
                change.schema_key,
                change.file_id,
                change.plugin_key,
                change.schema_version,
                snapshot,
                metadata,
                version.id,
                change.id,
                version.working_commit_id,
                change.created_at
            ],
        )?;
        Ok(change)
    }

    /// Buffer a change for the active version.
    pub fn stage(&mut self, input: ChangeInput) -> Result<Change> {
        let version_id = versions::active_version_id(&self.inner.conn)?;
        self.stage_change(&version_id, input)
    }

    /// Buffer a tombstone for an entity visible in the transaction.
    ///
    /// Returns `None` when the entity is already absent.
    pub fn delete_entity(&mut self, version_id: &VersionId, entity_id: &str, schema_key: &str) -> Result<Option<Change>> {
        let pending: Option<(Option<String>, String, String, String)> = self
            .inner
            .conn
            .query_row(
                &format!(
                    "SELECT snapshot_content, file_id, plugin_key, schema_version
                     FROM {TRANSACTION_STATE_TABLE}
                     WHERE entity_id = ?1 AND schema_key = ?2 AND version_id = ?3"
                ),
                params![entity_id, schema_key, version_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let (file_id, plugin_key, schema_version) = match pending {
            Some((None, ..)) => return Ok(None),
            Some((Some(_), file_id, plugin_key, schema_version)) => (file_id, plugin_key, schema_version),
            None => {
                let max_depth = self.engine.config().max_inheritance_depth;
                match resolve(&self.inner.conn, entity_id, schema_key, version_id, max_depth)? {
                    Resolution::Snapshot(current) => {
                        (current.file_id, current.plugin_key, current.schema_version)
                    }
                    _ => return Ok(None),
                }
            }
        };
        let tombstone = ChangeInput::tombstone(entity_id, schema_key)
            .with_file_id(file_id)
            .with_plugin_key(plugin_key)
            .with_schema_version(schema_version);
        self.stage_change(version_id, tombstone).map(Some)
    }

    /// Query with the transaction's pending writes visible.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let inner = &mut *self.inner;
        let overlay = pending_count(&inner.conn)? > 0;
        run_query(&inner.conn, &mut inner.rewriter, sql, params, overlay)
    }

    /// Number of buffered writes.
    pub fn pending(&self) -> Result<u64> {
        pending_count(&self.inner.conn)
    }

    /// Flush pending writes into the change store and working commits.
    fn flush(&mut self) -> Result<usize> {
        let inner = &mut *self.inner;
        let rows = pending_rows(&inner.conn)?;
        let flushed = rows.len();
        let mut session = Session::new(&inner.conn, &mut inner.sequencer);
        for row in rows {
            insert_change_with_id(session.conn, &row.change)?;
            let version = versions::require_version(session.conn, &row.version_id)?;
            stage_existing(&mut session, &version, &row.change)?;
        }
        self.events.append(&mut session.events);
        inner
            .conn
            .execute(&format!("DELETE FROM {TRANSACTION_STATE_TABLE}"), [])?;
        Ok(flushed)
    }

    /// Flush pending writes and seal them as a checkpoint of `version_id`.
    pub fn create_checkpoint(&mut self, version_id: &VersionId) -> Result<Commit> {
        self.flush()?;
        let inner = &mut *self.inner;
        let mut session = Session::new(&inner.conn, &mut inner.sequencer);
        let commit = graph::create_checkpoint(&mut session, version_id)?;
        self.events.append(&mut session.events);
        Ok(commit)
    }

    /// Make every pending write durable and publish its events.
    pub fn commit(mut self) -> Result<()> {
        let flushed = self.flush()?;
        self.inner.sequencer.persist(&self.inner.conn)?;
        self.inner.conn.execute_batch("COMMIT")?;
        self.finished = true;
        debug!(flushed, "committed transaction");

        let events = std::mem::take(&mut self.events);
        let engine = self.engine;
        drop(self);
        engine.subscriptions().broadcast_all(events);
        Ok(())
    }

    /// Discard every pending write.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.inner
            .conn
            .execute_batch("ROLLBACK")
            .map_err(|e| EngineError::Transaction(e.to_string()))?;
        debug!("rolled back transaction");
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.inner.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "failed to roll back dropped transaction");
            }
        }
        self.engine.set_transaction_thread(None);
    }
}
