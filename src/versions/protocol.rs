//! Staging writes into a version's working commit and committing them.

use crate::changes::insert_change;
use crate::error::{IntegrityViolation, Result};
use crate::graph::{add_to_change_set, commit_change_set_id, seal_working_commit};
use crate::session::Session;
use crate::state::{cache, resolve};
use crate::subscriptions::{ChangeSummary, EngineEvent};
use crate::types::{Change, ChangeInput, Commit, Resolution, Version, VersionId};
use crate::versions::registry::require_version;
use tracing::{info, trace};

/// Put an already written change into a version's working change set.
///
/// Replaces a previously staged change for the same entity, invalidates the
/// touched cache scope and, for tombstones, purges the entity's cached rows.
pub(crate) fn stage_existing(session: &mut Session<'_>, version: &Version, change: &Change) -> Result<()> {
    let change_set_id = commit_change_set_id(session.conn, &version.working_commit_id)?.ok_or_else(
        || IntegrityViolation::DanglingVersionPointer {
            version: version.id.clone(),
            commit: version.working_commit_id.clone(),
        },
    )?;
    add_to_change_set(session.conn, &change_set_id, change)?;

    cache::invalidate(session.conn, &change.schema_key, &version.id)?;
    if change.is_tombstone() {
        cache::purge_entity(session.conn, &change.entity_id, &change.schema_key, &version.id)?;
    }

    trace!(version = %version.id, entity_id = %change.entity_id, schema_key = %change.schema_key, "staged change");
    session.emit(EngineEvent::ChangeStaged {
        version_id: version.id.clone(),
        change: ChangeSummary::from_change(change, usize::MAX),
    });
    Ok(())
}

/// Record a change and stage it in `version_id`.
///
/// The change is visible to the version (and versions inheriting from it)
/// immediately, but only becomes history when the version is committed.
pub fn stage_change(session: &mut Session<'_>, version_id: &VersionId, input: &ChangeInput) -> Result<Change> {
    let version = require_version(session.conn, version_id)?;
    let change = insert_change(session, input)?;
    stage_existing(session, &version, &change)?;
    Ok(change)
}

/// Stage a tombstone for an entity that currently resolves in the version.
///
/// Returns `None` without writing anything when the entity is already absent.
pub fn delete_entity(
    session: &mut Session<'_>,
    version_id: &VersionId,
    entity_id: &str,
    schema_key: &str,
    max_depth: usize,
) -> Result<Option<Change>> {
    let Resolution::Snapshot(current) = resolve(session.conn, entity_id, schema_key, version_id, max_depth)? else {
        return Ok(None);
    };
    let tombstone = ChangeInput::tombstone(current.entity_id, current.schema_key)
        .with_file_id(current.file_id)
        .with_plugin_key(current.plugin_key)
        .with_schema_version(current.schema_version);
    stage_change(session, version_id, &tombstone).map(Some)
}

/// Seal staged changes into a commit without the checkpoint label.
///
/// A no-op returning `None` when nothing is staged.
pub fn commit_version(session: &mut Session<'_>, version_id: &VersionId) -> Result<Option<Commit>> {
    let version = require_version(session.conn, version_id)?;
    let commit = seal_working_commit(session, &version, None)?;
    if let Some(commit) = &commit {
        info!(version = %version.id, commit = %commit.id, changes = commit.change_ids.len(), "committed version");
    }
    Ok(commit)
}
