//! History operations on versions: sealing, checkpoints, undo, grafts and merges.

use crate::changes::{changes_in_change_set, insert_change};
use crate::error::{EngineError, IntegrityViolation, Result};
use crate::graph::commits::{
    ancestry, create_change_set, create_commit, create_empty_change_set, get_commit, is_ancestor,
    parents, set_parents, touch_commit,
};
use crate::labels::{checkpoint_label, commit_has_label, label_commit};
use crate::session::Session;
use crate::state::cache;
use crate::state::resolve_at_commits;
use crate::subscriptions::EngineEvent;
use crate::types::{ChangeInput, Commit, CommitId, LabelId, Version, VersionId};
use crate::versions::{lineage, require_version, update_pointers};
use rusqlite::Connection;
use tracing::{debug, info};

fn load_commit(conn: &Connection, version: &Version, id: &CommitId) -> Result<Commit> {
    get_commit(conn, id)?.ok_or_else(|| {
        IntegrityViolation::DanglingVersionPointer {
            version: version.id.clone(),
            commit: id.clone(),
        }
        .into()
    })
}

/// Seal a version's working commit and open a fresh one on top of it.
///
/// Returns `None` when nothing is staged: no changes in the working change
/// set and no parents besides the head. The sealed commit's parents are the
/// old head followed by any merge parents already recorded. Touched cache
/// scopes are invalidated for the version and its inheritors.
pub fn seal_working_commit(
    session: &mut Session<'_>,
    version: &Version,
    label: Option<&LabelId>,
) -> Result<Option<Commit>> {
    let working = load_commit(session.conn, version, &version.working_commit_id)?;
    let has_merge_parents = working
        .parent_commit_ids
        .iter()
        .any(|parent| *parent != version.head_commit_id);
    if working.change_ids.is_empty() && !has_merge_parents {
        return Ok(None);
    }

    let mut sealed_parents = vec![version.head_commit_id.clone()];
    for parent in &working.parent_commit_ids {
        if !sealed_parents.contains(parent) {
            sealed_parents.push(parent.clone());
        }
    }
    if sealed_parents != working.parent_commit_ids {
        set_parents(session.conn, &working.id, &sealed_parents)?;
    }
    touch_commit(session, &working.id)?;
    if let Some(label) = label {
        label_commit(session.conn, &working.id, label)?;
    }

    let next_change_set = create_empty_change_set(session)?;
    let next_working = create_commit(session, &next_change_set, &[working.id.clone()])?;
    update_pointers(session.conn, &version.id, &working.id, &next_working.id)?;

    for change in changes_in_change_set(session.conn, &working.change_set_id)? {
        cache::invalidate(session.conn, &change.schema_key, &version.id)?;
    }

    let sealed = load_commit(session.conn, version, &working.id)?;
    session.emit(EngineEvent::CommitCreated {
        version_id: version.id.clone(),
        commit_id: sealed.id.clone(),
        change_count: sealed.change_ids.len(),
        checkpoint: label.is_some(),
    });
    Ok(Some(sealed))
}

/// Seal the working commit as a labelled checkpoint.
///
/// Idempotent: with nothing staged the current head is returned unchanged.
pub fn create_checkpoint(session: &mut Session<'_>, version_id: &VersionId) -> Result<Commit> {
    let version = require_version(session.conn, version_id)?;
    let label = checkpoint_label(session.conn)?;
    match seal_working_commit(session, &version, Some(&label.id))? {
        Some(commit) => {
            info!(version = %version.id, commit = %commit.id, changes = commit.change_ids.len(), "created checkpoint");
            Ok(commit)
        }
        None => load_commit(session.conn, &version, &version.head_commit_id),
    }
}

/// Build the inverse of a commit as a new, unparented commit.
///
/// For each change in the commit the value as of the commit's parents is
/// restored. When the parents never touched the entity and `inherited` names
/// a version, the value visible through that version's ancestors is restored
/// instead; entities found nowhere get a tombstone.
pub fn create_undo_commit(
    session: &mut Session<'_>,
    commit_id: &CommitId,
    inherited: Option<(&VersionId, usize)>,
) -> Result<Commit> {
    let commit = get_commit(session.conn, commit_id)?
        .ok_or_else(|| EngineError::CommitNotFound(commit_id.clone()))?;

    let ancestors = match inherited {
        Some((version_id, max_depth)) => lineage(session.conn, version_id, max_depth)?
            .into_iter()
            .skip(1)
            .map(|id| require_version(session.conn, &id).map(|version| version.working_commit_id))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    let mut inverse = Vec::new();
    for change in changes_in_change_set(session.conn, &commit.change_set_id)? {
        let mut previous = resolve_at_commits(
            session.conn,
            &change.entity_id,
            &change.schema_key,
            &commit.parent_commit_ids,
        )?
        .map(|(previous, _)| previous);
        for working in &ancestors {
            if previous.is_some() {
                break;
            }
            previous = resolve_at_commits(
                session.conn,
                &change.entity_id,
                &change.schema_key,
                std::slice::from_ref(working),
            )?
            .map(|(previous, _)| previous);
        }

        let input = match previous.filter(|previous| !previous.is_tombstone()) {
            Some(previous) => ChangeInput {
                entity_id: previous.entity_id,
                schema_key: previous.schema_key,
                schema_version: previous.schema_version,
                file_id: previous.file_id,
                plugin_key: previous.plugin_key,
                snapshot_content: previous.snapshot_content,
                metadata: previous.metadata,
            },
            None => ChangeInput::tombstone(change.entity_id, change.schema_key)
                .with_file_id(change.file_id)
                .with_plugin_key(change.plugin_key)
                .with_schema_version(change.schema_version),
        };
        inverse.push(insert_change(session, &input)?.id);
    }

    let change_set = create_change_set(session, &inverse)?;
    let undo = create_commit(session, &change_set.id, &[])?;
    debug!(target_commit = %commit.id, undo = %undo.id, changes = inverse.len(), "created undo commit");
    Ok(undo)
}

/// Attach an unparented commit as the new head of a version.
///
/// The commit's parent becomes the old head and the working commit is moved
/// on top of it, so staged changes stay staged.
pub fn graft_commit(session: &mut Session<'_>, version_id: &VersionId, commit_id: &CommitId) -> Result<Commit> {
    let version = require_version(session.conn, version_id)?;
    let commit = get_commit(session.conn, commit_id)?
        .ok_or_else(|| EngineError::CommitNotFound(commit_id.clone()))?;
    if !commit.parent_commit_ids.is_empty() {
        return Err(EngineError::InvalidOperation(format!(
            "commit {commit_id} already has parents and cannot be grafted"
        )));
    }

    set_parents(session.conn, &commit.id, &[version.head_commit_id.clone()])?;
    let mut working_parents = vec![commit.id.clone()];
    working_parents.extend(
        parents(session.conn, &version.working_commit_id)?
            .into_iter()
            .filter(|parent| *parent != version.head_commit_id),
    );
    set_parents(session.conn, &version.working_commit_id, &working_parents)?;
    touch_commit(session, &commit.id)?;
    update_pointers(session.conn, &version.id, &commit.id, &version.working_commit_id)?;

    for change in changes_in_change_set(session.conn, &commit.change_set_id)? {
        cache::invalidate(session.conn, &change.schema_key, &version.id)?;
    }

    let grafted = load_commit(session.conn, &version, &commit.id)?;
    info!(version = %version.id, commit = %grafted.id, "grafted commit");
    session.emit(EngineEvent::CommitCreated {
        version_id: version.id.clone(),
        commit_id: grafted.id.clone(),
        change_count: grafted.change_ids.len(),
        checkpoint: false,
    });
    Ok(grafted)
}

/// Record `source`'s head as an extra parent of `target`'s working commit.
///
/// The next checkpoint or commit of `target` seals a merge commit. Already
/// merged heads are ignored.
pub fn merge_version(session: &mut Session<'_>, target_id: &VersionId, source_id: &VersionId) -> Result<()> {
    let target = require_version(session.conn, target_id)?;
    let source = require_version(session.conn, source_id)?;
    if is_ancestor(session.conn, &source.head_commit_id, &target.working_commit_id)? {
        return Ok(());
    }

    let mut working_parents = parents(session.conn, &target.working_commit_id)?;
    working_parents.push(source.head_commit_id.clone());
    set_parents(session.conn, &target.working_commit_id, &working_parents)?;
    cache::invalidate_version(session.conn, &target.id)?;
    info!(target = %target.id, source = %source.id, "merged version");
    Ok(())
}

/// Commits reachable from a version's head, nearest first.
pub fn commit_history(conn: &Connection, version_id: &VersionId, only_checkpoints: bool) -> Result<Vec<Commit>> {
    let version = require_version(conn, version_id)?;
    let checkpoint = if only_checkpoints {
        Some(checkpoint_label(conn)?)
    } else {
        None
    };

    let mut commits = Vec::new();
    for (commit_id, _) in ancestry(conn, &version.head_commit_id)? {
        if let Some(label) = &checkpoint {
            if !commit_has_label(conn, &commit_id, &label.id)? {
                continue;
            }
        }
        commits.push(load_commit(conn, &version, &commit_id)?);
    }
    Ok(commits)
}
