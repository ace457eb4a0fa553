//! Commit bundles exchanged between peers.
//!
//! A bundle carries whole commits (commit row, change set elements and the
//! changes they point at) plus the head pointer of every version. The
//! receiver checks the declared commit count and a SHA-256 digest before it
//! writes anything; a bundle that fails either check is incomplete and is
//! dropped as a whole.

use crate::changes::{get_change, insert_change_with_id};
use crate::error::{EngineError, IntegrityViolation, Result};
use crate::graph::{
    add_to_change_set, change_set_elements, commit_exists, commits_since, create_commit,
    create_empty_change_set, get_commit, import_commit, is_ancestor, set_parents,
};
use crate::labels::{checkpoint_label, commit_has_label, label_commit};
use crate::schema::{COMMIT_TABLE, VERSION_TABLE};
use crate::session::Session;
use crate::state::cache;
use crate::subscriptions::EngineEvent;
use crate::types::{Change, ChangeSetElement, Commit, CommitId, Version, VersionId};
use crate::versions::{self, insert_version};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// A commit with everything needed to store it on another peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundledCommit {
    pub commit: Commit,
    pub elements: Vec<ChangeSetElement>,
    pub changes: Vec<Change>,
    /// Carries the checkpoint label on the sending peer.
    #[serde(default)]
    pub checkpoint: bool,
}

/// Where a version's head points on the sending peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHead {
    pub id: VersionId,
    pub name: String,
    pub head_commit_id: CommitId,
    pub inherits_from_version_id: Option<VersionId>,
    pub hidden: bool,
}

impl From<&Version> for VersionHead {
    fn from(version: &Version) -> Self {
        Self {
            id: version.id.clone(),
            name: version.name.clone(),
            head_commit_id: version.head_commit_id.clone(),
            inherits_from_version_id: version.inherits_from_version_id.clone(),
            hidden: version.hidden,
        }
    }
}

/// Unit of exchange between peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncBundle {
    pub commits: Vec<BundledCommit>,
    pub versions: Vec<VersionHead>,
    /// Number of commits the sender put in the bundle.
    pub expected_commits: usize,
    /// Hex SHA-256 over the JSON encoding of `(commits, versions)`.
    pub checksum: String,
}

fn digest(commits: &[BundledCommit], versions: &[VersionHead]) -> Result<String> {
    let encoded = serde_json::to_vec(&(commits, versions))?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

impl SyncBundle {
    pub fn new(commits: Vec<BundledCommit>, versions: Vec<VersionHead>) -> Result<Self> {
        let checksum = digest(&commits, &versions)?;
        Ok(Self {
            expected_commits: commits.len(),
            commits,
            versions,
            checksum,
        })
    }

    /// Reject bundles that lost or altered content in transit.
    pub fn verify(&self) -> Result<()> {
        if self.commits.len() != self.expected_commits {
            return Err(EngineError::Sync(format!(
                "incomplete bundle: expected {} commits, got {}",
                self.expected_commits,
                self.commits.len()
            )));
        }
        let got = digest(&self.commits, &self.versions)?;
        if got != self.checksum {
            return Err(EngineError::Sync(format!(
                "incomplete bundle: checksum {got} does not match {}",
                self.checksum
            )));
        }
        for bundled in &self.commits {
            for element in &bundled.elements {
                if !bundled.changes.iter().any(|change| change.id == element.change_id) {
                    return Err(EngineError::Sync(format!(
                        "incomplete bundle: commit {} lacks change {}",
                        bundled.commit.id, element.change_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Commits waiting to be pushed, with the sequence number to record once
/// the push succeeds.
#[derive(Debug)]
pub(crate) struct Outbox {
    pub bundle: SyncBundle,
    pub last_seq: i64,
}

fn working_commit_ids(conn: &Connection) -> Result<Vec<CommitId>> {
    Ok(versions::list_versions(conn, true)?
        .into_iter()
        .map(|version| version.working_commit_id)
        .collect())
}

/// True when sealed commits newer than `watermark` exist.
pub(crate) fn has_unpushed(conn: &Connection, watermark: i64) -> Result<bool> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {COMMIT_TABLE}
             WHERE seq > ?1 AND id NOT IN (SELECT working_commit_id FROM {VERSION_TABLE})"
        ),
        params![watermark],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Collect up to `batch_size` commits stamped after `watermark`.
///
/// Open working commits are skipped; sealing restamps them, so they are
/// picked up once they become history. `None` when nothing was stamped.
pub(crate) fn collect_outbox(conn: &Connection, watermark: i64, batch_size: usize) -> Result<Option<Outbox>> {
    let rows = commits_since(conn, watermark, batch_size.max(1))?;
    let Some(last_seq) = rows.last().map(|(_, seq)| *seq) else {
        return Ok(None);
    };

    let working = working_commit_ids(conn)?;
    let checkpoint = checkpoint_label(conn)?;
    let mut commits = Vec::new();
    for (commit, _) in rows {
        if working.contains(&commit.id) {
            continue;
        }
        let elements = change_set_elements(conn, &commit.change_set_id)?;
        let mut changes = Vec::with_capacity(elements.len());
        for element in &elements {
            let change = get_change(conn, &element.change_id)?.ok_or_else(|| {
                IntegrityViolation::MissingChange {
                    change_set: commit.change_set_id.clone(),
                    change: element.change_id.clone(),
                }
            })?;
            changes.push(change);
        }
        commits.push(BundledCommit {
            checkpoint: commit_has_label(conn, &commit.id, &checkpoint.id)?,
            commit,
            elements,
            changes,
        });
    }

    let heads = versions::list_versions(conn, true)?
        .iter()
        .map(VersionHead::from)
        .collect();
    Ok(Some(Outbox {
        bundle: SyncBundle::new(commits, heads)?,
        last_seq,
    }))
}

/// What applying one bundle did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub imported: usize,
    pub fast_forwarded: usize,
    pub created: usize,
}

/// Store a verified bundle's commits and move version heads forward.
///
/// Commits are imported parents first regardless of bundle order. A commit
/// whose parent is neither local nor in the bundle fails the whole apply.
/// A local version moves only when its head is an ancestor of the remote
/// head and nothing is staged; diverged versions are left alone.
pub(crate) fn apply_bundle(session: &mut Session<'_>, bundle: &SyncBundle) -> Result<ApplyOutcome> {
    bundle.verify()?;
    let mut outcome = ApplyOutcome::default();
    let checkpoint = checkpoint_label(session.conn)?;

    let mut pending: Vec<&BundledCommit> = bundle.commits.iter().collect();
    while !pending.is_empty() {
        let mut ready = Vec::new();
        let mut blocked = Vec::new();
        for bundled in pending {
            let mut parents_known = true;
            for parent in &bundled.commit.parent_commit_ids {
                if !commit_exists(session.conn, parent)? {
                    parents_known = false;
                    break;
                }
            }
            if parents_known {
                ready.push(bundled);
            } else {
                blocked.push(bundled);
            }
        }
        if ready.is_empty() {
            let orphan = &blocked[0].commit;
            return Err(EngineError::Sync(format!(
                "commit {} references parents unknown to this peer",
                orphan.id
            )));
        }
        for bundled in ready {
            for change in &bundled.changes {
                insert_change_with_id(session.conn, change)?;
            }
            let stored = if commit_exists(session.conn, &bundled.commit.id)? {
                adopt_working_commit(session, bundled)?
            } else {
                import_commit(session, &bundled.commit, &bundled.elements)?
            };
            if stored {
                if bundled.checkpoint {
                    label_commit(session.conn, &bundled.commit.id, &checkpoint.id)?;
                }
                outcome.imported += 1;
            }
        }
        pending = blocked;
    }

    for head in &bundle.versions {
        if !commit_exists(session.conn, &head.head_commit_id)? {
            debug!(version = %head.id, commit = %head.head_commit_id, "head not received yet");
            continue;
        }
        match versions::get_version(session.conn, &head.id)? {
            None => {
                if versions::version_by_name(session.conn, &head.name)?.is_some() {
                    warn!(version = %head.id, name = %head.name, "version name taken locally; not created");
                    continue;
                }
                create_from_head(session, head)?;
                outcome.created += 1;
            }
            Some(local) => {
                if fast_forward(session, &local, &head.head_commit_id)? {
                    outcome.fast_forwarded += 1;
                }
            }
        }
    }

    if outcome != ApplyOutcome::default() {
        session.emit(EngineEvent::SyncApplied {
            commit_count: outcome.imported,
        });
    }
    Ok(outcome)
}

/// Take over the sealed form of a commit that is still open locally.
///
/// Peers restored from the same snapshot share their open working commits.
/// When the other side seals one first, the local copy is still empty; it
/// receives the sealed contents and parents, and its version moves on top of
/// it. Returns false when the commit is already sealed here or has local
/// staged changes.
fn adopt_working_commit(session: &mut Session<'_>, bundled: &BundledCommit) -> Result<bool> {
    let commit = &bundled.commit;
    let Some(version) = versions::list_versions(session.conn, true)?
        .into_iter()
        .find(|version| version.working_commit_id == commit.id)
    else {
        return Ok(false);
    };
    let local = get_commit(session.conn, &commit.id)?.ok_or_else(|| {
        IntegrityViolation::DanglingVersionPointer {
            version: version.id.clone(),
            commit: commit.id.clone(),
        }
    })?;
    if !local.change_ids.is_empty() {
        warn!(version = %version.id, commit = %commit.id, "open commit sealed by peer has local changes; not adopted");
        return Ok(false);
    }

    for element in &bundled.elements {
        let change = get_change(session.conn, &element.change_id)?.ok_or_else(|| {
            IntegrityViolation::MissingChange {
                change_set: local.change_set_id.clone(),
                change: element.change_id.clone(),
            }
        })?;
        add_to_change_set(session.conn, &local.change_set_id, &change)?;
    }
    set_parents(session.conn, &commit.id, &commit.parent_commit_ids)?;

    let working_commit_id = open_working_commit(session, &commit.id)?;
    versions::update_pointers(session.conn, &version.id, &commit.id, &working_commit_id)?;
    cache::invalidate_version(session.conn, &version.id)?;
    debug!(version = %version.id, commit = %commit.id, "adopted commit sealed by peer");
    Ok(true)
}

fn open_working_commit(session: &mut Session<'_>, head: &CommitId) -> Result<CommitId> {
    let change_set = create_empty_change_set(session)?;
    Ok(create_commit(session, &change_set, std::slice::from_ref(head))?.id)
}

fn create_from_head(session: &mut Session<'_>, head: &VersionHead) -> Result<()> {
    let inherits_from = match &head.inherits_from_version_id {
        Some(parent) if versions::get_version(session.conn, parent)?.is_some() => Some(parent.clone()),
        _ => None,
    };
    let working_commit_id = open_working_commit(session, &head.head_commit_id)?;
    insert_version(
        session.conn,
        &Version {
            id: head.id.clone(),
            name: head.name.clone(),
            head_commit_id: head.head_commit_id.clone(),
            working_commit_id,
            inherits_from_version_id: inherits_from,
            hidden: head.hidden,
        },
    )?;
    debug!(version = %head.id, "created version from peer");
    Ok(())
}

fn fast_forward(session: &mut Session<'_>, local: &Version, remote_head: &CommitId) -> Result<bool> {
    if local.head_commit_id == *remote_head || is_ancestor(session.conn, remote_head, &local.head_commit_id)? {
        return Ok(false);
    }
    if !is_ancestor(session.conn, &local.head_commit_id, remote_head)? {
        warn!(version = %local.id, local = %local.head_commit_id, remote = %remote_head, "version diverged from peer; not moved");
        return Ok(false);
    }
    let working = get_commit(session.conn, &local.working_commit_id)?.ok_or_else(|| {
        IntegrityViolation::DanglingVersionPointer {
            version: local.id.clone(),
            commit: local.working_commit_id.clone(),
        }
    })?;
    let staged = !working.change_ids.is_empty()
        || working.parent_commit_ids != std::slice::from_ref(&local.head_commit_id);
    if staged {
        warn!(version = %local.id, "version has staged changes; not fast-forwarded");
        return Ok(false);
    }

    let working_commit_id = open_working_commit(session, remote_head)?;
    versions::update_pointers(session.conn, &local.id, remote_head, &working_commit_id)?;
    cache::invalidate_version(session.conn, &local.id)?;
    debug!(version = %local.id, head = %remote_head, "fast-forwarded version");
    Ok(true)
}
