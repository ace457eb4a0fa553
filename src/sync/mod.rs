//! Commit exchange with other peers.
//!
//! Sealed commits are pushed in sequence order from a persisted watermark;
//! received bundles are imported and version heads fast-forwarded. The
//! exchange is off until [`Engine::set_sync_enabled`] turns it on, and the
//! toggle lives in the key-value table so it survives snapshots.

mod bundle;
mod transport;
mod worker;

pub use bundle::{ApplyOutcome, BundledCommit, SyncBundle, VersionHead};
pub use transport::{MemoryHub, MemoryTransport, SyncTransport};
pub use worker::{SyncConfig, SyncWorker};

use crate::engine::Engine;
use crate::error::Result;
use crate::graph::max_commit_seq;
use crate::schema::KEY_VALUE_TABLE;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

const SYNC_ENABLED_KEY: &str = "lix_sync_enabled";
const PUSH_WATERMARK_KEY: &str = "lix_sync_push_watermark";

fn read_key(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            &format!("SELECT value FROM {KEY_VALUE_TABLE} WHERE key = ?1"),
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn write_key(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {KEY_VALUE_TABLE} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        ),
        params![key, value],
    )?;
    Ok(())
}

pub(crate) fn set_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    write_key(conn, SYNC_ENABLED_KEY, if enabled { "true" } else { "false" })
}

pub(crate) fn is_enabled(conn: &Connection) -> Result<bool> {
    Ok(read_key(conn, SYNC_ENABLED_KEY)?.as_deref() == Some("true"))
}

/// Sequence number of the last commit a push succeeded for.
pub(crate) fn push_watermark(conn: &Connection) -> Result<i64> {
    Ok(read_key(conn, PUSH_WATERMARK_KEY)?
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0))
}

fn set_push_watermark(conn: &Connection, seq: i64) -> Result<()> {
    write_key(conn, PUSH_WATERMARK_KEY, &seq.to_string())
}

/// Result of one push/pull round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub imported: usize,
    /// Bundles dropped as incomplete or deferred because they failed to apply.
    pub rejected: usize,
}

/// Push the next batch of sealed commits.
///
/// The watermark only moves after the transport accepted the bundle, so a
/// failed push is resent whole next time. Returns the number of commits sent.
pub fn push_once(engine: &Engine, transport: &mut dyn SyncTransport, batch_size: usize) -> Result<usize> {
    let outbox = engine.read(|conn| bundle::collect_outbox(conn, push_watermark(conn)?, batch_size))?;
    let Some(outbox) = outbox else {
        return Ok(0);
    };

    let pushed = outbox.bundle.commits.len();
    if pushed > 0 {
        transport.push(&outbox.bundle)?;
    }
    engine.write(|session| set_push_watermark(session.conn, outbox.last_seq))?;
    debug!(pushed, watermark = outbox.last_seq, "pushed commits");
    Ok(pushed)
}

/// Pull and apply every bundle the transport has.
///
/// Incomplete bundles are logged and skipped before anything is written.
/// Each remaining bundle is applied in its own transaction; one that fails
/// does not stop the others. Failed bundles are retried while the pass makes
/// progress, since a later bundle may carry their parents, and whatever
/// still fails is handed back to the transport for the next pull.
pub fn pull_once(engine: &Engine, transport: &mut dyn SyncTransport) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    let mut pending = Vec::new();
    for received in transport.pull()? {
        if let Err(e) = received.verify() {
            warn!(error = %e, "rejected bundle");
            report.rejected += 1;
            continue;
        }
        pending.push(received);
    }

    loop {
        let mut failed = Vec::new();
        let attempted = pending.len();
        for received in pending {
            match apply_received(engine, &received) {
                Ok(imported) => report.imported += imported,
                Err(e) => {
                    debug!(error = %e, commits = received.commits.len(), "bundle not applied");
                    failed.push(received);
                }
            }
        }
        let progressed = failed.len() < attempted;
        pending = failed;
        if pending.is_empty() || !progressed {
            break;
        }
    }

    if !pending.is_empty() {
        warn!(bundles = pending.len(), "deferring bundles that could not be applied");
        report.rejected += pending.len();
        transport.requeue(pending);
    }
    Ok(report)
}

fn apply_received(engine: &Engine, received: &SyncBundle) -> Result<usize> {
    let outcome = engine.write(|session| {
        let watermark = push_watermark(session.conn)?;
        let caught_up = !bundle::has_unpushed(session.conn, watermark)?;
        let outcome = bundle::apply_bundle(session, received)?;
        // Received commits need no echo when nothing local is waiting.
        if caught_up {
            set_push_watermark(session.conn, max_commit_seq(session.conn)?)?;
        }
        Ok(outcome)
    })?;
    Ok(outcome.imported)
}

/// One full round: push, then pull.
pub fn sync_once(engine: &Engine, transport: &mut dyn SyncTransport, batch_size: usize) -> Result<SyncReport> {
    let pushed = push_once(engine, transport, batch_size)?;
    let mut report = pull_once(engine, transport)?;
    report.pushed = pushed;
    Ok(report)
}
