//! Main Engine struct tying all components together.

use crate::changes::{change_count, get_change};
use crate::error::{EngineError, IntegrityViolation, Result};
use crate::graph::{self, change_set_count, commit_count};
use crate::labels::{self, CHECKPOINT_LABEL};
use crate::persist;
use crate::plugin::ChangeDetector;
use crate::rewrite::{RewriteContext, Rewriter, DEFAULT_PARSE_CACHE_SIZE};
use crate::schema::{
    migrate, CHANGE_SET_ELEMENT_TABLE, CHANGE_SET_TABLE, CHANGE_TABLE, COMMIT_ANCESTRY_TABLE,
    COMMIT_EDGE_TABLE, COMMIT_TABLE, VERSION_TABLE,
};
use crate::sequence::{DeterministicConfig, Sequencer};
use crate::session::Session;
use crate::state::cache::{self, CacheScope};
use crate::state::sql::{VersionFilter, MAX_INHERITANCE_DEPTH};
use crate::state::resolver;
use crate::subscriptions::{
    EngineEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId, SubscriptionManager,
    DEFAULT_PAYLOAD_THRESHOLD,
};
use crate::sync;
use crate::transaction::Transaction;
use crate::types::{
    Change, ChangeId, ChangeInput, Commit, CommitId, CreateVersion, EngineStats, Label,
    QueryResult, Resolution, ResolvedEntity, Value, Version, VersionId,
};
use crate::versions::{self, MAIN_VERSION_NAME};
use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params_from_iter, Connection};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};
use tracing::{info, trace, warn};

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Reproducible ids and timestamps (tests, simulations).
    pub deterministic: Option<DeterministicConfig>,

    /// Number of parsed statements kept by the query rewriter.
    pub parse_cache_size: usize,

    /// Inheritance hops followed when resolving state, by the resolver and
    /// the cached state SQL alike.
    pub max_inheritance_depth: usize,

    /// Snapshots larger than this (bytes) are left out of change events.
    pub subscription_payload_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deterministic: None,
            parse_cache_size: DEFAULT_PARSE_CACHE_SIZE,
            max_inheritance_depth: MAX_INHERITANCE_DEPTH as usize,
            subscription_payload_threshold: DEFAULT_PAYLOAD_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Default configuration with deterministic ids and timestamps.
    pub fn deterministic() -> Self {
        Self {
            deterministic: Some(DeterministicConfig::default()),
            ..Default::default()
        }
    }
}

/// Everything guarded by the engine lock.
pub(crate) struct Inner {
    pub conn: Connection,
    pub sequencer: Sequencer,
    pub rewriter: Rewriter,
}

/// The state engine.
///
/// One SQLite connection behind one lock: writers and readers serialize, so
/// a reader never observes a half-populated cache scope.
pub struct Engine {
    config: EngineConfig,
    inner: Mutex<Inner>,
    /// Thread holding the engine through an open [`Transaction`].
    transaction_thread: Mutex<Option<ThreadId>>,
    subscriptions: SubscriptionManager,
    /// Held for the lifetime of an engine opened from a file.
    _lock_file: Option<File>,
}

impl Engine {
    /// Create an empty in-memory engine.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, config, None)
    }

    /// Restore an engine from [`Engine::export_snapshot`] output.
    ///
    /// Id and timestamp sequences continue where the exported engine stopped.
    pub fn from_snapshot(bytes: &[u8], config: EngineConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        persist::import(&conn, bytes)?;
        Self::from_connection(conn, config, None)
    }

    /// Open the engine stored at `path`, or create a new one.
    ///
    /// The file is locked exclusively until the engine is dropped.
    pub fn open_path(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let path = path.as_ref();
        let lock_file = Self::acquire_lock(path)?;
        let conn = Connection::open_in_memory()?;
        if path.exists() {
            persist::import(&conn, &fs::read(path)?)?;
        }
        Self::from_connection(conn, config, Some(lock_file))
    }

    fn from_connection(conn: Connection, config: EngineConfig, lock_file: Option<File>) -> Result<Self> {
        migrate(&conn)?;
        let sequencer = Sequencer::load_or_init(&conn, config.deterministic.as_ref())?;
        let engine = Self {
            inner: Mutex::new(Inner {
                conn,
                sequencer,
                rewriter: Rewriter::new(config.parse_cache_size),
            }),
            transaction_thread: Mutex::new(None),
            subscriptions: SubscriptionManager::with_payload_threshold(
                config.subscription_payload_threshold,
            ),
            config,
            _lock_file: lock_file,
        };
        engine.initialize()?;
        Ok(engine)
    }

    /// Create the main version and the checkpoint label on first use.
    fn initialize(&self) -> Result<()> {
        self.write(|session| {
            labels::ensure_label(session, CHECKPOINT_LABEL)?;
            cache::configure_inheritance_depth(session.conn, self.config.max_inheritance_depth)?;
            if versions::version_count(session.conn)? == 0 {
                let main = versions::create_version(session, &CreateVersion::named(MAIN_VERSION_NAME))?;
                versions::set_active_version(session.conn, &main.id)?;
                info!(version = %main.id, "initialized engine");
                // Nobody can be subscribed yet.
                session.events.clear();
            }
            Ok(())
        })
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(PathBuf::from(lock_path))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| EngineError::Locked)?;

        Ok(lock_file)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Take the engine lock.
    ///
    /// An open [`Transaction`] holds the lock, so a call from the thread that
    /// owns it would block forever; that is reported as an error instead.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        if *self.transaction_thread.lock() == Some(thread::current().id()) {
            return Err(EngineError::Transaction(
                "engine is held by an open transaction on this thread".into(),
            ));
        }
        Ok(self.inner.lock())
    }

    pub(crate) fn set_transaction_thread(&self, owner: Option<ThreadId>) {
        *self.transaction_thread.lock() = owner;
    }

    pub(crate) fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Run `f` as one atomic write and broadcast its events after commit.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&mut Session<'_>) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let tx = inner.conn.unchecked_transaction()?;
        let (value, events) = {
            let mut session = Session::new(&tx, &mut inner.sequencer);
            let value = f(&mut session)?;
            (value, session.events)
        };
        inner.sequencer.persist(&tx)?;
        tx.commit()?;
        drop(guard);

        self.subscriptions.broadcast_all(events);
        Ok(value)
    }

    /// Run `f` against the connection without a write transaction.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let inner = self.lock()?;
        f(&inner.conn)
    }

    // --- Queries ---

    /// Run a query; `state` / `state_all` references are rewritten.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let tx = inner.conn.unchecked_transaction()?;
        let result = run_query(&tx, &mut inner.rewriter, sql, params, false)?;
        tx.commit()?;
        Ok(result)
    }

    /// Execute a raw statement and return the number of changed rows.
    ///
    /// Raw writes bypass staging, so every cache scope is marked stale.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.write(|session| {
            trace!(sql, "executing raw statement");
            let changed = session.conn.execute(sql, params_from_iter(params.iter()))?;
            cache::mark_stale(session.conn, None, None)?;
            Ok(changed)
        })
    }

    /// Start an explicit transaction holding the engine lock.
    ///
    /// Until the transaction is committed, rolled back or dropped, other
    /// threads block on the engine and calls from this thread fail with
    /// [`EngineError::Transaction`]; use the transaction's own methods.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self)
    }

    // --- Versions ---

    pub fn create_version(&self, options: CreateVersion) -> Result<Version> {
        self.write(|session| versions::create_version(session, &options))
    }

    /// Point the active version at `id`. No change rows are written.
    pub fn switch_version(&self, id: &VersionId) -> Result<Version> {
        self.write(|session| {
            let version = versions::require_version(session.conn, id)?;
            let from = versions::active_version_id(session.conn).ok();
            versions::set_active_version(session.conn, &version.id)?;
            session.emit(EngineEvent::VersionSwitched {
                from,
                to: version.id.clone(),
            });
            Ok(version)
        })
    }

    pub fn active_version(&self) -> Result<Version> {
        self.read(|conn| {
            let id = versions::active_version_id(conn)?;
            versions::require_version(conn, &id)
        })
    }

    pub fn get_version(&self, id: &VersionId) -> Result<Option<Version>> {
        self.read(|conn| versions::get_version(conn, id))
    }

    pub fn version_by_name(&self, name: &str) -> Result<Option<Version>> {
        self.read(|conn| versions::version_by_name(conn, name))
    }

    pub fn list_versions(&self, include_hidden: bool) -> Result<Vec<Version>> {
        self.read(|conn| versions::list_versions(conn, include_hidden))
    }

    pub fn hide_version(&self, id: &VersionId) -> Result<()> {
        self.write(|session| {
            versions::hide_version(session.conn, id)?;
            session.emit(EngineEvent::VersionHidden {
                version_id: id.clone(),
            });
            Ok(())
        })
    }

    /// Change (or clear) the version `id` inherits from.
    pub fn set_inherits_from(&self, id: &VersionId, parent: Option<&VersionId>) -> Result<()> {
        self.write(|session| {
            versions::set_inherits_from(session.conn, id, parent)?;
            cache::invalidate_version(session.conn, id)
        })
    }

    // --- Writes ---

    /// Stage a change in a version's working commit.
    pub fn stage_change(&self, version_id: &VersionId, input: ChangeInput) -> Result<Change> {
        self.write(|session| versions::stage_change(session, version_id, &input))
    }

    /// Stage a change in the active version.
    pub fn stage(&self, input: ChangeInput) -> Result<Change> {
        self.write(|session| {
            let version_id = versions::active_version_id(session.conn)?;
            versions::stage_change(session, &version_id, &input)
        })
    }

    /// Stage a tombstone for an entity; `None` when it is already absent.
    pub fn delete_entity(&self, version_id: &VersionId, entity_id: &str, schema_key: &str) -> Result<Option<Change>> {
        let max_depth = self.config.max_inheritance_depth;
        self.write(|session| versions::delete_entity(session, version_id, entity_id, schema_key, max_depth))
    }

    /// Stage every change a plugin detects between two file contents.
    pub fn ingest_file(
        &self,
        detector: &dyn ChangeDetector,
        version_id: &VersionId,
        file_id: &str,
        before: Option<&[u8]>,
        after: &[u8],
    ) -> Result<Vec<Change>> {
        let detected = detector.detect_changes(file_id, before, after)?;
        self.write(|session| {
            detected
                .into_iter()
                .map(|change| {
                    let input = change.into_input(file_id, detector.plugin_key());
                    versions::stage_change(session, version_id, &input)
                })
                .collect()
        })
    }

    // --- History ---

    /// Seal staged changes; `None` when nothing is staged.
    pub fn commit(&self, version_id: &VersionId) -> Result<Option<Commit>> {
        self.write(|session| versions::commit_version(session, version_id))
    }

    pub fn create_checkpoint(&self, version_id: &VersionId) -> Result<Commit> {
        self.write(|session| graph::create_checkpoint(session, version_id))
    }

    pub fn create_undo_commit(&self, commit_id: &CommitId) -> Result<Commit> {
        self.write(|session| graph::create_undo_commit(session, commit_id, None))
    }

    pub fn graft_commit(&self, version_id: &VersionId, commit_id: &CommitId) -> Result<Commit> {
        self.write(|session| graph::graft_commit(session, version_id, commit_id))
    }

    /// Undo a commit in a version: build the inverse and graft it as the new head.
    pub fn undo(&self, version_id: &VersionId, commit_id: &CommitId) -> Result<Commit> {
        self.write(|session| {
            let inherited = Some((version_id, self.config.max_inheritance_depth));
            let undo = graph::create_undo_commit(session, commit_id, inherited)?;
            graph::graft_commit(session, version_id, &undo.id)
        })
    }

    pub fn merge_version(&self, target: &VersionId, source: &VersionId) -> Result<()> {
        self.write(|session| graph::merge_version(session, target, source))
    }

    pub fn commit_history(&self, version_id: &VersionId) -> Result<Vec<Commit>> {
        self.read(|conn| graph::commit_history(conn, version_id, false))
    }

    pub fn checkpoints(&self, version_id: &VersionId) -> Result<Vec<Commit>> {
        self.read(|conn| graph::commit_history(conn, version_id, true))
    }

    pub fn get_commit(&self, id: &CommitId) -> Result<Option<Commit>> {
        self.read(|conn| graph::get_commit(conn, id))
    }

    pub fn get_change(&self, id: &ChangeId) -> Result<Option<Change>> {
        self.read(|conn| get_change(conn, id))
    }

    // --- Labels ---

    pub fn list_labels(&self) -> Result<Vec<Label>> {
        self.read(labels::list_labels)
    }

    /// Attach a label (created on first use) to an entity.
    pub fn attach_label(&self, entity_id: &str, schema_key: &str, file_id: &str, label: &str) -> Result<Label> {
        self.write(|session| {
            let label = labels::ensure_label(session, label)?;
            labels::attach_label(session.conn, entity_id, schema_key, file_id, &label.id)?;
            Ok(label)
        })
    }

    pub fn labels_for_entity(&self, entity_id: &str, schema_key: &str, file_id: &str) -> Result<Vec<Label>> {
        self.read(|conn| labels::labels_for_entity(conn, entity_id, schema_key, file_id))
    }

    // --- State ---

    /// Ground-truth resolution by walking the commit graph.
    pub fn resolve(&self, entity_id: &str, schema_key: &str, version_id: &VersionId) -> Result<Resolution> {
        let max_depth = self.config.max_inheritance_depth;
        self.read(|conn| resolver::resolve(conn, entity_id, schema_key, version_id, max_depth))
    }

    /// Every live entity of a schema in a version, read through the cache.
    pub fn state(&self, schema_key: &str, version_id: &VersionId) -> Result<Vec<ResolvedEntity>> {
        self.write(|session| {
            versions::require_version(session.conn, version_id)?;
            cache::populate(session.conn, schema_key, version_id)?;
            cache::cached_entities(session.conn, schema_key, version_id)
        })
    }

    /// Recompute stale or never-populated scopes; returns how many were recomputed.
    pub fn populate(&self, schema_key: Option<&str>, version_id: Option<&VersionId>) -> Result<usize> {
        self.write(|session| cache::populate_matching(session.conn, schema_key, version_id))
    }

    /// Clear cached rows and flag the scope stale. `None` matches everything.
    pub fn mark_stale(&self, schema_key: Option<&str>, version_id: Option<&VersionId>) -> Result<()> {
        self.write(|session| cache::mark_stale(session.conn, schema_key, version_id))
    }

    pub fn is_fresh(&self, schema_key: &str, version_id: &VersionId) -> Result<bool> {
        self.read(|conn| cache::is_fresh(conn, schema_key, version_id))
    }

    /// Populate one scope unless it is already fresh. True when rows were recomputed.
    pub fn ensure_fresh(&self, schema_key: &str, version_id: &VersionId) -> Result<bool> {
        self.write(|session| {
            versions::require_version(session.conn, version_id)?;
            cache::populate(session.conn, schema_key, version_id)
        })
    }

    // --- Integrity ---

    /// Scan the whole store for structural violations.
    pub fn verify_integrity(&self) -> Result<Vec<IntegrityViolation>> {
        let max_depth = self.config.max_inheritance_depth;
        let violations = self.read(|conn| scan_integrity(conn, max_depth))?;
        for violation in &violations {
            warn!(%violation, "integrity violation");
        }
        Ok(violations)
    }

    // --- Events ---

    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.subscriptions.subscribe(config)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id)
    }

    // --- Sync ---

    pub fn set_sync_enabled(&self, enabled: bool) -> Result<()> {
        self.write(|session| sync::set_enabled(session.conn, enabled))?;
        info!(enabled, "sync toggled");
        Ok(())
    }

    pub fn sync_enabled(&self) -> Result<bool> {
        self.read(sync::is_enabled)
    }

    // --- Persistence ---

    /// Serialize the entire engine, caches and sequencer state included.
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        let inner = self.lock()?;
        inner.sequencer.persist(&inner.conn)?;
        persist::export(&inner.conn)
    }

    /// Atomically write a snapshot to `path`.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.export_snapshot()?;
        persist::write_atomic(path, &bytes)?;
        info!(path = %path.display(), bytes = bytes.len(), "saved engine");
        Ok(())
    }

    pub fn stats(&self) -> Result<EngineStats> {
        self.read(|conn| {
            Ok(EngineStats {
                change_count: change_count(conn)?,
                change_set_count: change_set_count(conn)?,
                commit_count: commit_count(conn)?,
                version_count: versions::version_count(conn)?,
                cache_table_count: cache::cache_tables(conn)?.len() as u64,
                cached_row_count: cache::cached_row_count(conn)?,
            })
        })
    }
}

/// Rewrite, populate what the rewrite reads, and execute.
///
/// Runs inside whatever transaction the caller holds.
pub(crate) fn run_query(
    conn: &Connection,
    rewriter: &mut Rewriter,
    sql: &str,
    params: &[Value],
    overlay: bool,
) -> Result<QueryResult> {
    let outcome = rewriter.rewrite(sql, params, &RewriteContext { overlay });
    populate_scopes(conn, outcome.cache_scopes())?;

    let sql = outcome.sql(sql);
    trace!(sql, "executing query");
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut result = QueryResult {
        columns,
        rows: Vec::new(),
    };
    while let Some(row) = rows.next()? {
        let values = (0..result.columns.len())
            .map(|index| row.get::<_, Value>(index))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        result.rows.push(values);
    }
    Ok(result)
}

fn populate_scopes(conn: &Connection, scopes: &[CacheScope]) -> Result<()> {
    for scope in scopes {
        cache::ensure_cache_table(conn, &scope.schema_key)?;
        let version_ids = match &scope.versions {
            VersionFilter::Active => vec![versions::active_version_id(conn)?],
            VersionFilter::Any => versions::list_versions(conn, true)?
                .into_iter()
                .map(|version| version.id)
                .collect(),
            VersionFilter::Only(ids) => {
                let mut existing = Vec::new();
                for id in ids {
                    let id = VersionId::new(id.as_str());
                    if versions::get_version(conn, &id)?.is_some() {
                        existing.push(id);
                    }
                }
                existing
            }
        };
        for version_id in &version_ids {
            cache::populate(conn, &scope.schema_key, version_id)?;
        }
    }
    Ok(())
}

fn scan_integrity(conn: &Connection, max_depth: usize) -> Result<Vec<IntegrityViolation>> {
    let mut violations = Vec::new();

    let mut stmt = conn.prepare(&format!(
        "SELECT e.change_set_id, e.change_id FROM {CHANGE_SET_ELEMENT_TABLE} AS e
         LEFT JOIN {CHANGE_TABLE} AS c ON c.id = e.change_id WHERE c.id IS NULL"
    ))?;
    for row in stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
        let (change_set, change) = row?;
        violations.push(IntegrityViolation::MissingChange { change_set, change });
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT c.id, c.change_set_id FROM {COMMIT_TABLE} AS c
         LEFT JOIN {CHANGE_SET_TABLE} AS s ON s.id = c.change_set_id WHERE s.id IS NULL"
    ))?;
    for row in stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
        let (commit, change_set) = row?;
        violations.push(IntegrityViolation::MissingChangeSet { commit, change_set });
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT e.child_id, e.parent_id FROM {COMMIT_EDGE_TABLE} AS e
         LEFT JOIN {COMMIT_TABLE} AS c ON c.id = e.parent_id WHERE c.id IS NULL"
    ))?;
    for row in stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
        let (commit, parent) = row?;
        violations.push(IntegrityViolation::MissingParent { commit, parent });
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT e.child_id, e.parent_id FROM {COMMIT_EDGE_TABLE} AS e
         JOIN {COMMIT_ANCESTRY_TABLE} AS a ON a.commit_id = e.parent_id AND a.ancestor_id = e.child_id"
    ))?;
    for row in stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
        let (child, parent) = row?;
        violations.push(IntegrityViolation::CyclicParent { child, parent });
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT v.id, p.commit_id FROM {VERSION_TABLE} AS v
         JOIN (SELECT id AS version_id, head_commit_id AS commit_id FROM {VERSION_TABLE}
               UNION ALL
               SELECT id, working_commit_id FROM {VERSION_TABLE}) AS p ON p.version_id = v.id
         LEFT JOIN {COMMIT_TABLE} AS c ON c.id = p.commit_id WHERE c.id IS NULL"
    ))?;
    for row in stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
        let (version, commit) = row?;
        violations.push(IntegrityViolation::DanglingVersionPointer { version, commit });
    }

    for version in versions::list_versions(conn, true)? {
        match versions::lineage(conn, &version.id, max_depth) {
            Ok(_) => {}
            Err(EngineError::Integrity(violation)) => violations.push(violation),
            Err(e) => return Err(e),
        }
    }

    Ok(violations)
}
