//! Relational layout of the engine.
//!
//! Every durable piece of engine state lives in tables prefixed with
//! `lix_internal_`. The virtual `state` / `state_all` relations are views over
//! them so statements the rewriter leaves untouched keep their meaning.

use crate::error::Result;
use crate::state::sql::{generic_state_sql, StateSqlFilter, STATE_COLUMNS};
use rusqlite::Connection;

pub const KEY_VALUE_TABLE: &str = "lix_internal_key_value";
pub const CHANGE_TABLE: &str = "lix_internal_change";
pub const CHANGE_SET_TABLE: &str = "lix_internal_change_set";
pub const CHANGE_SET_ELEMENT_TABLE: &str = "lix_internal_change_set_element";
pub const COMMIT_TABLE: &str = "lix_internal_commit";
pub const COMMIT_EDGE_TABLE: &str = "lix_internal_commit_edge";
pub const COMMIT_ANCESTRY_TABLE: &str = "lix_internal_commit_ancestry";
pub const VERSION_TABLE: &str = "lix_internal_version";
pub const ACTIVE_VERSION_TABLE: &str = "lix_internal_active_version";
pub const LABEL_TABLE: &str = "lix_internal_label";
pub const ENTITY_LABEL_TABLE: &str = "lix_internal_entity_label";
pub const TRANSACTION_STATE_TABLE: &str = "lix_internal_transaction_state";
pub const CACHE_REGISTRY_TABLE: &str = "lix_internal_state_cache_registry";
pub const CACHE_STALE_TABLE: &str = "lix_internal_state_cache_stale";
pub const CACHE_POPULATED_TABLE: &str = "lix_internal_state_cache_populated";

/// Name of the all-versions virtual relation.
pub const STATE_ALL_VIEW: &str = "state_all";

/// Name of the active-version virtual relation.
pub const STATE_VIEW: &str = "state";

/// Prefix of the per-schema cache tables.
pub const CACHE_TABLE_PREFIX: &str = "lix_internal_state_cache_v1_";

/// Fixed tables in dependency order (used by export/import).
pub const INTERNAL_TABLES: &[&str] = &[
    KEY_VALUE_TABLE,
    CHANGE_TABLE,
    CHANGE_SET_TABLE,
    CHANGE_SET_ELEMENT_TABLE,
    COMMIT_TABLE,
    COMMIT_EDGE_TABLE,
    COMMIT_ANCESTRY_TABLE,
    VERSION_TABLE,
    ACTIVE_VERSION_TABLE,
    LABEL_TABLE,
    ENTITY_LABEL_TABLE,
    CACHE_REGISTRY_TABLE,
    CACHE_STALE_TABLE,
    CACHE_POPULATED_TABLE,
];

const TABLES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS lix_internal_key_value (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lix_internal_change (
  id TEXT PRIMARY KEY,
  entity_id TEXT NOT NULL,
  schema_key TEXT NOT NULL,
  schema_version TEXT NOT NULL,
  file_id TEXT NOT NULL,
  plugin_key TEXT NOT NULL,
  snapshot_content TEXT,
  metadata TEXT,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_entity
  ON lix_internal_change(entity_id, schema_key);

CREATE TABLE IF NOT EXISTS lix_internal_change_set (
  id TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS lix_internal_change_set_element (
  change_set_id TEXT NOT NULL,
  change_id TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  schema_key TEXT NOT NULL,
  file_id TEXT NOT NULL,
  PRIMARY KEY (change_set_id, entity_id, schema_key)
);

CREATE INDEX IF NOT EXISTS idx_change_set_element_change
  ON lix_internal_change_set_element(change_id);

CREATE TABLE IF NOT EXISTS lix_internal_commit (
  id TEXT PRIMARY KEY,
  change_set_id TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  seq INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS lix_internal_commit_edge (
  child_id TEXT NOT NULL,
  parent_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  PRIMARY KEY (child_id, parent_id)
);

CREATE INDEX IF NOT EXISTS idx_commit_edge_parent
  ON lix_internal_commit_edge(parent_id);

CREATE TABLE IF NOT EXISTS lix_internal_commit_ancestry (
  commit_id TEXT NOT NULL,
  ancestor_id TEXT NOT NULL,
  ancestor_depth INTEGER NOT NULL,
  discovery_order INTEGER NOT NULL,
  PRIMARY KEY (commit_id, ancestor_id)
);

CREATE TABLE IF NOT EXISTS lix_internal_version (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  head_commit_id TEXT NOT NULL,
  working_commit_id TEXT NOT NULL,
  inherits_from_version_id TEXT,
  hidden INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS lix_internal_active_version (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  version_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lix_internal_label (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS lix_internal_entity_label (
  entity_id TEXT NOT NULL,
  schema_key TEXT NOT NULL,
  file_id TEXT NOT NULL,
  label_id TEXT NOT NULL,
  PRIMARY KEY (entity_id, schema_key, file_id, label_id)
);

CREATE TABLE IF NOT EXISTS lix_internal_transaction_state (
  entity_id TEXT NOT NULL,
  schema_key TEXT NOT NULL,
  file_id TEXT NOT NULL,
  plugin_key TEXT NOT NULL,
  schema_version TEXT NOT NULL,
  snapshot_content TEXT,
  metadata TEXT,
  version_id TEXT NOT NULL,
  change_id TEXT NOT NULL,
  commit_id TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  PRIMARY KEY (entity_id, schema_key, version_id)
);

CREATE TABLE IF NOT EXISTS lix_internal_state_cache_registry (
  schema_key TEXT PRIMARY KEY,
  table_name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS lix_internal_state_cache_stale (
  schema_key TEXT NOT NULL,
  version_id TEXT NOT NULL,
  epoch INTEGER NOT NULL,
  PRIMARY KEY (schema_key, version_id)
);

CREATE TABLE IF NOT EXISTS lix_internal_state_cache_populated (
  schema_key TEXT NOT NULL,
  version_id TEXT NOT NULL,
  epoch INTEGER NOT NULL,
  PRIMARY KEY (schema_key, version_id)
);
"#;

/// Create all fixed tables and the virtual relation views.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(TABLES_DDL)?;
    create_views(conn)?;
    Ok(())
}

/// (Re)create the `state_all` and `state` views.
fn create_views(conn: &Connection) -> Result<()> {
    let state_all = generic_state_sql(&StateSqlFilter::default(), true);
    let columns = STATE_COLUMNS.join(", ");
    conn.execute_batch(&format!(
        "DROP VIEW IF EXISTS {STATE_VIEW};
         DROP VIEW IF EXISTS {STATE_ALL_VIEW};
         CREATE VIEW {STATE_ALL_VIEW} AS {state_all};
         CREATE VIEW {STATE_VIEW} AS SELECT {columns} FROM {STATE_ALL_VIEW}
           WHERE version_id = (SELECT version_id FROM {ACTIVE_VERSION_TABLE} WHERE id = 1);"
    ))?;
    Ok(())
}

/// DDL for one per-schema cache table.
pub fn cache_table_ddl(table_name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table_name} (
           entity_id TEXT NOT NULL,
           schema_key TEXT NOT NULL,
           file_id TEXT NOT NULL,
           plugin_key TEXT NOT NULL,
           schema_version TEXT NOT NULL,
           snapshot_content TEXT NOT NULL,
           metadata TEXT,
           version_id TEXT NOT NULL,
           change_id TEXT NOT NULL,
           commit_id TEXT NOT NULL,
           inherited_from_version_id TEXT,
           created_at INTEGER NOT NULL,
           PRIMARY KEY (entity_id, version_id)
         );
         CREATE INDEX IF NOT EXISTS idx_{table_name}_version ON {table_name}(version_id);"
    )
}

/// Quote a string as a SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'view' AND name IN ('state', 'state_all')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
