//! Schema-partitioned materialized state.
//!
//! Each schema gets its own table (see [`cache_table_name`]) keyed by
//! `(entity_id, version_id)`. The cache is read-through: writes only go to
//! the change store and mark scopes stale; rows are recomputed from the
//! generic state SQL the next time a reader asks for the scope.
//!
//! Staleness is tracked per scope with epochs drawn from one counter:
//!
//! - `mark_stale` records `(schema_key | '*', version_id | '*')` at a new epoch;
//! - `populate` records `(schema_key, version_id)` as populated at a new epoch;
//! - a scope is fresh iff its populated epoch is greater than every matching
//!   stale epoch.
//!
//! An absent populated row is never fresh, so "empty" and "never computed"
//! are distinct.

use crate::changes::RESERVED_SCHEMA_KEY;
use crate::error::Result;
use crate::schema::{
    cache_table_ddl, CACHE_POPULATED_TABLE, CACHE_REGISTRY_TABLE, CACHE_STALE_TABLE,
    CACHE_TABLE_PREFIX, CHANGE_TABLE, KEY_VALUE_TABLE,
};
use crate::state::sql::{
    committed_state_sql, StateSqlFilter, VersionFilter, INHERITANCE_DEPTH_KEY, STATE_COLUMNS,
};
use crate::types::{ResolvedEntity, VersionId};
use crate::versions::{inheritors, list_versions};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use tracing::debug;

const CACHE_EPOCH_KEY: &str = "lix_state_cache_epoch";
const WILDCARD: &str = RESERVED_SCHEMA_KEY;

/// A set of cache rows a rewritten query reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheScope {
    pub schema_key: String,
    pub versions: VersionFilter,
}

/// Physical table name for a schema's cache.
///
/// Keys that are not already lowercase identifiers are sanitized and
/// suffixed with a digest so distinct keys never share a table.
pub fn cache_table_name(schema_key: &str) -> String {
    let sanitized: String = schema_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if !schema_key.is_empty() && sanitized == schema_key {
        return format!("{CACHE_TABLE_PREFIX}{sanitized}");
    }
    let digest = hex::encode(Sha256::digest(schema_key.as_bytes()));
    format!("{CACHE_TABLE_PREFIX}{sanitized}_{}", &digest[..8])
}

pub fn registered_table(conn: &Connection, schema_key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            &format!("SELECT table_name FROM {CACHE_REGISTRY_TABLE} WHERE schema_key = ?1"),
            params![schema_key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Create the schema's cache table if it does not exist yet.
pub fn ensure_cache_table(conn: &Connection, schema_key: &str) -> Result<String> {
    if let Some(table) = registered_table(conn, schema_key)? {
        return Ok(table);
    }
    let table = cache_table_name(schema_key);
    conn.execute_batch(&cache_table_ddl(&table))?;
    conn.execute(
        &format!("INSERT INTO {CACHE_REGISTRY_TABLE} (schema_key, table_name) VALUES (?1, ?2)"),
        params![schema_key, table],
    )?;
    debug!(schema_key, table = %table, "created cache table");
    Ok(table)
}

/// All `(schema_key, table_name)` pairs with a cache table.
pub fn cache_tables(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT schema_key, table_name FROM {CACHE_REGISTRY_TABLE} ORDER BY schema_key"
    ))?;
    let tables = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tables)
}

fn next_epoch(conn: &Connection) -> Result<i64> {
    let current: Option<String> = conn
        .query_row(
            &format!("SELECT value FROM {KEY_VALUE_TABLE} WHERE key = ?1"),
            params![CACHE_EPOCH_KEY],
            |row| row.get(0),
        )
        .optional()?;
    let next = current.and_then(|value| value.parse::<i64>().ok()).unwrap_or(0) + 1;
    conn.execute(
        &format!(
            "INSERT INTO {KEY_VALUE_TABLE} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        ),
        params![CACHE_EPOCH_KEY, next.to_string()],
    )?;
    Ok(next)
}

/// Clear cached rows matching the filter and flag the scope stale.
///
/// `None` for either component matches everything.
pub fn mark_stale(conn: &Connection, schema_key: Option<&str>, version_id: Option<&VersionId>) -> Result<()> {
    let epoch = next_epoch(conn)?;
    conn.execute(
        &format!(
            "INSERT INTO {CACHE_STALE_TABLE} (schema_key, version_id, epoch) VALUES (?1, ?2, ?3)
             ON CONFLICT(schema_key, version_id) DO UPDATE SET epoch = excluded.epoch"
        ),
        params![
            schema_key.unwrap_or(WILDCARD),
            version_id.map(VersionId::as_str).unwrap_or(WILDCARD),
            epoch
        ],
    )?;

    let tables = match schema_key {
        Some(schema_key) => registered_table(conn, schema_key)?.into_iter().collect(),
        None => cache_tables(conn)?.into_iter().map(|(_, table)| table).collect::<Vec<_>>(),
    };
    for table in tables {
        match version_id {
            Some(version_id) => conn.execute(
                &format!("DELETE FROM {table} WHERE version_id = ?1"),
                params![version_id],
            )?,
            None => conn.execute(&format!("DELETE FROM {table}"), [])?,
        };
    }
    debug!(
        schema_key = schema_key.unwrap_or(WILDCARD),
        version_id = version_id.map(VersionId::as_str).unwrap_or(WILDCARD),
        epoch,
        "marked cache stale"
    );
    Ok(())
}

/// Record the inheritance depth the state SQL walks.
///
/// Cached rows computed under a different depth are dropped. Returns true
/// when the stored depth changed.
pub fn configure_inheritance_depth(conn: &Connection, max_depth: usize) -> Result<bool> {
    let depth = i64::try_from(max_depth).unwrap_or(i64::MAX);
    let current: Option<i64> = conn
        .query_row(
            &format!("SELECT CAST(value AS INTEGER) FROM {KEY_VALUE_TABLE} WHERE key = ?1"),
            params![INHERITANCE_DEPTH_KEY],
            |row| row.get(0),
        )
        .optional()?;
    if current == Some(depth) {
        return Ok(false);
    }
    conn.execute(
        &format!(
            "INSERT INTO {KEY_VALUE_TABLE} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        ),
        params![INHERITANCE_DEPTH_KEY, depth.to_string()],
    )?;
    if current.is_some() {
        mark_stale(conn, None, None)?;
    }
    debug!(max_depth = depth, previous = ?current, "configured inheritance depth");
    Ok(true)
}

/// Mark `(schema_key, version_id)` and every inheriting version stale.
pub fn invalidate(conn: &Connection, schema_key: &str, version_id: &VersionId) -> Result<()> {
    mark_stale(conn, Some(schema_key), Some(version_id))?;
    for inheritor in inheritors(conn, version_id)? {
        mark_stale(conn, Some(schema_key), Some(&inheritor))?;
    }
    Ok(())
}

/// Mark every schema of `version_id` and its inheritors stale.
pub fn invalidate_version(conn: &Connection, version_id: &VersionId) -> Result<()> {
    mark_stale(conn, None, Some(version_id))?;
    for inheritor in inheritors(conn, version_id)? {
        mark_stale(conn, None, Some(&inheritor))?;
    }
    Ok(())
}

pub fn is_fresh(conn: &Connection, schema_key: &str, version_id: &VersionId) -> Result<bool> {
    let populated: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT epoch FROM {CACHE_POPULATED_TABLE} WHERE schema_key = ?1 AND version_id = ?2"
            ),
            params![schema_key, version_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(populated) = populated else {
        return Ok(false);
    };
    let stale: Option<i64> = conn.query_row(
        &format!(
            "SELECT MAX(epoch) FROM {CACHE_STALE_TABLE}
             WHERE schema_key IN (?1, '{WILDCARD}') AND version_id IN (?2, '{WILDCARD}')"
        ),
        params![schema_key, version_id],
        |row| row.get(0),
    )?;
    Ok(populated > stale.unwrap_or(0))
}

/// Recompute one scope if it is stale or was never populated.
///
/// Returns true when rows were recomputed. Only rows of this scope are
/// replaced.
pub fn populate(conn: &Connection, schema_key: &str, version_id: &VersionId) -> Result<bool> {
    let table = ensure_cache_table(conn, schema_key)?;
    if is_fresh(conn, schema_key, version_id)? {
        return Ok(false);
    }

    conn.execute(
        &format!("DELETE FROM {table} WHERE version_id = ?1"),
        params![version_id],
    )?;
    let filter = StateSqlFilter::schema(schema_key)
        .with_version(VersionFilter::Only(vec![version_id.to_string()]));
    let columns = STATE_COLUMNS.join(", ");
    let inserted = conn.execute(
        &format!(
            "INSERT INTO {table} ({columns}) SELECT {columns} FROM ({})",
            committed_state_sql(&filter, STATE_COLUMNS)
        ),
        [],
    )?;

    let epoch = next_epoch(conn)?;
    conn.execute(
        &format!(
            "INSERT INTO {CACHE_POPULATED_TABLE} (schema_key, version_id, epoch) VALUES (?1, ?2, ?3)
             ON CONFLICT(schema_key, version_id) DO UPDATE SET epoch = excluded.epoch"
        ),
        params![schema_key, version_id, epoch],
    )?;
    debug!(schema_key, version_id = %version_id, rows = inserted, epoch, "populated cache scope");
    Ok(true)
}

/// Populate every scope matching the filter; returns how many were recomputed.
pub fn populate_matching(
    conn: &Connection,
    schema_key: Option<&str>,
    version_id: Option<&VersionId>,
) -> Result<usize> {
    let schema_keys = match schema_key {
        Some(schema_key) => vec![schema_key.to_string()],
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT schema_key FROM {CHANGE_TABLE} ORDER BY schema_key"
            ))?;
            let keys = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            keys
        }
    };
    let version_ids = match version_id {
        Some(version_id) => vec![version_id.clone()],
        None => list_versions(conn, true)?
            .into_iter()
            .map(|version| version.id)
            .collect(),
    };

    let mut populated = 0;
    for schema_key in &schema_keys {
        for version_id in &version_ids {
            if populate(conn, schema_key, version_id)? {
                populated += 1;
            }
        }
    }
    Ok(populated)
}

/// Remove one entity's cached rows in a version and its inheritors.
pub fn purge_entity(
    conn: &Connection,
    entity_id: &str,
    schema_key: &str,
    version_id: &VersionId,
) -> Result<()> {
    let Some(table) = registered_table(conn, schema_key)? else {
        return Ok(());
    };
    let mut versions = vec![version_id.clone()];
    versions.extend(inheritors(conn, version_id)?);
    for version in versions {
        conn.execute(
            &format!("DELETE FROM {table} WHERE entity_id = ?1 AND version_id = ?2"),
            params![entity_id, version],
        )?;
    }
    Ok(())
}

/// Map a row selected with [`STATE_COLUMNS`].
pub fn resolved_entity_from_row(row: &Row<'_>) -> rusqlite::Result<ResolvedEntity> {
    let json = |index: usize, raw: String| {
        serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
        })
    };
    Ok(ResolvedEntity {
        entity_id: row.get(0)?,
        schema_key: row.get(1)?,
        file_id: row.get(2)?,
        plugin_key: row.get(3)?,
        schema_version: row.get(4)?,
        snapshot_content: json(5, row.get(5)?)?,
        metadata: row
            .get::<_, Option<String>>(6)?
            .map(|raw| json(6, raw))
            .transpose()?,
        version_id: row.get(7)?,
        change_id: row.get(8)?,
        commit_id: row.get(9)?,
        inherited_from_version_id: row.get(10)?,
        created_at: row.get(11)?,
    })
}

/// Rows cached for one scope, ordered by entity id. Does not populate.
pub fn cached_entities(
    conn: &Connection,
    schema_key: &str,
    version_id: &VersionId,
) -> Result<Vec<ResolvedEntity>> {
    let Some(table) = registered_table(conn, schema_key)? else {
        return Ok(Vec::new());
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {table} WHERE version_id = ?1 ORDER BY entity_id",
        STATE_COLUMNS.join(", ")
    ))?;
    let rows = stmt
        .query_map(params![version_id], resolved_entity_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn cached_row_count(conn: &Connection) -> Result<u64> {
    let mut total = 0u64;
    for (_, table) in cache_tables(conn)? {
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        total += count as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        assert_eq!(cache_table_name("todo"), "lix_internal_state_cache_v1_todo");

        let dotted = cache_table_name("app.todo");
        assert!(dotted.starts_with("lix_internal_state_cache_v1_app_todo_"));
        assert_ne!(dotted, cache_table_name("app_todo"));
        assert_ne!(cache_table_name("Todo"), cache_table_name("todo"));
    }
}
