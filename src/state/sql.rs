//! SQL renditions of state resolution.
//!
//! `committed_state_sql` is the relational twin of [`super::resolver`]: for
//! every target version it walks the version lineage (recursive CTE over
//! `inherits_from_version_id`) and the commit ancestry of each lineage
//! member's working commit, ranks candidate changes by
//! `(lineage_depth, discovery_order)` and keeps the first one per entity.
//! Tombstones win the ranking and are filtered afterwards, so a local delete
//! hides an inherited value.

use crate::schema::{
    quote_literal, ACTIVE_VERSION_TABLE, CHANGE_SET_ELEMENT_TABLE, CHANGE_TABLE,
    COMMIT_ANCESTRY_TABLE, COMMIT_TABLE, KEY_VALUE_TABLE, TRANSACTION_STATE_TABLE, VERSION_TABLE,
};

/// Columns of the virtual `state` / `state_all` relations, in order.
pub const STATE_COLUMNS: &[&str] = &[
    "entity_id",
    "schema_key",
    "file_id",
    "plugin_key",
    "schema_version",
    "snapshot_content",
    "metadata",
    "version_id",
    "change_id",
    "commit_id",
    "inherited_from_version_id",
    "created_at",
];

/// Columns every pruned projection keeps.
pub const MANDATORY_COLUMNS: &[&str] = &["entity_id", "schema_key", "snapshot_content", "version_id"];

/// Default upper bound on inheritance hops.
pub const MAX_INHERITANCE_DEPTH: i64 = 64;

/// Key-value row holding the engine's configured inheritance depth.
///
/// The SQL walk reads it at execution time, so the persisted views, the
/// cache and rewritten queries all follow the same limit as the resolver.
pub const INHERITANCE_DEPTH_KEY: &str = "lix_max_inheritance_depth";

fn inheritance_depth_subquery() -> String {
    format!(
        "COALESCE((SELECT CAST(value AS INTEGER) FROM {KEY_VALUE_TABLE} \
         WHERE key = '{INHERITANCE_DEPTH_KEY}'), {MAX_INHERITANCE_DEPTH})"
    )
}

/// Which versions a state query covers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum VersionFilter {
    #[default]
    Any,
    /// The version named by the active-version pointer.
    Active,
    Only(Vec<String>),
}

/// Pushdown applied while building state SQL.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateSqlFilter {
    pub schema_keys: Option<Vec<String>>,
    pub version: VersionFilter,
}

impl StateSqlFilter {
    pub fn schema(schema_key: &str) -> Self {
        Self {
            schema_keys: Some(vec![schema_key.to_string()]),
            version: VersionFilter::Any,
        }
    }

    pub fn with_version(mut self, version: VersionFilter) -> Self {
        self.version = version;
        self
    }
}

fn literal_list(values: &[String]) -> String {
    values
        .iter()
        .map(|value| quote_literal(value))
        .collect::<Vec<_>>()
        .join(", ")
}

fn active_version_subquery() -> String {
    format!("(SELECT version_id FROM {ACTIVE_VERSION_TABLE} WHERE id = 1)")
}

/// Predicate restricting `column` to the filter's versions, if any.
pub fn version_predicate(column: &str, version: &VersionFilter) -> Option<String> {
    match version {
        VersionFilter::Any => None,
        VersionFilter::Active => Some(format!("{column} = {}", active_version_subquery())),
        VersionFilter::Only(ids) if ids.is_empty() => Some("1 = 0".to_string()),
        VersionFilter::Only(ids) => Some(format!("{column} IN ({})", literal_list(ids))),
    }
}

fn schema_predicate(column: &str, schema_keys: &Option<Vec<String>>) -> Option<String> {
    match schema_keys {
        None => None,
        Some(keys) if keys.is_empty() => Some("1 = 0".to_string()),
        Some(keys) => Some(format!("{column} IN ({})", literal_list(keys))),
    }
}

fn where_clause(predicates: Vec<Option<String>>) -> String {
    let predicates: Vec<String> = predicates.into_iter().flatten().collect();
    if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    }
}

/// Resolved, committed state for the filter, projecting `columns`.
pub fn committed_state_sql(filter: &StateSqlFilter, columns: &[&str]) -> String {
    let anchor_where = where_clause(vec![version_predicate("id", &filter.version)]);
    let schema_where = where_clause(vec![schema_predicate("e.schema_key", &filter.schema_keys)]);
    let projection = columns.join(", ");
    let max_depth = inheritance_depth_subquery();
    format!(
        "WITH RECURSIVE version_lineage(target_version_id, source_version_id, lineage_depth) AS (\
           SELECT id, id, 0 FROM {VERSION_TABLE}{anchor_where} \
           UNION ALL \
           SELECT l.target_version_id, v.inherits_from_version_id, l.lineage_depth + 1 \
           FROM version_lineage AS l JOIN {VERSION_TABLE} AS v ON v.id = l.source_version_id \
           WHERE v.inherits_from_version_id IS NOT NULL AND l.lineage_depth < {max_depth}\
         ), \
         ranked_changes AS (\
           SELECT l.target_version_id AS version_id, ch.id AS change_id, ch.entity_id AS entity_id, \
             ch.schema_key AS schema_key, ch.file_id AS file_id, ch.plugin_key AS plugin_key, \
             ch.schema_version AS schema_version, ch.snapshot_content AS snapshot_content, \
             ch.metadata AS metadata, ch.created_at AS created_at, a.ancestor_id AS commit_id, \
             CASE WHEN l.lineage_depth = 0 THEN NULL ELSE l.source_version_id END AS inherited_from_version_id, \
             ROW_NUMBER() OVER (PARTITION BY l.target_version_id, ch.entity_id, ch.schema_key \
               ORDER BY l.lineage_depth, a.discovery_order) AS rank_in_version \
           FROM version_lineage AS l \
           JOIN {VERSION_TABLE} AS src ON src.id = l.source_version_id \
           JOIN {COMMIT_ANCESTRY_TABLE} AS a ON a.commit_id = src.working_commit_id \
           JOIN {COMMIT_TABLE} AS c ON c.id = a.ancestor_id \
           JOIN {CHANGE_SET_ELEMENT_TABLE} AS e ON e.change_set_id = c.change_set_id \
           JOIN {CHANGE_TABLE} AS ch ON ch.id = e.change_id{schema_where}\
         ) \
         SELECT {projection} FROM ranked_changes \
         WHERE rank_in_version = 1 AND snapshot_content IS NOT NULL"
    )
}

/// Read of one schema's cache table, projecting `columns`.
pub fn cache_read_sql(table_name: &str, version: &VersionFilter, columns: &[&str]) -> String {
    let projection = columns.join(", ");
    let filter = where_clause(vec![version_predicate("version_id", version)]);
    format!("SELECT {projection} FROM {table_name}{filter}")
}

/// Union transaction-local pending rows over `base`.
///
/// Pending rows shadow base rows with the same `(entity_id, schema_key,
/// version_id)`; pending tombstones hide the base row and produce nothing.
pub fn overlay_sql(base: &str, filter: &StateSqlFilter, columns: &[&str]) -> String {
    let base_projection = columns
        .iter()
        .map(|column| format!("committed_state.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    let pending_projection = columns
        .iter()
        .map(|column| match *column {
            "inherited_from_version_id" => "NULL AS inherited_from_version_id".to_string(),
            other => format!("pending.{other}"),
        })
        .collect::<Vec<_>>()
        .join(", ");
    let pending_where = where_clause(vec![
        Some("pending.snapshot_content IS NOT NULL".to_string()),
        schema_predicate("pending.schema_key", &filter.schema_keys),
        version_predicate("pending.version_id", &filter.version),
    ]);
    format!(
        "SELECT {base_projection} FROM ({base}) AS committed_state \
         WHERE NOT EXISTS (SELECT 1 FROM {TRANSACTION_STATE_TABLE} AS shadow \
           WHERE shadow.entity_id = committed_state.entity_id \
           AND shadow.schema_key = committed_state.schema_key \
           AND shadow.version_id = committed_state.version_id) \
         UNION ALL \
         SELECT {pending_projection} FROM {TRANSACTION_STATE_TABLE} AS pending{pending_where}"
    )
}

/// The full generic state query over every column.
pub fn generic_state_sql(filter: &StateSqlFilter, include_overlay: bool) -> String {
    let committed = committed_state_sql(filter, STATE_COLUMNS);
    if include_overlay {
        overlay_sql(&committed, filter, STATE_COLUMNS)
    } else {
        committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_predicate_shapes() {
        assert_eq!(version_predicate("v", &VersionFilter::Any), None);
        assert_eq!(
            version_predicate("v", &VersionFilter::Only(vec!["a".into(), "b".into()])),
            Some("v IN ('a', 'b')".to_string())
        );
        assert_eq!(
            version_predicate("v", &VersionFilter::Only(vec![])),
            Some("1 = 0".to_string())
        );
        assert!(version_predicate("v", &VersionFilter::Active)
            .unwrap()
            .contains(ACTIVE_VERSION_TABLE));
    }

    #[test]
    fn test_committed_sql_pushes_schema_filter() {
        let sql = committed_state_sql(&StateSqlFilter::schema("todo"), STATE_COLUMNS);
        assert!(sql.contains("e.schema_key IN ('todo')"));
        assert!(sql.starts_with("WITH RECURSIVE"));
        assert!(sql.contains(INHERITANCE_DEPTH_KEY));
    }

    #[test]
    fn test_overlay_nulls_inheritance_for_pending_rows() {
        let sql = overlay_sql("SELECT 1", &StateSqlFilter::default(), STATE_COLUMNS);
        assert!(sql.contains("NULL AS inherited_from_version_id"));
        assert!(sql.contains("UNION ALL"));
    }
}
