//! Core types for the state engine.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Schema key used when commits are tagged through entity labels.
pub const COMMIT_SCHEMA_KEY: &str = "lix_commit";

/// File id for engine-owned entities.
pub const ENGINE_FILE_ID: &str = "lix";

/// Plugin key for entities written directly through the engine API.
pub const ENGINE_PLUGIN_KEY: &str = "lix_own_entity";

/// Schema version assumed when the caller does not name one.
pub const DEFAULT_SCHEMA_VERSION: &str = "1.0";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                $name(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                $name(id)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                String::column_result(value).map($name)
            }
        }
    };
}

string_id!(
    /// Identifier of an immutable change.
    ChangeId
);
string_id!(
    /// Identifier of a change set.
    ChangeSetId
);
string_id!(
    /// Identifier of a commit.
    CommitId
);
string_id!(
    /// Identifier of a version (branch).
    VersionId
);
string_id!(
    /// Identifier of a label.
    LabelId
);

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Timestamp)
    }
}

/// One immutable recorded mutation of one entity under one schema.
///
/// A `None` snapshot is a tombstone: the entity does not exist as of the
/// commit that contains this change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot_content: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Timestamp,
}

impl Change {
    pub fn is_tombstone(&self) -> bool {
        self.snapshot_content.is_none()
    }
}

/// Input for a new change (before id and timestamp are assigned).
///
/// This is the ingestion shape plugins hand to the engine; the snapshot is
/// opaque structured data keyed by schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeInput {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot_content: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl ChangeInput {
    /// An upsert of `entity_id` under `schema_key`.
    pub fn new(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        snapshot_content: serde_json::Value,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            file_id: ENGINE_FILE_ID.to_string(),
            plugin_key: ENGINE_PLUGIN_KEY.to_string(),
            snapshot_content: Some(snapshot_content),
            metadata: None,
        }
    }

    /// A deletion of `entity_id` under `schema_key`.
    pub fn tombstone(entity_id: impl Into<String>, schema_key: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            file_id: ENGINE_FILE_ID.to_string(),
            plugin_key: ENGINE_PLUGIN_KEY.to_string(),
            snapshot_content: None,
            metadata: None,
        }
    }

    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = file_id.into();
        self
    }

    pub fn with_plugin_key(mut self, plugin_key: impl Into<String>) -> Self {
        self.plugin_key = plugin_key.into();
        self
    }

    pub fn with_schema_version(mut self, schema_version: impl Into<String>) -> Self {
        self.schema_version = schema_version.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Membership of one change in one change set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetElement {
    pub change_set_id: ChangeSetId,
    pub change_id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
}

/// An immutable group of changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: ChangeSetId,
    pub elements: Vec<ChangeSetElement>,
}

/// A node in the history DAG.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub change_set_id: ChangeSetId,
    /// Parents in recorded order; the first parent wins ties.
    pub parent_commit_ids: Vec<CommitId>,
    pub change_ids: Vec<ChangeId>,
    pub created_at: Timestamp,
}

/// A named branch: a pair of pointers into the commit DAG.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub name: String,
    pub head_commit_id: CommitId,
    pub working_commit_id: CommitId,
    pub inherits_from_version_id: Option<VersionId>,
    pub hidden: bool,
}

/// Options for creating a version.
#[derive(Clone, Debug, Default)]
pub struct CreateVersion {
    /// Unique name. Generated from the id when absent.
    pub name: Option<String>,
    /// Fork the history of this version (shares its head commit).
    pub from: Option<VersionId>,
    /// Fall back to this version's state for entities without local history.
    pub inherits_from: Option<VersionId>,
    pub hidden: bool,
}

impl CreateVersion {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn from_version(mut self, from: VersionId) -> Self {
        self.from = Some(from);
        self
    }

    pub fn inheriting(mut self, parent: VersionId) -> Self {
        self.inherits_from = Some(parent);
        self
    }
}

/// A named label that can be attached to entities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
}

/// The value of an entity in a version, with provenance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot_content: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub version_id: VersionId,
    pub change_id: ChangeId,
    pub commit_id: CommitId,
    /// Set when the value came from an inherited version.
    pub inherited_from_version_id: Option<VersionId>,
    pub created_at: Timestamp,
}

/// Outcome of resolving an entity against the commit graph.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    Snapshot(ResolvedEntity),
    /// The nearest change is a deletion.
    Tombstone {
        change_id: ChangeId,
        commit_id: CommitId,
    },
    NotFound,
}

impl Resolution {
    /// The live entity, if any.
    pub fn entity(&self) -> Option<&ResolvedEntity> {
        match self {
            Resolution::Snapshot(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn into_entity(self) -> Option<ResolvedEntity> {
        match self {
            Resolution::Snapshot(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        !matches!(self, Resolution::Snapshot(_))
    }
}

/// A SQL value crossing the query surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(value) => ToSqlOutput::from(*value),
            Value::Real(value) => ToSqlOutput::from(*value),
            Value::Text(text) => ToSqlOutput::from(text.as_str()),
            Value::Blob(bytes) => ToSqlOutput::from(bytes.as_slice()),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(value) => Value::Integer(value),
            ValueRef::Real(value) => Value::Real(value),
            ValueRef::Text(bytes) => Value::Text(
                std::str::from_utf8(bytes)
                    .map_err(|e| FromSqlError::Other(Box::new(e)))?
                    .to_string(),
            ),
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        })
    }
}

/// Rows returned by a query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Value at `row` for the named column.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, column: &str) -> Vec<Value> {
        match self.column_index(column) {
            Some(index) => self
                .rows
                .iter()
                .filter_map(|row| row.get(index).cloned())
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Engine statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub change_count: u64,
    pub change_set_count: u64,
    pub commit_count: u64,
    pub version_count: u64,
    pub cache_table_count: u64,
    pub cached_row_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_input_defaults() {
        let input = ChangeInput::new("e1", "s", json!({"value": "a"}));
        assert_eq!(input.file_id, ENGINE_FILE_ID);
        assert_eq!(input.plugin_key, ENGINE_PLUGIN_KEY);
        assert_eq!(input.schema_version, DEFAULT_SCHEMA_VERSION);
        assert!(input.snapshot_content.is_some());

        let tombstone = ChangeInput::tombstone("e1", "s").with_file_id("f1");
        assert!(tombstone.snapshot_content.is_none());
        assert_eq!(tombstone.file_id, "f1");
    }

    #[test]
    fn test_id_display() {
        let id = CommitId::new("abc");
        assert_eq!(id.to_string(), "abc");
        assert_eq!(format!("{:?}", id), "CommitId(abc)");
    }

    #[test]
    fn test_resolution_helpers() {
        assert!(Resolution::NotFound.is_absent());
        let tombstone = Resolution::Tombstone {
            change_id: ChangeId::new("c"),
            commit_id: CommitId::new("k"),
        };
        assert!(tombstone.is_absent());
        assert!(tombstone.entity().is_none());
    }

    #[test]
    fn test_query_result_lookup() {
        let result = QueryResult {
            columns: vec!["entity_id".into(), "value".into()],
            rows: vec![vec![Value::from("e1"), Value::Integer(3)]],
        };
        assert_eq!(result.get(0, "value"), Some(&Value::Integer(3)));
        assert_eq!(result.get(0, "missing"), None);
        assert_eq!(result.column_values("entity_id"), vec![Value::from("e1")]);
    }
}
