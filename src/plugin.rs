//! Change detection for tracked files.
//!
//! A plugin turns two versions of a file into entity-level changes. The
//! engine stays format-agnostic: it stores whatever snapshots the detector
//! reports, keyed by the detector's `plugin_key`.

use crate::error::{EngineError, Result};
use crate::types::{ChangeInput, DEFAULT_SCHEMA_VERSION};
use serde_json::Value as Json;

/// One entity-level difference between two file contents.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedChange {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    /// `None` when the entity disappeared.
    pub snapshot_content: Option<Json>,
}

impl DetectedChange {
    pub fn into_input(self, file_id: &str, plugin_key: &str) -> ChangeInput {
        ChangeInput {
            entity_id: self.entity_id,
            schema_key: self.schema_key,
            schema_version: self.schema_version,
            file_id: file_id.to_string(),
            plugin_key: plugin_key.to_string(),
            snapshot_content: self.snapshot_content,
            metadata: None,
        }
    }
}

/// Capability interface implemented by format plugins.
pub trait ChangeDetector: Send + Sync {
    fn plugin_key(&self) -> &str;

    /// Changes that turn `before` (absent for a new file) into `after`.
    fn detect_changes(&self, file_id: &str, before: Option<&[u8]>, after: &[u8]) -> Result<Vec<DetectedChange>>;
}

/// Schema key used by [`JsonPropertyDetector`].
pub const JSON_PROPERTY_SCHEMA_KEY: &str = "plugin_json_property";

/// Tracks each top-level property of a JSON object document as an entity.
#[derive(Clone, Debug, Default)]
pub struct JsonPropertyDetector;

impl JsonPropertyDetector {
    fn parse(bytes: &[u8]) -> Result<serde_json::Map<String, Json>> {
        if bytes.is_empty() {
            return Ok(serde_json::Map::new());
        }
        match serde_json::from_slice::<Json>(bytes)
            .map_err(|e| EngineError::InvalidFormat(format!("not a JSON document: {e}")))?
        {
            Json::Object(map) => Ok(map),
            _ => Err(EngineError::InvalidFormat(
                "JSON document root must be an object".into(),
            )),
        }
    }
}

impl ChangeDetector for JsonPropertyDetector {
    fn plugin_key(&self) -> &str {
        "plugin_json"
    }

    fn detect_changes(&self, _file_id: &str, before: Option<&[u8]>, after: &[u8]) -> Result<Vec<DetectedChange>> {
        let before = match before {
            Some(bytes) => Self::parse(bytes)?,
            None => serde_json::Map::new(),
        };
        let after = Self::parse(after)?;

        let change = |key: &str, snapshot_content: Option<Json>| DetectedChange {
            entity_id: key.to_string(),
            schema_key: JSON_PROPERTY_SCHEMA_KEY.to_string(),
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            snapshot_content,
        };

        let mut changes = Vec::new();
        for (key, value) in &after {
            if before.get(key) != Some(value) {
                changes.push(change(key, Some(serde_json::json!({ "value": value }))));
            }
        }
        for key in before.keys() {
            if !after.contains_key(key) {
                changes.push(change(key, None));
            }
        }
        Ok(changes)
    }
}
