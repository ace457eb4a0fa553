//! # Lix State
//!
//! A change-tracked entity store with branchable versions, a read-through
//! state cache and SQL query rewriting.
//!
//! ## Core Concepts
//!
//! - **Changes**: Immutable rows recording one mutation of one entity
//! - **Commits**: A DAG of change sets; a version points at a head and a working commit
//! - **Versions**: Cheap branches that may inherit state from another version
//! - **State**: `state` / `state_all` relations resolved from the graph and cached per schema
//! - **Rewriter**: Queries against `state` are redirected to the cache tables
//!
//! ## Example
//!
//! ```ignore
//! use lix_state::{ChangeInput, CreateVersion, Engine, EngineConfig, Value};
//! use serde_json::json;
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! let main = engine.active_version()?;
//!
//! // Stage a change and read it back through the virtual relation
//! engine.stage(ChangeInput::new("todo-1", "todo", json!({ "title": "write docs" })))?;
//! let rows = engine.query(
//!     "SELECT entity_id, snapshot_content FROM state WHERE schema_key = ?",
//!     &[Value::from("todo")],
//! )?;
//!
//! // Seal the staged change as a checkpoint, then branch off it
//! engine.create_checkpoint(&main.id)?;
//! engine.create_version(CreateVersion::named("draft").from_version(main.id.clone()))?;
//! ```

mod changes;
pub mod engine;
pub mod error;
mod graph;
mod labels;
mod persist;
pub mod plugin;
pub mod rewrite;
pub mod schema;
pub mod sequence;
mod session;
pub mod state;
pub mod subscriptions;
pub mod sync;
pub mod transaction;
pub mod types;
mod versions;

// Re-exports
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, IntegrityViolation, Result};
pub use labels::CHECKPOINT_LABEL;
pub use plugin::{ChangeDetector, DetectedChange, JsonPropertyDetector, JSON_PROPERTY_SCHEMA_KEY};
pub use rewrite::{Classification, RewriteContext, RewriteOutcome, Rewriter};
pub use sequence::DeterministicConfig;
pub use state::{CacheScope, VersionFilter};
pub use subscriptions::{
    ChangeSummary, DropReason, EngineEvent, SubscriptionConfig, SubscriptionFilter,
    SubscriptionHandle, SubscriptionId, VersionSummary,
};
pub use sync::{
    pull_once, push_once, sync_once, MemoryHub, MemoryTransport, SyncBundle, SyncConfig,
    SyncReport, SyncTransport, SyncWorker,
};
pub use transaction::Transaction;
pub use types::*;
pub use versions::MAIN_VERSION_NAME;
