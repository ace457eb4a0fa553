//! Error types for the state engine.

use crate::types::{ChangeId, ChangeSetId, CommitId, VersionId};
use thiserror::Error;

/// A structural violation of the change/commit/version model.
///
/// Integrity violations abort the enclosing transaction; nothing written
/// inside it becomes visible.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IntegrityViolation {
    #[error("commit {child} cannot take {parent} as parent: {parent} descends from {child}")]
    CyclicParent { child: CommitId, parent: CommitId },

    #[error("version {version} points at missing commit {commit}")]
    DanglingVersionPointer { version: VersionId, commit: CommitId },

    #[error("change set {change_set} references missing change {change}")]
    MissingChange {
        change_set: ChangeSetId,
        change: ChangeId,
    },

    #[error("commit {commit} references missing change set {change_set}")]
    MissingChangeSet {
        commit: CommitId,
        change_set: ChangeSetId,
    },

    #[error("commit {commit} references missing parent {parent}")]
    MissingParent { commit: CommitId, parent: CommitId },

    #[error("version {0} inherits from itself through its ancestors")]
    InheritanceCycle(VersionId),
}

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Version not found: {0}")]
    VersionNotFound(String),

    #[error("Version already exists: {0}")]
    VersionExists(String),

    #[error("Commit not found: {0}")]
    CommitNotFound(CommitId),

    #[error("Change not found: {0}")]
    ChangeNotFound(ChangeId),

    #[error("Change set not found: {0}")]
    ChangeSetNotFound(ChangeSetId),

    #[error("Label not found: {0}")]
    LabelNotFound(String),

    #[error("Integrity violation: {0}")]
    Integrity(#[from] IntegrityViolation),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Rewrite error: {0}")]
    Rewrite(String),

    #[error("Subscription dropped")]
    SubscriptionDropped,

    #[error("Engine file is locked by another process")]
    Locked,
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EngineError::Deserialization(e.to_string())
    }
}

impl EngineError {
    /// True for errors that report a broken history rather than bad input.
    pub fn is_integrity(&self) -> bool {
        matches!(self, EngineError::Integrity(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
