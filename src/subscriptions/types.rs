//! Subscription types for engine events.

use crate::types::{Change, ChangeId, CommitId, Version, VersionId};
use serde::{Deserialize, Serialize};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::all(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Only events about these versions (None = all versions).
    pub versions: Option<Vec<VersionId>>,

    /// Only change events for these schemas (None = all schemas).
    pub schema_keys: Option<Vec<String>>,

    /// Include staged change events.
    pub include_changes: bool,

    /// Include commit and checkpoint events.
    pub include_commits: bool,

    /// Include version lifecycle events.
    pub include_versions: bool,
}

impl SubscriptionFilter {
    /// Staged changes for specific schemas.
    pub fn schemas(schema_keys: Vec<String>) -> Self {
        Self {
            schema_keys: Some(schema_keys),
            include_changes: true,
            ..Default::default()
        }
    }

    /// Commits and checkpoints.
    pub fn commits() -> Self {
        Self {
            include_commits: true,
            ..Default::default()
        }
    }

    /// Version creation, switching and hiding.
    pub fn versions() -> Self {
        Self {
            include_versions: true,
            ..Default::default()
        }
    }

    /// Everything.
    pub fn all() -> Self {
        Self {
            include_changes: true,
            include_commits: true,
            include_versions: true,
            ..Default::default()
        }
    }

    /// Restrict to one version.
    pub fn for_version(mut self, version_id: VersionId) -> Self {
        self.versions = Some(vec![version_id]);
        self
    }
}

/// Events emitted by subscriptions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // --- Change Events ---
    /// A change was staged into a version's working commit.
    ChangeStaged {
        version_id: VersionId,
        change: ChangeSummary,
    },

    // --- Commit Events ---
    /// A working commit was sealed or a commit was grafted onto a version.
    CommitCreated {
        version_id: VersionId,
        commit_id: CommitId,
        change_count: usize,
        /// True when the commit carries the checkpoint label.
        checkpoint: bool,
    },

    /// Commits received from a sync peer were applied.
    SyncApplied {
        commit_count: usize,
    },

    // --- Version Events ---
    VersionCreated {
        version: VersionSummary,
    },

    VersionSwitched {
        from: Option<VersionId>,
        to: VersionId,
    },

    VersionHidden {
        version_id: VersionId,
    },

    // --- Lifecycle Events ---
    /// Subscription was dropped.
    Dropped {
        reason: DropReason,
    },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Summary of a change (for events, avoids sending large snapshots).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub change_id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
    pub tombstone: bool,
    /// Serialized snapshot size in bytes.
    pub snapshot_size: usize,
    /// The snapshot itself (if small enough, otherwise None).
    pub snapshot: Option<serde_json::Value>,
}

impl ChangeSummary {
    /// Create summary from a full change.
    pub fn from_change(change: &Change, include_snapshot_threshold: usize) -> Self {
        let snapshot_size = change
            .snapshot_content
            .as_ref()
            .and_then(|snapshot| serde_json::to_vec(snapshot).ok())
            .map(|bytes| bytes.len())
            .unwrap_or(0);

        let snapshot = if snapshot_size <= include_snapshot_threshold {
            change.snapshot_content.clone()
        } else {
            None
        };

        Self {
            change_id: change.id.clone(),
            entity_id: change.entity_id.clone(),
            schema_key: change.schema_key.clone(),
            file_id: change.file_id.clone(),
            tombstone: change.is_tombstone(),
            snapshot_size,
            snapshot,
        }
    }

    /// Drop the snapshot if it exceeds `threshold` bytes.
    pub fn limited(mut self, threshold: usize) -> Self {
        if self.snapshot_size > threshold {
            self.snapshot = None;
        }
        self
    }
}

/// Summary of a version (for events).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: VersionId,
    pub name: String,
    pub head_commit_id: CommitId,
    pub inherits_from_version_id: Option<VersionId>,
    pub hidden: bool,
}

impl VersionSummary {
    pub fn from_version(version: &Version) -> Self {
        Self {
            id: version.id.clone(),
            name: version.name.clone(),
            head_commit_id: version.head_commit_id.clone(),
            inherits_from_version_id: version.inherits_from_version_id.clone(),
            hidden: version.hidden,
        }
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to manage a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<EngineEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<EngineEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<EngineEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<EngineEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.receiver.try_iter().collect()
    }
}
