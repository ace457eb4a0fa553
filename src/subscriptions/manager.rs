//! Subscription manager for broadcasting engine events.

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::types::{
    DropReason, EngineEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
};

/// Default threshold for including snapshots in change events (bytes).
pub const DEFAULT_PAYLOAD_THRESHOLD: usize = 4096;

/// Internal subscription state.
struct Subscription {
    config: SubscriptionConfig,
    sender: Sender<EngineEvent>,
}

impl Subscription {
    /// Try to send an event. Returns false if buffer is full (subscriber will be dropped).
    fn try_send(&self, event: EngineEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }

    fn matches_version(&self, version_id: &crate::types::VersionId) -> bool {
        match &self.config.filter.versions {
            Some(versions) => versions.contains(version_id),
            None => true,
        }
    }

    /// Check if this subscription wants an event.
    fn matches(&self, event: &EngineEvent) -> bool {
        let filter = &self.config.filter;
        match event {
            EngineEvent::ChangeStaged { version_id, change } => {
                if !filter.include_changes || !self.matches_version(version_id) {
                    return false;
                }
                match &filter.schema_keys {
                    Some(keys) => keys.contains(&change.schema_key),
                    None => true,
                }
            }
            EngineEvent::CommitCreated { version_id, .. } => {
                filter.include_commits && self.matches_version(version_id)
            }
            EngineEvent::SyncApplied { .. } => filter.include_commits,
            EngineEvent::VersionCreated { version } => {
                filter.include_versions && self.matches_version(&version.id)
            }
            EngineEvent::VersionSwitched { to, .. } => {
                filter.include_versions && self.matches_version(to)
            }
            EngineEvent::VersionHidden { version_id } => {
                filter.include_versions && self.matches_version(version_id)
            }
            EngineEvent::Dropped { .. } => false,
        }
    }
}

/// Manages subscriptions and broadcasts events.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Threshold for including snapshots in change events.
    payload_threshold: usize,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new() -> Self {
        Self::with_payload_threshold(DEFAULT_PAYLOAD_THRESHOLD)
    }

    /// Create a new subscription manager with custom payload threshold.
    pub fn with_payload_threshold(threshold: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            payload_threshold: threshold,
        }
    }

    /// Create a new subscription. Events are delivered from now on.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size);

        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        SubscriptionHandle { id, receiver }
    }

    /// Remove a subscription; its handle receives a final `Dropped` event.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscriptions.write();
        if let Some(sub) = subs.remove(&id) {
            let _ = sub.sender.try_send(EngineEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Broadcast events in order. Drops subscribers that fail to receive.
    pub fn broadcast_all(&self, events: Vec<EngineEvent>) {
        for event in events {
            self.broadcast(event);
        }
    }

    /// Broadcast one event to matching subscriptions.
    pub fn broadcast(&self, event: EngineEvent) {
        let event = match event {
            EngineEvent::ChangeStaged { version_id, change } => EngineEvent::ChangeStaged {
                version_id,
                change: change.limited(self.payload_threshold),
            },
            other => other,
        };

        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if sub.matches(&event) && !sub.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    debug!(subscription = id.0, "dropping slow subscriber");
                    // The buffer is full, so this usually fails.
                    let _ = sub.sender.try_send(EngineEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::types::{ChangeSummary, SubscriptionFilter};
    use crate::types::{Change, ChangeId, CommitId, Timestamp, VersionId};
    use serde_json::json;
    use std::time::Duration;

    fn staged(schema_key: &str, snapshot: serde_json::Value) -> EngineEvent {
        let change = Change {
            id: ChangeId::new("c1"),
            entity_id: "e1".into(),
            schema_key: schema_key.into(),
            schema_version: "1.0".into(),
            file_id: "f".into(),
            plugin_key: "p".into(),
            snapshot_content: Some(snapshot),
            metadata: None,
            created_at: Timestamp(1),
        };
        EngineEvent::ChangeStaged {
            version_id: VersionId::new("v1"),
            change: ChangeSummary::from_change(&change, usize::MAX),
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let manager = SubscriptionManager::new();

        let handle = manager.subscribe(SubscriptionConfig::default());
        assert_eq!(manager.subscription_count(), 1);

        manager.unsubscribe(handle.id);
        assert_eq!(manager.subscription_count(), 0);
        assert!(matches!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            EngineEvent::Dropped {
                reason: DropReason::Unsubscribed
            }
        ));
    }

    #[test]
    fn test_broadcast_filters_by_schema() {
        let manager = SubscriptionManager::new();
        let handle = manager.subscribe(SubscriptionConfig {
            filter: SubscriptionFilter::schemas(vec!["todo".to_string()]),
            ..Default::default()
        });

        manager.broadcast(staged("note", json!(1)));
        manager.broadcast(staged("todo", json!(2)));

        let event = handle.recv_timeout(Duration::from_millis(100)).unwrap();
        match event {
            EngineEvent::ChangeStaged { change, .. } => assert_eq!(change.schema_key, "todo"),
            other => panic!("Expected ChangeStaged, got {:?}", other),
        }
        assert!(handle.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_large_snapshots_are_left_out() {
        let manager = SubscriptionManager::with_payload_threshold(8);
        let handle = manager.subscribe(SubscriptionConfig::default());

        manager.broadcast(staged("todo", json!("a much longer snapshot value")));

        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            EngineEvent::ChangeStaged { change, .. } => {
                assert!(change.snapshot.is_none());
                assert!(change.snapshot_size > 8);
            }
            other => panic!("Expected ChangeStaged, got {:?}", other),
        }
    }

    #[test]
    fn test_version_filter() {
        let manager = SubscriptionManager::new();
        let handle = manager.subscribe(SubscriptionConfig {
            filter: SubscriptionFilter::commits().for_version(VersionId::new("v2")),
            ..Default::default()
        });

        manager.broadcast(EngineEvent::CommitCreated {
            version_id: VersionId::new("v1"),
            commit_id: CommitId::new("c"),
            change_count: 1,
            checkpoint: true,
        });
        assert!(handle.try_recv().is_err());
    }

    #[test]
    fn test_slow_subscriber_is_dropped() {
        let manager = SubscriptionManager::new();
        let slow = manager.subscribe(SubscriptionConfig {
            buffer_size: 2,
            ..Default::default()
        });
        let fast = manager.subscribe(SubscriptionConfig::default());

        manager.broadcast_all((0..10).map(|n| staged("todo", json!(n))).collect());

        assert_eq!(manager.subscription_count(), 1);
        assert_eq!(slow.drain().len(), 2);
        assert_eq!(fast.drain().len(), 10);
    }
}
