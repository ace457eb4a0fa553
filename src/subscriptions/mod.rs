//! Subscription system for live engine events.
//!
//! This module provides in-process subscriptions to engine events:
//! - Staged changes
//! - Commits and checkpoints
//! - Version lifecycle (create, switch, hide)
//!
//! Events are broadcast only after the write that produced them has
//! committed. Buffers are bounded; slow subscribers are dropped.
//!
//! # Example
//!
//! ```ignore
//! let handle = engine.subscribe(SubscriptionConfig {
//!     filter: SubscriptionFilter::schemas(vec!["todo".to_string()]),
//!     ..Default::default()
//! });
//!
//! loop {
//!     match handle.recv() {
//!         Ok(EngineEvent::ChangeStaged { change, .. }) => println!("{:?}", change),
//!         Ok(EngineEvent::Dropped { .. }) | Err(_) => break,
//!         Ok(_) => {}
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::{SubscriptionManager, DEFAULT_PAYLOAD_THRESHOLD};
pub use types::{
    ChangeSummary, DropReason, EngineEvent, SubscriptionConfig, SubscriptionFilter,
    SubscriptionHandle, SubscriptionId, VersionSummary,
};
