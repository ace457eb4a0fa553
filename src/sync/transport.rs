//! Transport seam between the sync worker and whatever carries bundles.

use crate::error::{EngineError, Result};
use crate::sync::bundle::SyncBundle;
use parking_lot::Mutex;
use std::sync::Arc;

/// Moves bundles between this peer and the others.
///
/// Errors are treated as transient: the worker logs them and retries on the
/// next poll without advancing its push watermark.
pub trait SyncTransport: Send + 'static {
    /// Deliver a bundle to the other peers.
    fn push(&mut self, bundle: &SyncBundle) -> Result<()>;

    /// Bundles published by other peers since the previous pull.
    fn pull(&mut self) -> Result<Vec<SyncBundle>>;

    /// Hand back bundles that could not be applied yet, typically because
    /// their parents have not arrived. They are returned again by a later
    /// [`pull`](Self::pull).
    fn requeue(&mut self, bundles: Vec<SyncBundle>);
}

/// In-process relay shared by [`MemoryTransport`] endpoints.
#[derive(Clone, Debug, Default)]
pub struct MemoryHub {
    log: Arc<Mutex<Vec<(String, SyncBundle)>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an endpoint that publishes as `peer`.
    pub fn endpoint(&self, peer: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            peer: peer.into(),
            cursor: 0,
            deferred: Vec::new(),
        }
    }

    /// Number of bundles published so far.
    pub fn published(&self) -> usize {
        self.log.lock().len()
    }
}

/// Transport over a [`MemoryHub`]; each endpoint sees every other
/// endpoint's bundles once, in publication order, followed by anything
/// requeued since the previous pull.
#[derive(Debug)]
pub struct MemoryTransport {
    hub: MemoryHub,
    peer: String,
    cursor: usize,
    deferred: Vec<SyncBundle>,
}

impl SyncTransport for MemoryTransport {
    fn push(&mut self, bundle: &SyncBundle) -> Result<()> {
        if self.peer.is_empty() {
            return Err(EngineError::Sync("endpoint has no peer name".into()));
        }
        self.hub.log.lock().push((self.peer.clone(), bundle.clone()));
        Ok(())
    }

    fn pull(&mut self) -> Result<Vec<SyncBundle>> {
        let log = self.hub.log.lock();
        let mut received: Vec<SyncBundle> = log[self.cursor..]
            .iter()
            .filter(|(peer, _)| *peer != self.peer)
            .map(|(_, bundle)| bundle.clone())
            .collect();
        self.cursor = log.len();
        received.append(&mut self.deferred);
        Ok(received)
    }

    fn requeue(&mut self, bundles: Vec<SyncBundle>) {
        self.deferred.extend(bundles);
    }
}
