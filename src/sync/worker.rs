//! Background sync thread.

use crate::engine::Engine;
use crate::error::Result;
use crate::sync::transport::SyncTransport;
use crate::sync::{sync_once, SyncReport};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sync worker configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Time between rounds.
    pub poll_interval: Duration,

    /// Maximum commits per pushed bundle.
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// Handle to a running sync thread. Dropping it stops the thread.
pub struct SyncWorker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncWorker {
    /// Start polling on a dedicated thread.
    ///
    /// Each tick checks the engine's sync toggle; when it is on, one
    /// push/pull round runs. The engine lock is never held across a
    /// transport call.
    pub fn spawn<T: SyncTransport>(engine: Arc<Engine>, transport: T, config: SyncConfig) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("lix-sync".into())
            .spawn(move || run(engine, transport, config, stop_rx))?;
        info!("sync worker started");
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for the current round to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sync worker panicked");
            }
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<T: SyncTransport>(engine: Arc<Engine>, mut transport: T, config: SyncConfig, stop: Receiver<()>) {
    let ticker = tick(config.poll_interval);
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(ticker) -> _ => {}
        }

        match engine.sync_enabled() {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(error = %e, "could not read sync toggle");
                continue;
            }
        }

        match sync_once(&engine, &mut transport, config.batch_size) {
            Ok(report) if report != SyncReport::default() => {
                debug!(pushed = report.pushed, imported = report.imported, rejected = report.rejected, "sync round");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "sync round failed; retrying next poll"),
        }
    }
    debug!("sync worker stopped");
}
