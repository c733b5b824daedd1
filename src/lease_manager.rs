//! Periodic expiration sweep.
//!
//! One task sweeps, sleeps for the interval, and sweeps again, so sweeps
//! never overlap. A failed sweep is logged and the next tick tries again.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::ipam::Ipam;

pub struct LeaseManager {
    ipam: Ipam,
    interval: Duration,
}

/// Stops a spawned [`LeaseManager`].
pub struct LeaseManagerHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl LeaseManagerHandle {
    /// Signals the sweep loop and waits for it to exit. A sweep already in
    /// progress runs to completion first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(error) = self.task.await {
            error!(error = %error, "lease manager task failed");
        }
    }
}

impl LeaseManager {
    pub fn new(ipam: Ipam, interval: Duration) -> Self {
        Self { ipam, interval }
    }

    /// Runs one sweep now.
    pub async fn sweep(&self) -> Result<usize> {
        self.ipam.recycle_expired_leases(Utc::now()).await
    }

    pub fn spawn(self) -> LeaseManagerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        LeaseManagerHandle { shutdown_tx, task }
    }

    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) {
        info!(interval = ?self.interval, "lease manager started");
        loop {
            match self.sweep().await {
                Ok(0) => debug!("lease sweep found nothing to recycle"),
                Ok(recycled) => info!(recycled, "lease sweep complete"),
                Err(error) => error!(error = %error, "lease sweep failed"),
            }

            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("lease manager stopped");
    }
}
