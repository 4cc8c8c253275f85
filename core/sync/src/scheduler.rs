//! Sync scheduling - manual and periodic modes.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use twinsync_common::{Error, Result};

use crate::engine::SyncResult;

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// Sync only when requested.
    Manual,
    /// Sync at regular intervals, plus on request.
    Periodic {
        #[serde(with = "crate::config::duration_ms")]
        interval: Duration,
    },
}

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    /// Run one pass.
    Sync,
    /// Stop the scheduler.
    Shutdown,
}

type Request = (SyncRequest, oneshot::Sender<SyncResult>);

/// Front end for requesting passes from a running scheduler task.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<Request>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Request a pass and wait for its result.
    pub async fn request_sync(&self) -> Result<SyncResult> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Sync, response_tx))
            .await
            .map_err(|_| Error::Unknown("scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Unknown("scheduler dropped the sync request".to_string()))
    }

    /// Change the sync mode. Takes effect after the current wait.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<Request>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown.
    ///
    /// `sync_fn` runs one pass; manual and periodic triggers both go
    /// through it.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult> + Send,
    {
        let mut current = self.mode.read().await.clone();
        let mut ticker = Self::ticker(&current);

        info!("Sync scheduler started in {:?} mode", current);

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((SyncRequest::Sync, response_tx)) => {
                            debug!("Processing sync request");
                            let result = sync_fn().await;
                            let _ = response_tx.send(result);
                        }
                        Some((SyncRequest::Shutdown, _)) => {
                            info!("Received shutdown request");
                            break;
                        }
                        None => {
                            info!("All schedulers dropped, stopping");
                            break;
                        }
                    }
                }

                _ = Self::wait_for_periodic(&mut ticker) => {
                    debug!("Triggering periodic sync");
                    match sync_fn().await {
                        SyncResult::Failure(err) => error!("Periodic sync failed: {}", err),
                        result => info!("Periodic sync finished: {:?}", result.kind()),
                    }
                }
            }

            let mode = self.mode.read().await.clone();
            if mode != current {
                debug!("Sync mode changed to {:?}", mode);
                ticker = Self::ticker(&mode);
                current = mode;
            }
        }
    }

    fn ticker(mode: &SyncMode) -> Option<Interval> {
        match mode {
            SyncMode::Periodic { interval: period } => {
                let mut ticker = interval(*period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick fires immediately; skip it.
                ticker.reset();
                Some(ticker)
            }
            SyncMode::Manual => None,
        }
    }

    async fn wait_for_periodic(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
