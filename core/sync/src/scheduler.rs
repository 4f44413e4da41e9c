//! Sync scheduling - on-demand and periodic modes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use harborsync_common::{Collection, ConflictStrategy, Error, Result};

use crate::report::SyncAllReport;

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum SyncMode {
    /// Manual sync only.
    Manual,
    /// Drain the queue as soon as something is queued.
    OnDemand,
    /// Sync at regular intervals.
    Periodic { interval: Duration },
    /// Both on-demand and periodic.
    Hybrid { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            _ => None,
        }
    }

    fn reacts_to_changes(&self) -> bool {
        matches!(self, SyncMode::OnDemand | SyncMode::Hybrid { .. })
    }
}

/// Sync request types. `None` strategies mean the configured default.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncRequest {
    /// Every configured collection.
    All(Option<ConflictStrategy>),
    /// One collection.
    Collection(Collection, Option<ConflictStrategy>),
    /// Drain the queue without pulling.
    Pending,
    /// Shutdown the scheduler.
    Shutdown,
}

type Reply = oneshot::Sender<Result<SyncAllReport>>;

/// Scheduler for managing sync timing and requests.
#[derive(Clone)]
pub struct SyncScheduler {
    /// Current sync mode.
    mode: Arc<RwLock<SyncMode>>,
    mode_changed: Arc<Notify>,
    /// Channel to send sync requests.
    request_tx: mpsc::Sender<(SyncRequest, Reply)>,
    /// Shutdown signal.
    shutdown: Arc<AtomicBool>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));
        let mode_changed = Arc::new(Notify::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let scheduler = Self {
            mode: Arc::clone(&mode),
            mode_changed: Arc::clone(&mode_changed),
            request_tx,
            shutdown: Arc::clone(&shutdown),
        };

        let handle = SyncSchedulerHandle {
            mode,
            mode_changed,
            request_rx: Some(request_rx),
            shutdown,
        };

        (scheduler, handle)
    }

    /// Request a sync of every collection and wait for the report.
    pub async fn request_sync(&self, strategy: Option<ConflictStrategy>) -> Result<SyncAllReport> {
        self.request(SyncRequest::All(strategy)).await
    }

    /// Request a sync of one collection and wait for the report.
    pub async fn request_collection_sync(
        &self,
        collection: Collection,
        strategy: Option<ConflictStrategy>,
    ) -> Result<SyncAllReport> {
        self.request(SyncRequest::Collection(collection, strategy))
            .await
    }

    /// Send a request and wait for its result.
    pub async fn request(&self, request: SyncRequest) -> Result<SyncAllReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::NotPermitted("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::NotPermitted("Failed to receive sync result".to_string()))?
    }

    /// Queue a request without waiting. Returns whether it was accepted.
    ///
    /// Never blocks, so it is safe to call from event handlers.
    pub fn try_request(&self, request: SyncRequest) -> bool {
        let (response_tx, _) = oneshot::channel();
        match self.request_tx.try_send((request, response_tx)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Sync request dropped, scheduler busy");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Sync request dropped, scheduler stopped");
                false
            }
        }
    }

    /// Notify the scheduler of a local change (for on-demand mode).
    pub fn notify_change(&self) {
        let mode = self.mode();
        if mode.reacts_to_changes() {
            self.try_request(SyncRequest::Pending);
        } else {
            debug!("Change notification ignored (mode: {:?})", mode);
        }
    }

    /// Change the sync mode.
    pub fn set_mode(&self, mode: SyncMode) {
        match self.mode.write() {
            Ok(mut current) => *current = mode,
            Err(poisoned) => *poisoned.into_inner() = mode,
        }
        self.mode_changed.notify_one();
    }

    /// Get current sync mode.
    pub fn mode(&self) -> SyncMode {
        match self.mode.read() {
            Ok(mode) => mode.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        // Send shutdown request
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
    mode_changed: Arc<Notify>,
    request_rx: Option<mpsc::Receiver<(SyncRequest, Reply)>>,
    shutdown: Arc<AtomicBool>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. The `sync_fn` is called
    /// whenever a sync is needed.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<SyncAllReport>> + Send,
    {
        let Some(mut request_rx) = self.request_rx.take() else {
            error!("Sync scheduler handle can only be run once");
            return;
        };
        let mut periodic_interval = self.create_periodic_interval();
        // Backed-off requests a finished pass left behind.
        let mut retry_at: Option<Instant> = None;

        info!("Sync scheduler started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Sync scheduler shutting down");
                break;
            }

            tokio::select! {
                // Handle incoming sync requests
                received = request_rx.recv() => {
                    let Some((request, response_tx)) = received else {
                        info!("All schedulers dropped, stopping");
                        break;
                    };
                    if request == SyncRequest::Shutdown {
                        info!("Received shutdown request");
                        break;
                    }
                    debug!("Processing sync request: {:?}", request);
                    let result = sync_fn(request).await;
                    if let Err(e) = &result {
                        debug!("Sync request ended with: {}", e);
                    }
                    Self::note_retry(&mut retry_at, &result);
                    let _ = response_tx.send(result);
                }

                // Come back for requests waiting out a backoff
                _ = Self::wait_for_retry(retry_at) => {
                    retry_at = None;
                    debug!("Retrying backed-off requests");
                    let result = sync_fn(SyncRequest::Pending).await;
                    if let Err(e) = &result {
                        debug!("Retry pass ended with: {}", e);
                    }
                    Self::note_retry(&mut retry_at, &result);
                }

                // Handle periodic sync
                _ = Self::wait_for_periodic(&mut periodic_interval) => {
                    debug!("Triggering periodic sync");
                    let result = sync_fn(SyncRequest::All(None)).await;
                    Self::note_retry(&mut retry_at, &result);
                    match result {
                        Ok(report) => {
                            info!(
                                "Periodic sync completed: {} processed, {} failed, {} conflicts",
                                report.processed(),
                                report.failed(),
                                report.conflicts()
                            );
                        }
                        Err(Error::SyncInProgress) => {
                            debug!("Periodic sync skipped, a pass is already running");
                        }
                        Err(e) => {
                            warn!("Periodic sync failed: {}", e);
                        }
                    }
                }

                _ = self.mode_changed.notified() => {
                    debug!("Sync mode changed");
                    periodic_interval = self.create_periodic_interval();
                }
            }
        }
    }

    /// Arm the retry timer from a finished pass.
    ///
    /// Failed passes leave the timer alone: a pass already running will
    /// report its own retry time, and an offline backend is picked up again
    /// by the network monitor.
    fn note_retry(retry_at: &mut Option<Instant>, result: &Result<SyncAllReport>) {
        if let Ok(report) = result {
            *retry_at = report.next_retry.map(|at| {
                let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                debug!("Next retry in {:?}", wait);
                Instant::now() + wait
            });
        }
    }

    async fn wait_for_retry(retry_at: Option<Instant>) {
        match retry_at {
            Some(at) => sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    }

    fn create_periodic_interval(&self) -> Option<Interval> {
        let mode = match self.mode.read() {
            Ok(mode) => mode.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        mode.interval().map(|duration| {
            let mut ticker = interval(duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        })
    }

    async fn wait_for_periodic(interval: &mut Option<Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            // No periodic sync; wait for a request or a mode change.
            None => std::future::pending::<()>().await,
        }
    }
}
