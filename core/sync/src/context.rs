//! Session context wiring the engine, scheduler and background tasks.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use harborsync_common::{Error, Result};
use harborsync_store::{MemoryStore, RecordStore, ResilientStore};
use harborsync_transport::{HttpTransport, Transport};

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::events::SyncEvent;
use crate::scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};

/// One sync session.
///
/// Built once at start-up and passed to whatever needs the engine. Owns the
/// scheduler loop and the network probe while they run.
pub struct SyncContext {
    engine: Arc<SyncEngine>,
    resilient: Option<Arc<ResilientStore>>,
    scheduler: SyncScheduler,
    handle: Mutex<Option<SyncSchedulerHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncContext {
    /// Open the configured store and build the engine over `transport`.
    ///
    /// A database that cannot be opened does not fail the call: the session
    /// starts degraded and `StorageDegraded` is emitted.
    pub fn open(config: SyncConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let resilient = config
            .database_path
            .as_ref()
            .map(|path| Arc::new(ResilientStore::open(path)));
        let store: Arc<dyn RecordStore> = match &resilient {
            Some(store) => Arc::clone(store) as Arc<dyn RecordStore>,
            None => Arc::new(MemoryStore::new()),
        };

        let mode = config.sync_mode.clone();
        let engine = Arc::new(SyncEngine::new(transport, store, config)?);

        if let Some(store) = &resilient {
            let events = Arc::clone(engine.events());
            store.set_degraded_hook(Box::new(move |reason| {
                events.emit(SyncEvent::StorageDegraded {
                    reason: reason.to_string(),
                });
            }));
            if let Some(reason) = store.degraded_reason() {
                warn!("Starting with a read-only store: {}", reason);
                engine.events().emit(SyncEvent::StorageDegraded { reason });
            }
        }

        let (scheduler, handle) = SyncScheduler::new(mode);
        let notifier = scheduler.clone();
        engine.set_change_hook(Some(Arc::new(move || notifier.notify_change())));

        Ok(Self {
            engine,
            resilient,
            scheduler,
            handle: Mutex::new(Some(handle)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Open a session against the HTTP backend named in the config.
    pub fn connect(config: SyncConfig) -> Result<Self> {
        let url = config
            .backend_url
            .clone()
            .ok_or_else(|| Error::InvalidInput("No backend URL configured".to_string()))?;
        let transport = HttpTransport::new(&url, config.request_timeout)?;
        Self::open(config, Arc::new(transport))
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    /// Why local storage became read-only, if it did.
    pub fn degraded_reason(&self) -> Option<String> {
        self.resilient.as_ref().and_then(|store| store.degraded_reason())
    }

    /// Spawn the scheduler loop and the network probe.
    ///
    /// Must be called inside a tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let handle = self
            .handle
            .lock()
            .map_err(|_| Error::Storage("context lock poisoned".to_string()))?
            .take();
        let Some(handle) = handle else {
            warn!("Sync context already started");
            return Ok(());
        };

        let engine = Arc::clone(&self.engine);
        let scheduler_task = tokio::spawn(handle.run(move |request: SyncRequest| {
            let engine = Arc::clone(&engine);
            async move { engine.run_request(request).await }
        }));

        let network = Arc::clone(self.engine.network());
        let transport = Arc::clone(self.engine.transport());
        let probe_interval = self.engine.config().network.probe_interval;
        let scheduler = self.scheduler.clone();
        let monitor_task = tokio::spawn(async move {
            let trigger = Arc::new(move || {
                if scheduler.mode() != SyncMode::Manual {
                    scheduler.try_request(SyncRequest::Pending);
                }
            });
            network.run(transport, probe_interval, trigger).await;
        });

        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| Error::Storage("context lock poisoned".to_string()))?;
        tasks.push(scheduler_task);
        tasks.push(monitor_task);
        info!("Sync context started");
        Ok(())
    }

    /// Stop the background tasks. A pass in progress finishes first.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            // The probe loop never ends on its own.
            if !task.is_finished() {
                task.abort();
            }
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Background task failed: {}", e);
                }
            }
        }
        info!("Sync context stopped");
    }
}
