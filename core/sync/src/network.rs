//! Connectivity tracking.
//!
//! Online means the link is up *and* the backend answers a probe. A link-down
//! signal commits immediately; every other transition must be observed for
//! the whole debounce window before it is committed, so a flapping link does
//! not produce a burst of events.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use harborsync_transport::Transport;

use crate::events::{EventBus, SyncEvent};

/// Connectivity settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// How often the backend is probed.
    pub probe_interval: Duration,
    /// How long a new state must hold before it is committed.
    pub debounce: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            debounce: Duration::from_secs(2),
        }
    }
}

/// Callback fired on an offline to online transition. Must not block.
pub type OnlineTrigger = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct Pending {
    online: bool,
    since: Instant,
}

/// Tracks whether the backend is reachable.
pub struct NetworkMonitor {
    online: AtomicBool,
    link_up: AtomicBool,
    pending: Mutex<Option<Pending>>,
    debounce: Duration,
    events: Arc<EventBus>,
}

impl NetworkMonitor {
    /// Create a monitor with an initial state.
    pub fn new(initially_online: bool, debounce: Duration, events: Arc<EventBus>) -> Self {
        Self {
            online: AtomicBool::new(initially_online),
            link_up: AtomicBool::new(true),
            pending: Mutex::new(None),
            debounce,
            events,
        }
    }

    /// Current committed state.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Feed the OS connectivity signal. Link loss commits offline at once.
    pub fn set_link_state(&self, up: bool) {
        self.link_up.store(up, Ordering::SeqCst);
        if !up {
            self.force(false);
        }
    }

    pub fn link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    /// Record one reachability observation.
    ///
    /// Returns the new state if this observation committed a transition.
    pub fn observe(&self, reachable: bool, now: Instant) -> Option<bool> {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };

        if reachable == self.is_online() {
            *pending = None;
            return None;
        }

        let since = match pending.as_ref() {
            Some(p) if p.online == reachable => p.since,
            _ => {
                *pending = Some(Pending {
                    online: reachable,
                    since: now,
                });
                now
            }
        };

        if now.saturating_duration_since(since) >= self.debounce {
            *pending = None;
            drop(pending);
            self.commit(reachable).then_some(reachable)
        } else {
            debug!(
                "Connectivity change to {} pending debounce",
                if reachable { "online" } else { "offline" }
            );
            None
        }
    }

    /// Commit a state immediately, bypassing the debounce window.
    pub fn force(&self, online: bool) -> bool {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = None;
        }
        self.commit(online)
    }

    fn commit(&self, online: bool) -> bool {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return false;
        }
        if online {
            info!("Backend reachable, going online");
            self.events.emit(SyncEvent::Online);
        } else {
            info!("Backend unreachable, going offline");
            self.events.emit(SyncEvent::Offline);
        }
        true
    }

    /// Probe the backend once and feed the result to the debouncer.
    pub async fn check<T: Transport + ?Sized>(&self, transport: &T) -> Option<bool> {
        let reachable = self.link_up() && transport.probe().await.is_ok();
        self.observe(reachable, Instant::now())
    }

    /// Probe periodically until the task is dropped or aborted.
    ///
    /// `trigger` runs after every offline to online transition.
    pub async fn run<T: Transport + ?Sized>(
        &self,
        transport: Arc<T>,
        probe_interval: Duration,
        trigger: OnlineTrigger,
    ) {
        let mut ticker = interval(probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Network monitor started");

        loop {
            ticker.tick().await;
            if self.check(transport.as_ref()).await == Some(true) {
                trigger();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use harborsync_transport::MemoryBackend;
    use std::sync::atomic::AtomicUsize;

    fn monitor(debounce: Duration) -> (NetworkMonitor, Arc<AtomicUsize>) {
        let events = Arc::new(EventBus::default());
        let transitions = Arc::new(AtomicUsize::new(0));
        for kind in [EventKind::Online, EventKind::Offline] {
            let counter = Arc::clone(&transitions);
            events.on(kind, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        (NetworkMonitor::new(true, debounce, events), transitions)
    }

    #[test]
    fn test_flapping_is_debounced() {
        let (monitor, transitions) = monitor(Duration::from_secs(2));
        let start = Instant::now();

        assert_eq!(monitor.observe(false, start), None);
        assert_eq!(monitor.observe(true, start + Duration::from_millis(500)), None);
        assert_eq!(monitor.observe(false, start + Duration::from_secs(1)), None);
        assert!(monitor.is_online());

        // Offline held for the full window commits.
        assert_eq!(
            monitor.observe(false, start + Duration::from_secs(3)),
            Some(false)
        );
        assert!(!monitor.is_online());
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_debounce_commits_immediately() {
        let (monitor, transitions) = monitor(Duration::ZERO);
        let now = Instant::now();
        assert_eq!(monitor.observe(false, now), Some(false));
        assert_eq!(monitor.observe(false, now), None);
        assert_eq!(monitor.observe(true, now), Some(true));
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_link_down_is_immediate() {
        let (monitor, transitions) = monitor(Duration::from_secs(60));
        monitor.set_link_state(false);
        assert!(!monitor.is_online());
        assert_eq!(transitions.load(Ordering::SeqCst), 1);

        // Forcing the current state emits nothing.
        assert!(!monitor.force(false));
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_check_uses_probe_and_link() {
        let (monitor, _) = monitor(Duration::ZERO);
        let backend = MemoryBackend::new();

        backend.set_online(false);
        assert_eq!(monitor.check(&backend).await, Some(false));

        backend.set_online(true);
        monitor.set_link_state(false);
        assert_eq!(monitor.check(&backend).await, None);
        assert!(!monitor.is_online());

        monitor.set_link_state(true);
        assert_eq!(monitor.check(&backend).await, Some(true));
    }

    #[tokio::test]
    async fn test_run_triggers_on_reconnect() {
        let events = Arc::new(EventBus::default());
        let monitor = Arc::new(NetworkMonitor::new(false, Duration::ZERO, events));
        let backend = Arc::new(MemoryBackend::new());
        let triggered = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&triggered);
        let task_monitor = Arc::clone(&monitor);
        let task = tokio::spawn(async move {
            task_monitor
                .run(
                    backend,
                    Duration::from_millis(20),
                    Arc::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .await;
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(monitor.is_online());
        assert_eq!(triggered.load(Ordering::SeqCst), 1);
        task.abort();
    }
}
