//! Event bus for sync state changes.
//!
//! Every component announces its transitions here. Subscribers either
//! register a synchronous handler per event kind (`on`/`off`) or take a
//! broadcast receiver for async consumption.

use futures::Stream;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{error, warn};

use harborsync_common::{Collection, ResourceId};
use harborsync_store::{ConflictItem, QueuedRequest, RequestStatus};

use crate::report::{CollectionResult, SyncScope};

/// Sync events with a fixed payload per kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    /// The backend became reachable.
    Online,
    /// The backend became unreachable.
    Offline,
    SyncStarted {
        scope: SyncScope,
    },
    SyncCompleted {
        scope: SyncScope,
        results: BTreeMap<Collection, CollectionResult>,
    },
    /// The pass could not start or stopped early. Progress made so far is kept.
    SyncFailed {
        scope: SyncScope,
        error: String,
        results: BTreeMap<Collection, CollectionResult>,
    },
    RequestQueued {
        request: QueuedRequest,
        status: RequestStatus,
    },
    ConflictDetected {
        item: ConflictItem,
    },
    ConflictResolved {
        collection: Collection,
        id: ResourceId,
    },
    /// Local storage failed; the store is now read-only and in memory.
    StorageDegraded {
        reason: String,
    },
}

/// Discriminant of [`SyncEvent`], used to register handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Online,
    Offline,
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    RequestQueued,
    ConflictDetected,
    ConflictResolved,
    StorageDegraded,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Online,
        EventKind::Offline,
        EventKind::SyncStarted,
        EventKind::SyncCompleted,
        EventKind::SyncFailed,
        EventKind::RequestQueued,
        EventKind::ConflictDetected,
        EventKind::ConflictResolved,
        EventKind::StorageDegraded,
    ];
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::Online => EventKind::Online,
            SyncEvent::Offline => EventKind::Offline,
            SyncEvent::SyncStarted { .. } => EventKind::SyncStarted,
            SyncEvent::SyncCompleted { .. } => EventKind::SyncCompleted,
            SyncEvent::SyncFailed { .. } => EventKind::SyncFailed,
            SyncEvent::RequestQueued { .. } => EventKind::RequestQueued,
            SyncEvent::ConflictDetected { .. } => EventKind::ConflictDetected,
            SyncEvent::ConflictResolved { .. } => EventKind::ConflictResolved,
            SyncEvent::StorageDegraded { .. } => EventKind::StorageDegraded,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
}

/// In-process publish/subscribe channel.
///
/// `emit` is synchronous: handlers registered for the event's kind run in
/// registration order on the emitting task, each at most once. A panicking
/// handler is logged and skipped.
pub struct EventBus {
    handlers: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Create a new event bus with specified broadcast capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = match self.handlers.lock() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.push(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Unregister a handler. Returns whether it was registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = match self.handlers.lock() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = handlers.len();
        handlers.retain(|s| s.id != id);
        handlers.len() != before
    }

    /// Emit an event
    pub fn emit(&self, event: SyncEvent) {
        let kind = event.kind();
        // Snapshot so handlers may call on/off without deadlocking.
        let matching: Vec<(SubscriptionId, Handler)> = {
            let handlers = match self.handlers.lock() {
                Ok(handlers) => handlers,
                Err(poisoned) => poisoned.into_inner(),
            };
            handlers
                .iter()
                .filter(|s| s.kind == kind)
                .map(|s| (s.id, Arc::clone(&s.handler)))
                .collect()
        };

        for (id, handler) in matching {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!("Event handler {:?} panicked on {:?}", id, kind);
            }
        }

        // Ignore send errors (no receivers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Events as an async stream. Lagging receivers skip missed events.
    pub fn stream(&self) -> impl Stream<Item = SyncEvent> + Send + 'static {
        futures::stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event stream lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    pub fn handler_count(&self) -> usize {
        match self.handlers.lock() {
            Ok(handlers) => handlers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handlers_receive_only_their_kind() {
        let bus = EventBus::default();
        let online = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&online);
        bus.on(EventKind::Online, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(SyncEvent::Online);
        bus.emit(SyncEvent::Offline);
        bus.emit(SyncEvent::Online);

        assert_eq!(online.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_off_stops_delivery() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = bus.on(EventKind::Offline, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(SyncEvent::Offline);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(SyncEvent::Offline);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_break_emit() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        bus.on(EventKind::StorageDegraded, move |_| first.lock().unwrap().push(1));
        bus.on(EventKind::StorageDegraded, |_| panic!("faulty subscriber"));
        let third = Arc::clone(&order);
        bus.on(EventKind::StorageDegraded, move |_| third.lock().unwrap().push(3));

        bus.emit(SyncEvent::StorageDegraded {
            reason: "disk full".to_string(),
        });

        assert_eq!(*order.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::default());
        let slot = Arc::new(Mutex::new(None));
        let bus_clone = Arc::clone(&bus);
        let slot_clone = Arc::clone(&slot);
        let id = bus.on(EventKind::Online, move |_| {
            if let Some(id) = *slot_clone.lock().unwrap() {
                bus_clone.off(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        bus.emit(SyncEvent::Online);
        assert_eq!(bus.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_delivers_in_order() {
        let bus = EventBus::default();
        let mut stream = Box::pin(bus.stream());

        bus.emit(SyncEvent::Offline);
        bus.emit(SyncEvent::Online);

        assert_eq!(stream.next().await.map(|e| e.kind()), Some(EventKind::Offline));
        assert_eq!(stream.next().await.map(|e| e.kind()), Some(EventKind::Online));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(SyncEvent::SyncStarted {
            scope: SyncScope::Collection(Collection::containers()),
        })
        .unwrap();
        assert_eq!(json["type"], "sync-started");
        assert_eq!(json["scope"]["collection"], "containers");
    }
}
