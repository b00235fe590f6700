//! Store notifications.
//!
//! Listeners subscribe per event kind and receive events synchronously.
//! Emission works on a snapshot of the listener list taken under the lock;
//! the lock is released before any callback runs, so a listener may
//! subscribe or unsubscribe from inside a callback. A listener removed
//! during an emission still sees that emission.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use recsync_core::{BusinessKey, ClientToken, Record, StorageError, SyncError, SyncResult};
use recsync_storage::WriteBatch;
use tokio::sync::watch;

/// Handle returned by [`EventBus::on`], accepted by [`EventBus::off`].
pub type ListenerId = u64;

/// Listener callback.
pub type Listener = dyn Fn(&StoreEvent) + Send + Sync;

/// Event names, as exposed to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEventKind {
    DataChange,
    Add,
    Remove,
    Save,
}

impl StoreEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataChange => "datachange",
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Save => "save",
        }
    }

    /// Parse an event name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "datachange" => Some(Self::DataChange),
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            "save" => Some(Self::Save),
            _ => None,
        }
    }
}

impl fmt::Display for StoreEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful save reconciled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveSummary {
    /// Tokens of records whose creation was acknowledged.
    pub created: Vec<ClientToken>,
    /// Tokens of records whose update was acknowledged.
    pub updated: Vec<ClientToken>,
    /// Business keys the server confirmed deleted.
    pub deleted: Vec<BusinessKey>,
    /// Submitted tokens the response did not mention. They stay pending.
    pub unreconciled: Vec<ClientToken>,
    /// Records removed while their create was in flight that the server
    /// never created. They are dropped rather than deleted.
    pub cancelled: Vec<ClientToken>,
}

type Outcome = Option<Result<SaveSummary, SyncError>>;

/// Eventual outcome of one save, handed out before the write completes.
#[derive(Debug, Clone)]
pub struct SaveHandle {
    rx: watch::Receiver<Outcome>,
}

/// Sending half kept by the store while the save runs.
#[derive(Debug)]
pub(crate) struct SaveResolver {
    tx: watch::Sender<Outcome>,
}

impl SaveHandle {
    pub(crate) fn channel() -> (SaveResolver, SaveHandle) {
        let (tx, rx) = watch::channel(None);
        (SaveResolver { tx }, SaveHandle { rx })
    }

    /// Outcome if the save has already finished.
    pub fn try_outcome(&self) -> Option<SyncResult<SaveSummary>> {
        self.rx.borrow().clone()
    }

    /// Wait for the save to finish.
    pub async fn outcome(&mut self) -> SyncResult<SaveSummary> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(|| Err(abandoned())),
            Err(_) => Err(abandoned()),
        }
    }
}

fn abandoned() -> SyncError {
    SyncError::Storage(StorageError::Backend {
        backend: "save".to_string(),
        reason: "save dropped before completing".to_string(),
    })
}

impl SaveResolver {
    pub(crate) fn resolve(self, outcome: &SyncResult<SaveSummary>) {
        // No receiver left is fine: nobody is waiting.
        let _ = self.tx.send(Some(outcome.clone()));
    }
}

/// A store notification.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// The visible record sequence changed.
    DataChange(Vec<Record>),
    /// Records were inserted locally.
    Add(Vec<Record>),
    /// Records were removed locally.
    Remove(Vec<Record>),
    /// A save started. Carries the submitted batch and its outcome handle.
    Save {
        request: WriteBatch,
        handle: SaveHandle,
    },
}

impl StoreEvent {
    pub fn kind(&self) -> StoreEventKind {
        match self {
            Self::DataChange(_) => StoreEventKind::DataChange,
            Self::Add(_) => StoreEventKind::Add,
            Self::Remove(_) => StoreEventKind::Remove,
            Self::Save { .. } => StoreEventKind::Save,
        }
    }

    /// Records carried by the event, empty for `Save`.
    pub fn records(&self) -> &[Record] {
        match self {
            Self::DataChange(records) | Self::Add(records) | Self::Remove(records) => records,
            Self::Save { .. } => &[],
        }
    }
}

type Entry = (ListenerId, StoreEventKind, Arc<Listener>);

/// Per-kind listener registry.
pub struct EventBus {
    listeners: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        // Listeners never run under this lock, so a poisoned list is intact.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe `listener` to events of `kind`.
    pub fn on(
        &self,
        kind: StoreEventKind,
        listener: impl Fn(&StoreEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries().push((id, kind, Arc::new(listener)));
        id
    }

    /// Unsubscribe. Unknown ids are ignored.
    pub fn off(&self, id: ListenerId) {
        self.entries().retain(|(lid, _, _)| *lid != id);
    }

    pub fn emit(&self, event: &StoreEvent) {
        let kind = event.kind();
        let snapshot: Vec<Arc<Listener>> = self
            .entries()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    /// Number of registered listeners across all kinds.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listeners_receive_only_their_kind() {
        let bus = EventBus::new();
        let changes = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&changes);
        bus.on(StoreEventKind::DataChange, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&StoreEvent::Add(vec![]));
        bus.emit(&StoreEvent::DataChange(vec![]));
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_unsubscribes() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let id = bus.on(StoreEventKind::Remove, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.off(id);
        bus.off(id);
        bus.emit(&StoreEvent::Remove(vec![]));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_listener_may_unsubscribe_during_emit() {
        let bus = Arc::new(EventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let id_slot = Arc::new(AtomicU64::new(0));

        let bus_ref = Arc::clone(&bus);
        let slot = Arc::clone(&id_slot);
        let seen = Arc::clone(&calls);
        let id = bus.on(StoreEventKind::DataChange, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            bus_ref.off(slot.load(Ordering::SeqCst));
        });
        id_slot.store(id, Ordering::SeqCst);

        bus.emit(&StoreEvent::DataChange(vec![]));
        bus.emit(&StoreEvent::DataChange(vec![]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kind_names() {
        for kind in [
            StoreEventKind::DataChange,
            StoreEventKind::Add,
            StoreEventKind::Remove,
            StoreEventKind::Save,
        ] {
            assert_eq!(StoreEventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(StoreEventKind::DataChange.to_string(), "datachange");
        assert_eq!(StoreEventKind::parse("update"), None);
    }

    #[tokio::test]
    async fn test_save_handle_resolves() {
        let (resolver, mut handle) = SaveHandle::channel();
        assert!(handle.try_outcome().is_none());

        let summary = SaveSummary {
            deleted: vec![BusinessKey::Int(4)],
            ..Default::default()
        };
        resolver.resolve(&Ok(summary.clone()));
        assert_eq!(handle.outcome().await.unwrap(), summary);
        assert!(handle.try_outcome().is_some());
    }

    #[tokio::test]
    async fn test_dropped_resolver_is_an_error() {
        let (resolver, mut handle) = SaveHandle::channel();
        drop(resolver);
        assert!(handle.outcome().await.is_err());
    }
}
