use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use versync_core::{ConflictId, ConflictInfo, SubscriptionId, UpdateId, VersionedState};

use crate::resolution::ResolutionResult;

/// An event type that can be filtered by kind.
pub trait Event: Clone + Send + 'static {
    type Kind: Copy + Eq + Send + 'static;

    fn kind(&self) -> Self::Kind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEventKind {
    StateInitialized,
    StateUpdated,
    VersionConflict,
    ConcurrentConflict,
    ConflictsCleared,
    ConflictResolved,
    ResolutionFailed,
    ResolutionCancelled,
}

#[derive(Debug, Clone)]
pub enum StateEvent {
    StateInitialized {
        key: String,
        state: VersionedState,
    },
    StateUpdated {
        key: String,
        state: VersionedState,
        update_id: UpdateId,
    },
    VersionConflict(ConflictInfo),
    ConcurrentConflict(ConflictInfo),
    ConflictsCleared {
        cleared: usize,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        result: ResolutionResult,
    },
    ResolutionFailed {
        conflict_id: ConflictId,
        result: ResolutionResult,
    },
    ResolutionCancelled {
        conflict_id: ConflictId,
    },
}

impl Event for StateEvent {
    type Kind = StateEventKind;

    fn kind(&self) -> StateEventKind {
        match self {
            Self::StateInitialized { .. } => StateEventKind::StateInitialized,
            Self::StateUpdated { .. } => StateEventKind::StateUpdated,
            Self::VersionConflict(_) => StateEventKind::VersionConflict,
            Self::ConcurrentConflict(_) => StateEventKind::ConcurrentConflict,
            Self::ConflictsCleared { .. } => StateEventKind::ConflictsCleared,
            Self::ConflictResolved { .. } => StateEventKind::ConflictResolved,
            Self::ResolutionFailed { .. } => StateEventKind::ResolutionFailed,
            Self::ResolutionCancelled { .. } => StateEventKind::ResolutionCancelled,
        }
    }
}

type Callback<E> = Box<dyn Fn(&E) + Send>;

struct Subscriber<E: Event> {
    id: SubscriptionId,
    /// `None` receives every event.
    kind: Option<E::Kind>,
    callback: Callback<E>,
}

/// Synchronous observer list. Clones share the same subscribers.
///
/// Callbacks run on the emitting thread while the subscriber list is locked,
/// so a callback must not subscribe or unsubscribe on the same bus.
pub struct EventBus<E: Event> {
    subscribers: Arc<Mutex<Vec<Subscriber<E>>>>,
}

impl<E: Event> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber<E>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, kind: Option<E::Kind>, callback: Callback<E>) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.lock().push(Subscriber { id, kind, callback });
        id
    }

    pub fn on(&self, kind: E::Kind, callback: impl Fn(&E) + Send + 'static) -> SubscriptionId {
        self.add(Some(kind), Box::new(callback))
    }

    pub fn on_any(&self, callback: impl Fn(&E) + Send + 'static) -> SubscriptionId {
        self.add(None, Box::new(callback))
    }

    /// Returns whether a subscription was removed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver matching events to a channel instead of a callback. The
    /// subscription stays registered until `off` is called; sends to a dropped
    /// receiver are ignored.
    pub fn subscribe_channel(&self, kind: Option<E::Kind>) -> (SubscriptionId, Receiver<E>) {
        let (tx, rx) = mpsc::channel();
        let id = self.add(
            kind,
            Box::new(move |event: &E| {
                let _ = tx.send(event.clone());
            }),
        );
        (id, rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    pub fn emit(&self, event: &E) {
        let kind = event.kind();
        for subscriber in self.lock().iter() {
            if subscriber.kind.is_none_or(|k| k == kind) {
                (subscriber.callback)(event);
            }
        }
    }
}
