use std::sync::{Arc, Mutex, PoisonError};

use versync_engine::{Event, EventBus, StateEvent, StateEventKind};

/// Collects every event emitted on a bus, in order.
#[derive(Clone, Default)]
pub struct EventRecorder {
    seen: Arc<Mutex<Vec<StateEvent>>>,
}

impl EventRecorder {
    pub fn attach(bus: &EventBus<StateEvent>) -> Self {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.seen);
        bus.on_any(move |event| {
            sink.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
        });
        recorder
    }

    pub fn events(&self) -> Vec<StateEvent> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn kinds(&self) -> Vec<StateEventKind> {
        self.events().iter().map(|e| e.kind()).collect()
    }

    pub fn count(&self, kind: StateEventKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    pub fn clear(&self) {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
