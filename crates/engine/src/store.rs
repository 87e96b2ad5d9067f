use std::collections::HashMap;

use tracing::debug;
use versync_core::{Millis, StateValue, UpdateContext, VersionedState};

use crate::events::{EventBus, StateEvent};
use crate::registry::ActiveUpdateRegistry;

/// Owns the authoritative versioned record for every state key.
///
/// `apply_update` is the only way a stored record changes after it is
/// initialized; detection code reads through `get_versioned_state` and the
/// active-update registry.
pub struct VersionedStateStore {
    states: HashMap<String, VersionedState>,
    active: ActiveUpdateRegistry,
    active_ttl_ms: u64,
    events: EventBus<StateEvent>,
}

impl VersionedStateStore {
    pub fn new(active_ttl_ms: u64, events: EventBus<StateEvent>) -> Self {
        Self {
            states: HashMap::new(),
            active: ActiveUpdateRegistry::new(),
            active_ttl_ms,
            events,
        }
    }

    /// Create version 1 for `key`, replacing anything already stored.
    pub fn initialize_state(
        &mut self,
        key: &str,
        data: StateValue,
        source: &str,
        now: Millis,
    ) -> VersionedState {
        let state = VersionedState {
            version: 1,
            last_modified: now,
            modified_by: source.to_string(),
            data,
        };
        self.states.insert(key.to_string(), state.clone());
        debug!(key, source, "state initialized");
        self.events.emit(&StateEvent::StateInitialized {
            key: key.to_string(),
            state: state.clone(),
        });
        state
    }

    /// Create version 1 from a first write and mark `context` active, so a
    /// write racing it is still detected.
    pub fn initialize_from_update(
        &mut self,
        key: &str,
        data: StateValue,
        context: &UpdateContext,
        now: Millis,
    ) -> VersionedState {
        let state = self.initialize_state(key, data, &context.source, now);
        self.active
            .register(key, context, now.saturating_add(self.active_ttl_ms));
        state
    }

    pub fn get_versioned_state(&self, key: &str) -> Option<&VersionedState> {
        self.states.get(key)
    }

    /// Store `data` as the next version of `key` and mark `context` active.
    pub fn apply_update(
        &mut self,
        key: &str,
        data: StateValue,
        context: &UpdateContext,
        now: Millis,
    ) -> VersionedState {
        let version = self.states.get(key).map_or(1, |s| s.version + 1);
        let state = VersionedState {
            version,
            last_modified: now,
            modified_by: context.source.clone(),
            data,
        };
        self.states.insert(key.to_string(), state.clone());
        self.active
            .register(key, context, now.saturating_add(self.active_ttl_ms));

        debug!(key, version, source = %context.source, kind = %context.kind, "state updated");
        self.events.emit(&StateEvent::StateUpdated {
            key: key.to_string(),
            state: state.clone(),
            update_id: context.id,
        });
        state
    }

    pub fn active_updates(&self) -> &ActiveUpdateRegistry {
        &self.active
    }

    pub fn sweep_expired(&mut self, now: Millis) -> usize {
        let removed = self.active.sweep(now);
        if removed > 0 {
            debug!(removed, "swept expired active updates");
        }
        removed
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
