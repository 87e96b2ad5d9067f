use std::sync::Arc;

use versync_core::{ManualClock, Millis, UpdateContext};
use versync_engine::{EngineConfig, EngineError, MergeRegistry, StateManager};

use crate::EventRecorder;

/// Wall-clock value every `TestManager` starts at.
pub const START_MS: Millis = 1_700_000_000_000;

/// A `StateManager` driven by a manual clock, with every event recorded.
pub struct TestManager {
    pub manager: StateManager,
    pub clock: ManualClock,
    pub events: EventRecorder,
}

impl TestManager {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_merges(config, MergeRegistry::with_defaults())
    }

    pub fn with_merges(config: EngineConfig, merges: MergeRegistry) -> Result<Self, EngineError> {
        crate::init_tracing();
        let clock = ManualClock::new(START_MS);
        let manager = StateManager::with_merges(config, Arc::new(clock.clone()), merges)?;
        let events = EventRecorder::attach(manager.events());
        Ok(Self {
            manager,
            clock,
            events,
        })
    }

    pub fn now(&self) -> Millis {
        self.clock.get()
    }

    pub fn advance(&self, ms: u64) -> Millis {
        self.clock.advance(ms)
    }

    /// An update context stamped with the current manual time.
    pub fn context(&self, kind: &str, source: &str) -> UpdateContext {
        UpdateContext::new(kind, source, self.now())
    }

    /// An update context stamped `offset_ms` after the current manual time.
    pub fn context_after(&self, kind: &str, source: &str, offset_ms: u64) -> UpdateContext {
        UpdateContext::new(kind, source, self.now() + offset_ms)
    }
}
