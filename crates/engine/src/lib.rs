pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod merge;
pub mod queue;
pub mod registry;
pub mod resolution;
pub mod store;
pub mod strategy;

pub use config::{DetectionConfig, EngineConfig, ResolutionConfig};
pub use error::EngineError;
pub use events::{Event, EventBus, StateEvent, StateEventKind};
pub use history::BoundedHistory;
pub use merge::{MergeError, MergeOutcome, MergeRegistry, MergeStrategy};
pub use queue::{
    JobOutcome, QueueEvent, QueueEventKind, QueueStats, QueuedUpdate, UpdatePriority, UpdateQueue,
};
pub use resolution::{
    ResolutionContext, ResolutionManager, ResolutionRecord, ResolutionResult, ResolutionStats,
};
pub use store::VersionedStateStore;
pub use strategy::{determine_strategy, source_priority};

use std::convert::Infallible;
use std::sync::Arc;

use tracing::{debug, warn};
use versync_core::{
    Clock, ConflictId, ConflictInfo, ConflictKind, ResolutionStrategy, StateValue, SystemClock,
    UpdateContext, UpdateId, UserChoice, VersionedState,
};

/// Source recorded on states written by `apply_resolution`.
pub const RESOLUTION_SOURCE: &str = "conflict_resolution";

/// Result of `StateManager::update_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied(VersionedState),
    /// A concurrent update was merged into the stored value before applying.
    Merged {
        state: VersionedState,
        warnings: Vec<String>,
    },
    Conflict(ConflictInfo),
    /// Versioning is disabled; the update waits in the queue.
    Queued(UpdateId),
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Conflict(_))
    }

    pub fn state(&self) -> Option<&VersionedState> {
        match self {
            Self::Applied(state) | Self::Merged { state, .. } => Some(state),
            _ => None,
        }
    }

    pub fn conflict(&self) -> Option<&ConflictInfo> {
        match self {
            Self::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}

/// Optimistic-concurrency front door for shared state.
///
/// Owns the versioned store, the conflict history, the resolution manager and
/// the fallback queue. Construct one per tenant or test and pass it by
/// reference to whatever needs to read or write shared state.
pub struct StateManager {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: VersionedStateStore,
    merges: Arc<MergeRegistry>,
    resolver: ResolutionManager,
    conflicts: BoundedHistory<ConflictInfo>,
    queue: UpdateQueue,
    events: EventBus<StateEvent>,
}

impl StateManager {
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        Self::with_merges(config, clock, MergeRegistry::with_defaults())
    }

    /// A manager with default config on the system clock.
    pub fn with_defaults() -> Result<Self, EngineError> {
        Self::new(EngineConfig::default(), Arc::new(SystemClock))
    }

    pub fn with_merges(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        merges: MergeRegistry,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let events = EventBus::new();
        let merges = Arc::new(merges);
        let store = VersionedStateStore::new(config.detection.active_update_ttl_ms, events.clone());
        let resolver = ResolutionManager::new(
            config.resolution.clone(),
            Arc::clone(&merges),
            Arc::clone(&clock),
            events.clone(),
        );
        Ok(Self {
            conflicts: BoundedHistory::new(config.detection.history_limit),
            config,
            clock,
            store,
            merges,
            resolver,
            queue: UpdateQueue::new(),
            events,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<StateEvent> {
        &self.events
    }

    pub fn store(&self) -> &VersionedStateStore {
        &self.store
    }

    pub fn merges(&self) -> &MergeRegistry {
        &self.merges
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn initialize_state(
        &mut self,
        key: &str,
        data: StateValue,
        source: &str,
    ) -> Result<VersionedState, EngineError> {
        let now = self.clock.now()?;
        Ok(self.store.initialize_state(key, data, source, now))
    }

    pub fn get_versioned_state(&self, key: &str) -> Option<&VersionedState> {
        self.store.get_versioned_state(key)
    }

    /// Propose `data` as the next value of `key`.
    ///
    /// Collisions are returned as `UpdateOutcome::Conflict`, not as errors.
    pub fn update_state(
        &mut self,
        key: &str,
        data: StateValue,
        context: UpdateContext,
    ) -> Result<UpdateOutcome, EngineError> {
        if !self.config.enable_versioning {
            let id = self.queue.enqueue(QueuedUpdate::new(
                key,
                context.kind,
                context.source,
                data,
            ));
            return Ok(UpdateOutcome::Queued(id));
        }

        let now = self.clock.now()?;
        self.store.sweep_expired(now);

        // First writer never conflicts, but a write racing it must still see it
        let Some(current) = self.store.get_versioned_state(key).cloned() else {
            let state = self.store.initialize_from_update(key, data, &context, now);
            return Ok(UpdateOutcome::Applied(state));
        };

        if let Some(expected) = context.expected_version
            && expected != current.version
        {
            if !context.force {
                let conflict = ConflictInfo::new(
                    ConflictKind::VersionMismatch,
                    key,
                    current,
                    context,
                    data,
                    now,
                );
                warn!(
                    key,
                    expected,
                    actual = conflict.current_state.version,
                    source = %conflict.attempted_update.source,
                    "version mismatch"
                );
                self.record_conflict(conflict.clone());
                self.events.emit(&StateEvent::VersionConflict(conflict.clone()));
                return Ok(UpdateOutcome::Conflict(conflict));
            }
            debug!(key, expected, actual = current.version, "forcing past version mismatch");
        }

        let racing = self
            .store
            .active_updates()
            .find_concurrent(key, &context, current.last_modified, &self.config.detection)
            .cloned();

        if let Some(other) = racing {
            let mut conflict = ConflictInfo::new(
                ConflictKind::ConcurrentUpdate,
                key,
                current.clone(),
                context.clone(),
                data.clone(),
                now,
            )
            .with_conflicting(other.clone());
            if other.kind == context.kind
                && other.source != context.source
                && let Some(strategy) = self.merges.get(&context.kind)
            {
                conflict = conflict.mergeable_with(strategy.name());
            }

            if conflict.can_merge {
                match self.merges.merge(&context.kind, &current.data, &data) {
                    Ok(outcome) if outcome.is_success() => {
                        debug!(key, kind = %context.kind, "merged concurrent update");
                        let state = self.store.apply_update(key, outcome.data, &context, now);
                        return Ok(UpdateOutcome::Merged {
                            state,
                            warnings: outcome.warnings,
                        });
                    }
                    Ok(outcome) => {
                        warn!(key, conflicts = ?outcome.conflicts, "concurrent update could not be merged");
                    }
                    Err(e) => {
                        warn!(key, error = %e, "merge of concurrent update failed");
                    }
                }
            }

            if !context.force {
                warn!(
                    key,
                    source = %context.source,
                    other_source = %other.source,
                    can_merge = conflict.can_merge,
                    "concurrent update"
                );
                self.record_conflict(conflict.clone());
                self.events.emit(&StateEvent::ConcurrentConflict(conflict.clone()));
                return Ok(UpdateOutcome::Conflict(conflict));
            }
        }

        let state = self.store.apply_update(key, data, &context, now);
        Ok(UpdateOutcome::Applied(state))
    }

    /// Apply `data` without any conflict checks.
    pub fn force_update(
        &mut self,
        key: &str,
        data: StateValue,
        context: UpdateContext,
    ) -> Result<VersionedState, EngineError> {
        let now = self.clock.now()?;
        self.store.sweep_expired(now);
        let context = context.forced();
        Ok(self.store.apply_update(key, data, &context, now))
    }

    /// Whether an update right now would pass both the version check and the
    /// concurrency window.
    pub fn can_update(&self, key: &str, expected_version: Option<u64>) -> Result<bool, EngineError> {
        if let Some(expected) = expected_version
            && let Some(current) = self.store.get_versioned_state(key)
            && current.version != expected
        {
            return Ok(false);
        }
        let now = self.clock.now()?;
        Ok(!self.store.active_updates().has_recent(
            key,
            now,
            self.config.detection.recency_window_ms,
        ))
    }

    // ========================================================================
    // Conflict history
    // ========================================================================

    fn record_conflict(&mut self, conflict: ConflictInfo) {
        self.conflicts.push(conflict);
    }

    pub fn conflict_history(&self) -> &BoundedHistory<ConflictInfo> {
        &self.conflicts
    }

    pub fn clear_conflicts(&mut self) -> usize {
        let cleared = self.conflicts.clear();
        debug!(cleared, "conflict history cleared");
        self.events.emit(&StateEvent::ConflictsCleared { cleared });
        cleared
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    pub fn resolve_conflict(
        &mut self,
        conflict: ConflictInfo,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<ResolutionResult, EngineError> {
        self.resolver.resolve_conflict(conflict, strategy)
    }

    pub fn resolve_with_user_choice(
        &mut self,
        conflict_id: ConflictId,
        choice: UserChoice,
    ) -> Result<ResolutionResult, EngineError> {
        self.resolver.resolve_with_user_choice(conflict_id, choice)
    }

    pub fn cancel_resolution(&mut self, conflict_id: ConflictId) -> bool {
        self.resolver.cancel_resolution(conflict_id)
    }

    pub fn pending_resolutions(&self) -> Vec<&ResolutionContext> {
        self.resolver.pending_resolutions()
    }

    pub fn stats(&self) -> ResolutionStats {
        self.resolver.stats()
    }

    pub fn resolution_history(&self) -> &BoundedHistory<ResolutionRecord> {
        self.resolver.history()
    }

    /// Write a successful resolution back to the store as a forced update.
    /// Returns `None` when the result did not resolve anything.
    pub fn apply_resolution(
        &mut self,
        conflict: &ConflictInfo,
        result: &ResolutionResult,
    ) -> Result<Option<VersionedState>, EngineError> {
        if !result.success {
            return Ok(None);
        }
        let now = self.clock.now()?;
        let context = UpdateContext::new(conflict.attempted_update.kind.clone(), RESOLUTION_SOURCE, now);
        let state = self.force_update(&conflict.key, result.resolved_data.clone(), context)?;
        Ok(Some(state))
    }

    // ========================================================================
    // Unversioned fallback queue
    // ========================================================================

    pub fn enqueue_update(&mut self, update: QueuedUpdate) -> UpdateId {
        self.queue.enqueue(update)
    }

    /// Apply queued updates in priority order until the queue is empty or paused.
    pub fn process_queue(&mut self) -> Result<Vec<JobOutcome>, EngineError> {
        let now = self.clock.now()?;
        let store = &mut self.store;
        Ok(self.queue.drain(|update| {
            let context = UpdateContext::new(update.kind.clone(), update.source.clone(), now);
            store.apply_update(&update.key, update.payload.clone(), &context, now);
            Ok::<(), Infallible>(())
        }))
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut UpdateQueue {
        &mut self.queue
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }
}
