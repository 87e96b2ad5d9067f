use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};
use versync_core::{
    Clock, ConflictId, ConflictInfo, Millis, ResolutionStrategy, StateValue, UserChoice,
};

use crate::config::ResolutionConfig;
use crate::events::{EventBus, StateEvent};
use crate::history::BoundedHistory;
use crate::merge::MergeRegistry;
use crate::strategy::{determine_strategy, source_priority};
use crate::EngineError;

/// An in-flight resolution. At most one exists per conflict id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionContext {
    pub conflict: ConflictInfo,
    pub strategy: ResolutionStrategy,
    pub user_choice: Option<UserChoice>,
    pub timestamp: Millis,
    pub resolved_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionResult {
    pub success: bool,
    pub resolved_data: StateValue,
    pub strategy: ResolutionStrategy,
    pub conflicts: Vec<String>,
    pub warnings: Vec<String>,
    pub requires_user_action: bool,
    /// Set by `Rollback`: the value the caller should restore upstream.
    pub rollback_data: Option<StateValue>,
}

impl ResolutionResult {
    fn resolved(strategy: ResolutionStrategy, data: StateValue) -> Self {
        Self {
            success: true,
            resolved_data: data,
            strategy,
            conflicts: Vec::new(),
            warnings: Vec::new(),
            requires_user_action: false,
            rollback_data: None,
        }
    }

    fn awaiting_user(strategy: ResolutionStrategy, current: StateValue) -> Self {
        Self {
            success: false,
            requires_user_action: true,
            ..Self::resolved(strategy, current)
        }
    }

    /// Failed and waiting on a human decision.
    pub fn is_awaiting_user(&self) -> bool {
        !self.success && self.requires_user_action
    }
}

#[derive(Debug, Clone)]
pub struct ResolutionRecord {
    pub conflict_id: ConflictId,
    pub resolved_by: String,
    pub started_at: Millis,
    pub duration_ms: u64,
    pub result: ResolutionResult,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolutionStats {
    pub total_resolutions: u64,
    pub successful_resolutions: u64,
    pub pending_resolutions: usize,
    pub by_strategy: BTreeMap<ResolutionStrategy, u64>,
    pub average_resolution_time_ms: f64,
}

/// Executes resolution strategies and tracks pending and completed resolutions.
pub struct ResolutionManager {
    config: ResolutionConfig,
    merges: Arc<MergeRegistry>,
    clock: Arc<dyn Clock>,
    events: EventBus<StateEvent>,
    pending: HashMap<ConflictId, ResolutionContext>,
    history: BoundedHistory<ResolutionRecord>,
    total: u64,
    successful: u64,
    by_strategy: BTreeMap<ResolutionStrategy, u64>,
    total_duration_ms: u64,
}

impl ResolutionManager {
    pub fn new(
        config: ResolutionConfig,
        merges: Arc<MergeRegistry>,
        clock: Arc<dyn Clock>,
        events: EventBus<StateEvent>,
    ) -> Self {
        let history = BoundedHistory::new(config.history_limit);
        Self {
            config,
            merges,
            clock,
            events,
            pending: HashMap::new(),
            history,
            total: 0,
            successful: 0,
            by_strategy: BTreeMap::new(),
            total_duration_ms: 0,
        }
    }

    pub fn config(&self) -> &ResolutionConfig {
        &self.config
    }

    /// Resolve `conflict` with `strategy`, or with the selector's choice when `None`.
    ///
    /// A result that still needs a human decision leaves the context pending so
    /// that `resolve_with_user_choice` or `cancel_resolution` can settle it.
    pub fn resolve_conflict(
        &mut self,
        conflict: ConflictInfo,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<ResolutionResult, EngineError> {
        let strategy = strategy.unwrap_or_else(|| determine_strategy(&conflict, &self.config));
        let context = ResolutionContext {
            conflict,
            strategy,
            user_choice: None,
            timestamp: self.clock.now()?,
            resolved_by: "system".into(),
        };
        debug!(conflict_id = %context.conflict.id, %strategy, "resolving conflict");
        self.run(context)
    }

    /// Settle a pending resolution with a human decision.
    pub fn resolve_with_user_choice(
        &mut self,
        conflict_id: ConflictId,
        choice: UserChoice,
    ) -> Result<ResolutionResult, EngineError> {
        let mut context = self
            .pending
            .get(&conflict_id)
            .cloned()
            .ok_or_else(|| EngineError::ResolutionNotFound(conflict_id.to_string()))?;
        context.user_choice = Some(choice);
        context.resolved_by = "user".into();
        context.strategy = ResolutionStrategy::UserConfirmation;
        context.timestamp = self.clock.now()?;
        debug!(%conflict_id, choice = choice.as_str(), "applying user choice");
        self.run(context)
    }

    /// Drop a pending resolution. Returns whether one existed.
    pub fn cancel_resolution(&mut self, conflict_id: ConflictId) -> bool {
        if self.pending.remove(&conflict_id).is_none() {
            return false;
        }
        info!(%conflict_id, "resolution cancelled");
        self.events
            .emit(&StateEvent::ResolutionCancelled { conflict_id });
        true
    }

    /// Oldest first.
    pub fn pending_resolutions(&self) -> Vec<&ResolutionContext> {
        let mut pending: Vec<_> = self.pending.values().collect();
        pending.sort_by_key(|ctx| (ctx.timestamp, ctx.conflict.id));
        pending
    }

    pub fn is_pending(&self, conflict_id: &ConflictId) -> bool {
        self.pending.contains_key(conflict_id)
    }

    pub fn history(&self) -> &BoundedHistory<ResolutionRecord> {
        &self.history
    }

    pub fn stats(&self) -> ResolutionStats {
        let average_resolution_time_ms = if self.total == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total as f64
        };
        ResolutionStats {
            total_resolutions: self.total,
            successful_resolutions: self.successful,
            pending_resolutions: self.pending.len(),
            by_strategy: self.by_strategy.clone(),
            average_resolution_time_ms,
        }
    }

    fn run(&mut self, context: ResolutionContext) -> Result<ResolutionResult, EngineError> {
        let conflict_id = context.conflict.id;
        self.pending.insert(conflict_id, context.clone());

        let result = self.execute(&context);

        if result.is_awaiting_user() {
            debug!(%conflict_id, "resolution awaiting user decision");
            self.evict_oldest_pending(conflict_id);
        } else {
            self.pending.remove(&conflict_id);
        }

        let finished = self.clock.now()?;
        let duration_ms = finished.saturating_sub(context.timestamp);
        self.record(&context, &result, duration_ms);

        if result.success {
            info!(%conflict_id, strategy = %result.strategy, "conflict resolved");
            self.events.emit(&StateEvent::ConflictResolved {
                conflict_id,
                result: result.clone(),
            });
        } else {
            warn!(
                %conflict_id,
                strategy = %result.strategy,
                requires_user_action = result.requires_user_action,
                "conflict not resolved"
            );
            self.events.emit(&StateEvent::ResolutionFailed {
                conflict_id,
                result: result.clone(),
            });
        }
        Ok(result)
    }

    /// Cancel the oldest pending resolutions, other than `keep`, until the
    /// pending map fits `pending_limit`.
    fn evict_oldest_pending(&mut self, keep: ConflictId) {
        while self.pending.len() > self.config.pending_limit {
            let Some(oldest) = self
                .pending
                .values()
                .filter(|ctx| ctx.conflict.id != keep)
                .min_by_key(|ctx| (ctx.timestamp, ctx.conflict.id))
                .map(|ctx| ctx.conflict.id)
            else {
                break;
            };
            self.pending.remove(&oldest);
            warn!(conflict_id = %oldest, limit = self.config.pending_limit, "pending resolution evicted");
            self.events
                .emit(&StateEvent::ResolutionCancelled { conflict_id: oldest });
        }
    }

    fn record(&mut self, context: &ResolutionContext, result: &ResolutionResult, duration_ms: u64) {
        self.total += 1;
        if result.success {
            self.successful += 1;
        }
        *self.by_strategy.entry(result.strategy).or_insert(0) += 1;
        self.total_duration_ms += duration_ms;
        self.history.push(ResolutionRecord {
            conflict_id: context.conflict.id,
            resolved_by: context.resolved_by.clone(),
            started_at: context.timestamp,
            duration_ms,
            result: result.clone(),
        });
    }

    fn execute(&self, context: &ResolutionContext) -> ResolutionResult {
        let conflict = &context.conflict;
        let strategy = context.strategy;
        let current = &conflict.current_state.data;
        let attempted = &conflict.attempted_data;

        match strategy {
            ResolutionStrategy::LastWriterWins => ResolutionResult::resolved(strategy, attempted.clone()),
            ResolutionStrategy::FirstWriterWins => ResolutionResult::resolved(strategy, current.clone()),
            ResolutionStrategy::MergeCompatible => self.merge_or_fallback(conflict, strategy),
            ResolutionStrategy::PriorityBased => {
                let order = &self.config.priority_order;
                let current_rank = source_priority(&conflict.current_state.modified_by, order);
                let attempted_rank = source_priority(&conflict.attempted_update.source, order);
                if current_rank < attempted_rank {
                    ResolutionResult::resolved(strategy, current.clone())
                } else {
                    ResolutionResult::resolved(strategy, attempted.clone())
                }
            }
            ResolutionStrategy::UserConfirmation => match context.user_choice {
                None => ResolutionResult::awaiting_user(strategy, current.clone()),
                Some(UserChoice::Accept) => ResolutionResult::resolved(strategy, attempted.clone()),
                Some(UserChoice::Reject) => ResolutionResult::resolved(strategy, current.clone()),
                Some(UserChoice::Merge) => self.merge_or_fallback(conflict, strategy),
            },
            ResolutionStrategy::Rollback => ResolutionResult {
                rollback_data: Some(current.clone()),
                ..ResolutionResult::resolved(strategy, current.clone())
            },
        }
    }

    /// Merge both sides; an unmergeable pair falls back to the attempted side
    /// and flags the result for review, and a merge error leaves the current
    /// value in place pending a human decision.
    fn merge_or_fallback(&self, conflict: &ConflictInfo, strategy: ResolutionStrategy) -> ResolutionResult {
        let kind = &conflict.attempted_update.kind;
        match self
            .merges
            .merge(kind, &conflict.current_state.data, &conflict.attempted_data)
        {
            Ok(outcome) if outcome.is_success() => ResolutionResult {
                warnings: outcome.warnings,
                ..ResolutionResult::resolved(strategy, outcome.data)
            },
            Ok(outcome) => {
                warn!(conflict_id = %conflict.id, kind = %kind, "merge reported conflicts; using last writer");
                let mut warnings = outcome.warnings;
                warnings.push(format!(
                    "merge failed; fell back to {}",
                    ResolutionStrategy::LastWriterWins
                ));
                ResolutionResult {
                    conflicts: outcome.conflicts,
                    warnings,
                    requires_user_action: true,
                    ..ResolutionResult::resolved(strategy, conflict.attempted_data.clone())
                }
            }
            Err(e) => {
                warn!(conflict_id = %conflict.id, kind = %kind, error = %e, "merge failed");
                ResolutionResult {
                    conflicts: vec![format!("Merge failed: {e}")],
                    ..ResolutionResult::awaiting_user(strategy, conflict.current_state.data.clone())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StateEventKind;
    use crate::merge::{MergeError, MergeOutcome, MergeStrategy};
    use serde_json::json;
    use versync_core::{ConflictKind, ManualClock, UpdateContext, VersionedState};

    struct Exploding;

    impl MergeStrategy for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn merge(&self, _: &StateValue, _: &StateValue) -> Result<MergeOutcome, MergeError> {
            Err(MergeError::Failed("boom".into()))
        }
    }

    fn manager_with(config: ResolutionConfig, merges: MergeRegistry) -> (ResolutionManager, ManualClock) {
        let clock = ManualClock::new(10_000);
        let manager = ResolutionManager::new(
            config,
            Arc::new(merges),
            Arc::new(clock.clone()),
            EventBus::new(),
        );
        (manager, clock)
    }

    fn manager() -> (ResolutionManager, ManualClock) {
        manager_with(ResolutionConfig::default(), MergeRegistry::with_defaults())
    }

    fn conflict(kind: &str, current: serde_json::Value, attempted: serde_json::Value) -> ConflictInfo {
        let state = VersionedState {
            version: 2,
            last_modified: 9_900,
            modified_by: "system".into(),
            data: current.into(),
        };
        ConflictInfo::new(
            ConflictKind::ConcurrentUpdate,
            "filters",
            state,
            UpdateContext::new(kind, "user", 9_950),
            attempted.into(),
            9_950,
        )
        .with_conflicting(UpdateContext::new(kind, "system", 9_900))
    }

    #[test]
    fn last_and_first_writer() -> Result<(), Box<dyn std::error::Error>> {
        let (mut manager, _) = manager();
        let c = conflict("filter", json!({"v": 1}), json!({"v": 2}));

        let last = manager.resolve_conflict(c.clone(), Some(ResolutionStrategy::LastWriterWins))?;
        assert!(last.success);
        assert_eq!(last.resolved_data, StateValue::from(json!({"v": 2})));

        let first = manager.resolve_conflict(c, Some(ResolutionStrategy::FirstWriterWins))?;
        assert_eq!(first.resolved_data, StateValue::from(json!({"v": 1})));
        assert!(manager.pending_resolutions().is_empty());
        Ok(())
    }

    #[test]
    fn merge_error_degrades_to_user_action() -> Result<(), Box<dyn std::error::Error>> {
        let mut merges = MergeRegistry::with_defaults();
        merges.register("custom", Exploding);
        let (mut manager, _) = manager_with(ResolutionConfig::default(), merges);
        let c = conflict("custom", json!({"v": 1}), json!({"v": 2}));

        let result = manager.resolve_conflict(c.clone(), Some(ResolutionStrategy::MergeCompatible))?;
        assert!(!result.success);
        assert!(result.requires_user_action);
        assert_eq!(result.resolved_data, c.current_state.data);
        assert_eq!(result.conflicts, vec!["Merge failed: boom"]);
        assert!(manager.is_pending(&c.id));
        Ok(())
    }

    #[test]
    fn unmergeable_payloads_fall_back_to_last_writer() -> Result<(), Box<dyn std::error::Error>> {
        let (mut manager, _) = manager();
        let c = conflict("filter", json!(["a"]), json!({"tags": ["b"]}));

        let result = manager.resolve_conflict(c.clone(), Some(ResolutionStrategy::MergeCompatible))?;
        assert!(result.success);
        assert!(result.requires_user_action);
        assert_eq!(result.resolved_data, c.attempted_data);
        assert_eq!(result.conflicts.len(), 1);
        assert!(!manager.is_pending(&c.id));
        Ok(())
    }

    #[test]
    fn rollback_carries_current_data() -> Result<(), Box<dyn std::error::Error>> {
        let (mut manager, _) = manager();
        let c = conflict("filter", json!({"v": 1}), json!({"v": 2}));
        let result = manager.resolve_conflict(c.clone(), Some(ResolutionStrategy::Rollback))?;
        assert_eq!(result.resolved_data, c.current_state.data);
        assert_eq!(result.rollback_data, Some(c.current_state.data));
        Ok(())
    }

    #[test]
    fn user_confirmation_waits_then_accepts() -> Result<(), Box<dyn std::error::Error>> {
        let (mut manager, _) = manager();
        let c = conflict("property", json!({"id": "p1"}), json!({"id": "p2"}));

        let waiting = manager.resolve_conflict(c.clone(), Some(ResolutionStrategy::UserConfirmation))?;
        assert!(!waiting.success);
        assert!(waiting.requires_user_action);
        assert_eq!(manager.pending_resolutions().len(), 1);

        let accepted = manager.resolve_with_user_choice(c.id, UserChoice::Accept)?;
        assert!(accepted.success);
        assert_eq!(accepted.resolved_data, c.attempted_data);
        assert!(manager.pending_resolutions().is_empty());

        let record = manager.history().latest().unwrap();
        assert_eq!(record.resolved_by, "user");
        Ok(())
    }

    #[test]
    fn user_choice_without_pending_is_not_found() {
        let (mut manager, _) = manager();
        let result = manager.resolve_with_user_choice(ConflictId::new(), UserChoice::Reject);
        assert!(matches!(result, Err(EngineError::ResolutionNotFound(_))));
    }

    #[test]
    fn cancel_removes_pending_and_emits() -> Result<(), Box<dyn std::error::Error>> {
        let (mut manager, _) = manager();
        let (_, rx) = manager
            .events
            .subscribe_channel(Some(StateEventKind::ResolutionCancelled));
        let c = conflict("property", json!(1), json!(2));
        manager.resolve_conflict(c.clone(), Some(ResolutionStrategy::UserConfirmation))?;

        assert!(manager.cancel_resolution(c.id));
        assert!(!manager.cancel_resolution(c.id));
        assert!(matches!(
            rx.try_recv(),
            Ok(StateEvent::ResolutionCancelled { conflict_id }) if conflict_id == c.id
        ));
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn stats_track_strategies_and_timing() -> Result<(), Box<dyn std::error::Error>> {
        let (mut manager, _) = manager();
        let c = conflict("filter", json!({"v": 1}), json!({"v": 2}));
        manager.resolve_conflict(c.clone(), Some(ResolutionStrategy::LastWriterWins))?;
        manager.resolve_conflict(c.clone(), Some(ResolutionStrategy::LastWriterWins))?;
        manager.resolve_conflict(c, Some(ResolutionStrategy::UserConfirmation))?;

        let stats = manager.stats();
        assert_eq!(stats.total_resolutions, 3);
        assert_eq!(stats.successful_resolutions, 2);
        assert_eq!(stats.pending_resolutions, 1);
        assert_eq!(stats.by_strategy.get(&ResolutionStrategy::LastWriterWins), Some(&2));
        assert_eq!(stats.by_strategy.get(&ResolutionStrategy::UserConfirmation), Some(&1));
        assert_eq!(stats.average_resolution_time_ms, 0.0);
        Ok(())
    }

    #[test]
    fn history_is_bounded() -> Result<(), Box<dyn std::error::Error>> {
        let (mut manager, _) = manager();
        for _ in 0..150 {
            let c = conflict("filter", json!(1), json!(2));
            manager.resolve_conflict(c, Some(ResolutionStrategy::FirstWriterWins))?;
        }
        assert_eq!(manager.history().len(), 100);
        assert_eq!(manager.stats().total_resolutions, 150);
        Ok(())
    }

    #[test]
    fn abandoned_pending_is_capped() -> Result<(), Box<dyn std::error::Error>> {
        let config = ResolutionConfig {
            pending_limit: 2,
            ..ResolutionConfig::default()
        };
        let clock = ManualClock::new(10_000);
        let events: EventBus<StateEvent> = EventBus::new();
        let (_, cancelled) = events.subscribe_channel(Some(StateEventKind::ResolutionCancelled));
        let mut manager = ResolutionManager::new(
            config,
            Arc::new(MergeRegistry::with_defaults()),
            Arc::new(clock.clone()),
            events,
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            clock.advance(10);
            let c = conflict("filter", json!(1), json!(2));
            ids.push(c.id);
            manager.resolve_conflict(c, Some(ResolutionStrategy::UserConfirmation))?;
        }

        assert_eq!(manager.pending_resolutions().len(), 2);
        assert!(!manager.is_pending(&ids[0]));
        assert!(manager.is_pending(&ids[1]));
        assert!(manager.is_pending(&ids[2]));
        assert!(matches!(
            cancelled.try_recv(),
            Ok(StateEvent::ResolutionCancelled { conflict_id }) if conflict_id == ids[0]
        ));
        Ok(())
    }
}
