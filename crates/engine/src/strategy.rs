use versync_core::{ConflictInfo, ConflictKind, ResolutionStrategy};

use crate::config::ResolutionConfig;

/// Rank of `source` in `priority_order`; lower is stronger. Unlisted sources
/// rank below every listed one.
pub fn source_priority(source: &str, priority_order: &[String]) -> usize {
    priority_order
        .iter()
        .position(|s| s == source)
        .unwrap_or(priority_order.len())
}

/// Pick a strategy for `conflict`. Rules are checked in order and the first
/// match wins.
pub fn determine_strategy(conflict: &ConflictInfo, config: &ResolutionConfig) -> ResolutionStrategy {
    if config.auto_resolve_simple && conflict.is_simple() {
        return ResolutionStrategy::LastWriterWins;
    }

    if conflict.can_merge && conflict.kind == ConflictKind::ConcurrentUpdate {
        return ResolutionStrategy::MergeCompatible;
    }

    let current_rank = source_priority(&conflict.current_state.modified_by, &config.priority_order);
    let attempted_rank = source_priority(&conflict.attempted_update.source, &config.priority_order);
    if current_rank != attempted_rank {
        return ResolutionStrategy::PriorityBased;
    }

    if config.enable_user_confirmation && conflict.is_complex() {
        return ResolutionStrategy::UserConfirmation;
    }

    config.default_strategy
}
