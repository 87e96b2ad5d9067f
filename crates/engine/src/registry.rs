use std::collections::HashMap;

use versync_core::{Millis, UpdateContext, UpdateId};

use crate::config::DetectionConfig;

#[derive(Debug, Clone)]
pub struct ActiveUpdate {
    pub key: String,
    pub context: UpdateContext,
    pub expires_at: Millis,
}

/// Short-lived record of recently applied updates, used only to spot two
/// attempts that raced each other. Entries are swept explicitly by the caller.
#[derive(Debug, Default)]
pub struct ActiveUpdateRegistry {
    entries: HashMap<UpdateId, ActiveUpdate>,
}

impl ActiveUpdateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: &str, context: &UpdateContext, expires_at: Millis) {
        self.entries.insert(
            context.id,
            ActiveUpdate {
                key: key.to_string(),
                context: context.clone(),
                expires_at,
            },
        );
    }

    /// Drop every entry whose expiry is at or before `now`. Returns the number removed.
    pub fn sweep(&mut self, now: Millis) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &UpdateId) -> bool {
        self.entries.contains_key(id)
    }

    /// Find another live update on `key` that raced `context`: its timestamp is
    /// within the concurrency window of `context.timestamp`, and both timestamps
    /// are within the recency window of `last_modified`. The closest match wins.
    pub fn find_concurrent(
        &self,
        key: &str,
        context: &UpdateContext,
        last_modified: Millis,
        config: &DetectionConfig,
    ) -> Option<&UpdateContext> {
        if context.timestamp.abs_diff(last_modified) > config.recency_window_ms {
            return None;
        }

        self.entries
            .values()
            .filter(|entry| entry.key == key && entry.context.id != context.id)
            .map(|entry| &entry.context)
            .filter(|other| {
                other.timestamp.abs_diff(context.timestamp) <= config.concurrency_window_ms
                    && other.timestamp.abs_diff(last_modified) <= config.recency_window_ms
            })
            .min_by_key(|other| (other.timestamp.abs_diff(context.timestamp), other.id))
    }

    /// Whether any unexpired update on `key` has a timestamp within `window_ms` of `now`.
    pub fn has_recent(&self, key: &str, now: Millis, window_ms: u64) -> bool {
        self.entries.values().any(|entry| {
            entry.key == key
                && entry.expires_at > now
                && entry.context.timestamp.abs_diff(now) <= window_ms
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(source: &str, timestamp: Millis) -> UpdateContext {
        UpdateContext::new("filter", source, timestamp)
    }

    #[test]
    fn sweep_removes_expired_only() {
        let mut registry = ActiveUpdateRegistry::new();
        let early = ctx("user", 0);
        let late = ctx("sync", 0);
        registry.register("filters", &early, 5_000);
        registry.register("filters", &late, 6_000);

        assert_eq!(registry.sweep(4_999), 0);
        assert_eq!(registry.sweep(5_000), 1);
        assert!(!registry.contains(&early.id));
        assert!(registry.contains(&late.id));
    }

    #[test]
    fn finds_update_inside_both_windows() {
        let config = DetectionConfig::default();
        let mut registry = ActiveUpdateRegistry::new();
        let first = ctx("user", 10_000);
        registry.register("filters", &first, 15_000);

        let second = ctx("sync", 10_100);
        let found = registry.find_concurrent("filters", &second, 10_000, &config);
        assert_eq!(found.map(|c| c.id), Some(first.id));

        // Different key never matches
        assert!(registry.find_concurrent("dates", &second, 10_000, &config).is_none());

        // Itself never matches
        assert!(registry.find_concurrent("filters", &first, 10_000, &config).is_none());
    }

    #[test]
    fn ignores_updates_outside_windows() {
        let config = DetectionConfig::default();
        let mut registry = ActiveUpdateRegistry::new();
        registry.register("filters", &ctx("user", 10_000), 15_000);

        // 600ms apart: outside the 500ms concurrency window
        let apart = ctx("sync", 10_600);
        assert!(registry.find_concurrent("filters", &apart, 10_000, &config).is_none());

        // Close to each other but far from the last write
        let stale = ctx("sync", 10_100);
        assert!(registry.find_concurrent("filters", &stale, 12_000, &config).is_none());
    }

    #[test]
    fn has_recent_respects_window_and_expiry() {
        let mut registry = ActiveUpdateRegistry::new();
        registry.register("filters", &ctx("user", 1_000), 6_000);

        assert!(registry.has_recent("filters", 1_800, 1_000));
        assert!(!registry.has_recent("filters", 2_500, 1_000));
        assert!(!registry.has_recent("other", 1_800, 1_000));
        assert!(!registry.has_recent("filters", 6_000, 10_000));
    }
}
