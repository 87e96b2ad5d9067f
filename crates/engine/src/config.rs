use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use versync_core::ResolutionStrategy;

use crate::EngineError;

/// Full engine configuration. Every section falls back to its defaults when
/// omitted from a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// When false, updates bypass conflict detection and go through the
    /// sequential update queue instead.
    pub enable_versioning: bool,
    pub detection: DetectionConfig,
    pub resolution: ResolutionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_versioning: true,
            detection: DetectionConfig::default(),
            resolution: ResolutionConfig::default(),
        }
    }
}

/// Timing heuristics for concurrent-update detection. These are tuning knobs,
/// not guarantees that every race is caught.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Max distance between two attempts' timestamps for them to count as racing.
    pub concurrency_window_ms: u64,
    /// Max distance between an attempt's timestamp and the state's last write.
    pub recency_window_ms: u64,
    /// How long an applied update stays in the active-updates registry.
    pub active_update_ttl_ms: u64,
    pub history_limit: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            concurrency_window_ms: 500,
            recency_window_ms: 1_000,
            active_update_ttl_ms: 5_000,
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub auto_resolve_simple: bool,
    pub enable_user_confirmation: bool,
    /// Highest-priority source first. Unlisted sources rank below all listed ones.
    pub priority_order: Vec<String>,
    pub default_strategy: ResolutionStrategy,
    pub history_limit: usize,
    /// Max resolutions left waiting on a user choice. The oldest is cancelled
    /// when a new one would exceed it.
    pub pending_limit: usize,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            auto_resolve_simple: true,
            enable_user_confirmation: true,
            priority_order: vec!["user".into(), "system".into(), "sync".into()],
            default_strategy: ResolutionStrategy::LastWriterWins,
            history_limit: 100,
            pending_limit: 100,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let d = &self.detection;
        if d.concurrency_window_ms == 0 || d.recency_window_ms == 0 {
            return Err(EngineError::Config("detection windows must be non-zero".into()));
        }
        if d.concurrency_window_ms > d.recency_window_ms {
            return Err(EngineError::Config(format!(
                "concurrency_window_ms ({}) exceeds recency_window_ms ({})",
                d.concurrency_window_ms, d.recency_window_ms
            )));
        }
        if d.active_update_ttl_ms == 0 {
            return Err(EngineError::Config("active_update_ttl_ms must be non-zero".into()));
        }
        if d.history_limit == 0 || self.resolution.history_limit == 0 {
            return Err(EngineError::Config("history limits must be non-zero".into()));
        }
        if self.resolution.pending_limit == 0 {
            return Err(EngineError::Config("pending_limit must be non-zero".into()));
        }

        let mut seen = HashSet::new();
        for source in &self.resolution.priority_order {
            if !seen.insert(source.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate source in priority_order: {source}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detection.concurrency_window_ms, 500);
        assert_eq!(config.detection.recency_window_ms, 1_000);
        assert_eq!(config.detection.active_update_ttl_ms, 5_000);
        assert_eq!(config.resolution.default_strategy, ResolutionStrategy::LastWriterWins);
        assert_eq!(config.resolution.pending_limit, 100);
    }

    #[test]
    fn partial_toml_keeps_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let config = EngineConfig::from_toml_str(
            r#"
            [detection]
            concurrency_window_ms = 250

            [resolution]
            priority_order = ["user", "sync"]
            default_strategy = "first_writer_wins"
            "#,
        )?;

        assert!(config.enable_versioning);
        assert_eq!(config.detection.concurrency_window_ms, 250);
        assert_eq!(config.detection.recency_window_ms, 1_000);
        assert_eq!(config.resolution.priority_order, vec!["user", "sync"]);
        assert_eq!(config.resolution.default_strategy, ResolutionStrategy::FirstWriterWins);
        assert!(config.resolution.auto_resolve_simple);
        Ok(())
    }

    #[test]
    fn unknown_strategy_name_fails_to_parse() {
        let result = EngineConfig::from_toml_str(
            r#"
            [resolution]
            default_strategy = "coin_flip"
            "#,
        );
        assert!(matches!(result, Err(EngineError::ConfigParse(_))));
    }

    #[test]
    fn rejects_inverted_windows() {
        let mut config = EngineConfig::default();
        config.detection.concurrency_window_ms = 2_000;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn rejects_zero_pending_limit() {
        let mut config = EngineConfig::default();
        config.resolution.pending_limit = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn rejects_duplicate_priorities() {
        let mut config = EngineConfig::default();
        config.resolution.priority_order = vec!["user".into(), "user".into()];
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn loads_from_file() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "enable_versioning = false")?;
        writeln!(file, "[detection]")?;
        writeln!(file, "active_update_ttl_ms = 10000")?;

        let config = EngineConfig::load_from_file(file.path())?;
        assert!(!config.enable_versioning);
        assert_eq!(config.detection.active_update_ttl_ms, 10_000);
        Ok(())
    }
}
