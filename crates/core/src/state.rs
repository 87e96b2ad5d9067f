use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clock::Millis;
use crate::error::CoreError;
use crate::ids::{ConflictId, UpdateId};
use crate::value::StateValue;

/// The authoritative record for one state key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedState {
    pub version: u64,
    pub last_modified: Millis,
    pub modified_by: String,
    pub data: StateValue,
}

/// Describes one update attempt. Built fresh by the caller for every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateContext {
    pub id: UpdateId,
    /// Domain operation type, e.g. `filter` or `dateRange`.
    pub kind: String,
    /// Identity of the actor proposing the update.
    pub source: String,
    pub timestamp: Millis,
    pub expected_version: Option<u64>,
    pub force: bool,
}

impl UpdateContext {
    pub fn new(kind: impl Into<String>, source: impl Into<String>, timestamp: Millis) -> Self {
        Self {
            id: UpdateId::new(),
            kind: kind.into(),
            source: source.into(),
            timestamp,
            expected_version: None,
            force: false,
        }
    }

    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    VersionMismatch,
    ConcurrentUpdate,
    TimestampConflict,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VersionMismatch => "version_mismatch",
            Self::ConcurrentUpdate => "concurrent_update",
            Self::TimestampConflict => "timestamp_conflict",
        }
    }
}

impl FromStr for ConflictKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "version_mismatch" => Ok(Self::VersionMismatch),
            "concurrent_update" => Ok(Self::ConcurrentUpdate),
            "timestamp_conflict" => Ok(Self::TimestampConflict),
            _ => Err(CoreError::UnknownConflictKind(s.to_string())),
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected collision between an update attempt and the stored state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub id: ConflictId,
    pub kind: ConflictKind,
    /// State key the attempt targeted.
    pub key: String,
    /// Snapshot of the stored state at detection time.
    pub current_state: VersionedState,
    pub attempted_update: UpdateContext,
    /// Payload the attempted update carried.
    pub attempted_data: StateValue,
    pub conflicting_update: Option<UpdateContext>,
    pub can_merge: bool,
    /// Name of the merge strategy registered for the attempted operation type.
    pub merge_strategy: Option<String>,
    pub detected_at: Millis,
}

impl ConflictInfo {
    pub fn new(
        kind: ConflictKind,
        key: impl Into<String>,
        current_state: VersionedState,
        attempted_update: UpdateContext,
        attempted_data: StateValue,
        detected_at: Millis,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            kind,
            key: key.into(),
            current_state,
            attempted_update,
            attempted_data,
            conflicting_update: None,
            can_merge: false,
            merge_strategy: None,
            detected_at,
        }
    }

    pub fn with_conflicting(mut self, other: UpdateContext) -> Self {
        self.conflicting_update = Some(other);
        self
    }

    pub fn mergeable_with(mut self, strategy: impl Into<String>) -> Self {
        self.can_merge = true;
        self.merge_strategy = Some(strategy.into());
        self
    }

    /// A stale-read conflict with no competing in-flight update.
    pub fn is_simple(&self) -> bool {
        self.kind == ConflictKind::VersionMismatch && self.conflicting_update.is_none()
    }

    /// Two in-flight updates raced each other.
    pub fn is_complex(&self) -> bool {
        self.kind == ConflictKind::ConcurrentUpdate && self.conflicting_update.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LastWriterWins,
    FirstWriterWins,
    MergeCompatible,
    PriorityBased,
    UserConfirmation,
    Rollback,
}

impl ResolutionStrategy {
    pub const ALL: [ResolutionStrategy; 6] = [
        Self::LastWriterWins,
        Self::FirstWriterWins,
        Self::MergeCompatible,
        Self::PriorityBased,
        Self::UserConfirmation,
        Self::Rollback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastWriterWins => "last_writer_wins",
            Self::FirstWriterWins => "first_writer_wins",
            Self::MergeCompatible => "merge_compatible",
            Self::PriorityBased => "priority_based",
            Self::UserConfirmation => "user_confirmation",
            Self::Rollback => "rollback",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| CoreError::UnknownStrategy(s.to_string()))
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserChoice {
    Accept,
    Reject,
    Merge,
}

impl UserChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Merge => "merge",
        }
    }
}

impl FromStr for UserChoice {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(Self::Accept),
            "reject" => Ok(Self::Reject),
            "merge" => Ok(Self::Merge),
            _ => Err(CoreError::UnknownChoice(s.to_string())),
        }
    }
}
