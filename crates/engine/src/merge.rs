//! Type-keyed payload reconciliation.
//!
//! A [`MergeRegistry`] maps an operation type (the `kind` of an
//! [`UpdateContext`](versync_core::UpdateContext)) to the [`MergeStrategy`]
//! able to combine two payloads of that type. Registration is what makes a
//! type mergeable; unregistered types fall back to [`ShallowMerge`] only when
//! a caller asks for a merge explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use versync_core::StateValue;

pub const FILTER_KIND: &str = "filter";
pub const DATE_RANGE_KIND: &str = "dateRange";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    pub data: StateValue,
    /// Non-empty means the merge failed and `data` must not be used.
    pub conflicts: Vec<String>,
    pub warnings: Vec<String>,
}

impl MergeOutcome {
    pub fn merged(data: StateValue) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.conflicts.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("incompatible payloads: {0}")]
    Incompatible(String),

    #[error("{0}")]
    Failed(String),
}

pub trait MergeStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Combine `incoming` into `current`.
    fn merge(&self, current: &StateValue, incoming: &StateValue) -> Result<MergeOutcome, MergeError>;
}

/// Unions list fields and lets the incoming side win scalar fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterMerge;

impl MergeStrategy for FilterMerge {
    fn name(&self) -> &str {
        "filter_union"
    }

    fn merge(&self, current: &StateValue, incoming: &StateValue) -> Result<MergeOutcome, MergeError> {
        let (Some(current_map), Some(incoming_map)) = (current.as_map(), incoming.as_map()) else {
            return Ok(MergeOutcome {
                data: current.clone(),
                conflicts: vec![format!(
                    "filter payloads must be maps, got {} and {}",
                    current.type_name(),
                    incoming.type_name()
                )],
                warnings: Vec::new(),
            });
        };

        let mut merged = current_map.clone();
        let mut warnings = Vec::new();

        for (field, theirs) in incoming_map {
            match (current_map.get(field), theirs) {
                (Some(StateValue::List(ours)), StateValue::List(incoming_items)) => {
                    if ours != incoming_items {
                        warnings.push(format!("merged list field '{field}' as a union"));
                    }
                    let union = union_preserving_order(ours, incoming_items);
                    merged.insert(field.clone(), StateValue::List(union));
                }
                (Some(ours), theirs) if ours != theirs => {
                    // Field-level last-write-wins for everything that is not a list.
                    warnings.push(format!("field '{field}' differed; kept incoming value"));
                    merged.insert(field.clone(), theirs.clone());
                }
                (Some(_), _) => {}
                (None, theirs) => {
                    merged.insert(field.clone(), theirs.clone());
                }
            }
        }

        Ok(MergeOutcome {
            data: StateValue::Map(merged),
            conflicts: Vec::new(),
            warnings,
        })
    }
}

/// Items of `ours` followed by items of `theirs` not already present,
/// without duplicates on either side.
fn union_preserving_order(ours: &[StateValue], theirs: &[StateValue]) -> Vec<StateValue> {
    let mut union: Vec<StateValue> = Vec::with_capacity(ours.len() + theirs.len());
    for item in ours.iter().chain(theirs) {
        if !union.contains(item) {
            union.push(item.clone());
        }
    }
    union
}

/// Date ranges cannot be combined meaningfully; the newest range wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateRangeMerge;

impl MergeStrategy for DateRangeMerge {
    fn name(&self) -> &str {
        "date_range_latest"
    }

    fn merge(&self, _current: &StateValue, incoming: &StateValue) -> Result<MergeOutcome, MergeError> {
        Ok(MergeOutcome {
            data: incoming.clone(),
            conflicts: Vec::new(),
            warnings: vec!["date ranges cannot be merged; used most recent range".into()],
        })
    }
}

/// Shallow map merge where incoming keys overwrite. Non-map payloads are
/// replaced by the incoming value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShallowMerge;

impl MergeStrategy for ShallowMerge {
    fn name(&self) -> &str {
        "shallow"
    }

    fn merge(&self, current: &StateValue, incoming: &StateValue) -> Result<MergeOutcome, MergeError> {
        let data = match (current, incoming) {
            (StateValue::Map(ours), StateValue::Map(theirs)) => {
                let mut merged = ours.clone();
                merged.extend(theirs.iter().map(|(k, v)| (k.clone(), v.clone())));
                StateValue::Map(merged)
            }
            _ => incoming.clone(),
        };
        Ok(MergeOutcome {
            data,
            conflicts: Vec::new(),
            warnings: vec!["applied shallow merge; incoming fields overwrite current".into()],
        })
    }
}

pub struct MergeRegistry {
    strategies: HashMap<String, Arc<dyn MergeStrategy>>,
    fallback: Arc<dyn MergeStrategy>,
}

impl Default for MergeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl MergeRegistry {
    /// A registry with no mergeable types.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
            fallback: Arc::new(ShallowMerge),
        }
    }

    /// `filter` and `dateRange` registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(FILTER_KIND, FilterMerge);
        registry.register(DATE_RANGE_KIND, DateRangeMerge);
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, strategy: impl MergeStrategy + 'static) {
        self.strategies.insert(kind.into(), Arc::new(strategy));
    }

    pub fn is_mergeable(&self, kind: &str) -> bool {
        self.strategies.contains_key(kind)
    }

    pub fn get(&self, kind: &str) -> Option<&dyn MergeStrategy> {
        self.strategies.get(kind).map(|s| s.as_ref())
    }

    /// The registered strategy for `kind`, or the shallow fallback.
    pub fn strategy_for(&self, kind: &str) -> &dyn MergeStrategy {
        self.get(kind).unwrap_or(self.fallback.as_ref())
    }

    pub fn merge(
        &self,
        kind: &str,
        current: &StateValue,
        incoming: &StateValue,
    ) -> Result<MergeOutcome, MergeError> {
        self.strategy_for(kind).merge(current, incoming)
    }
}
