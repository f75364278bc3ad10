//! Core types used throughout the crate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Shard identifier, in `[0, shard_count)`.
pub type ShardId = u32;

/// Bucket identifier, in `[0, num_buckets)`.
pub type BucketId = u32;

/// Bound value of a named update parameter.
pub type ParamValue = serde_json::Value;

/// A named bulk update plus its parameter bindings.
///
/// Bypasses the read-modify-write path: the persistence engine resolves
/// `query_name` to a registered operation and runs it with `params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOperationMeta {
    /// Name of the registered update operation.
    pub query_name: String,

    /// Parameter name to bound value.
    pub params: BTreeMap<String, ParamValue>,
}

impl UpdateOperationMeta {
    /// Create an operation with no bound parameters.
    pub fn new(query_name: impl Into<String>) -> Self {
        Self {
            query_name: query_name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Bind a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Look up a bound parameter.
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }
}

/// A row predicate handed to the persistence engine.
///
/// Stands in for the engine's own query language; cheap to clone.
pub struct Criteria<T> {
    description: Arc<str>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T> Criteria<T> {
    /// Build criteria from a predicate. The description shows up in logs and errors.
    pub fn new(
        description: impl Into<Arc<str>>,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Criteria matching every row.
    pub fn all() -> Self {
        Self::new("all", |_| true)
    }

    /// Test a row.
    pub fn matches(&self, row: &T) -> bool {
        (self.predicate)(row)
    }

    /// Human readable description.
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl<T> Clone for Criteria<T> {
    fn clone(&self) -> Self {
        Self {
            description: self.description.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<T> fmt::Debug for Criteria<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Criteria")
            .field("description", &self.description)
            .finish()
    }
}

/// Result of a read-modify-write update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The replacement was written.
    Updated,
    /// Nothing matched; nothing was written.
    NotFound,
    /// The updater declined to produce a replacement; nothing was written.
    Rejected,
}

impl UpdateOutcome {
    /// Whether a write happened.
    pub fn is_updated(self) -> bool {
        self == UpdateOutcome::Updated
    }
}

impl From<UpdateOutcome> for bool {
    fn from(outcome: UpdateOutcome) -> Self {
        outcome.is_updated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_operation_meta_params() {
        let meta = UpdateOperationMeta::new("bumpStatus")
            .with_param("status", "DONE")
            .with_param("limit", 10);

        assert_eq!(meta.query_name, "bumpStatus");
        assert_eq!(meta.param("status"), Some(&ParamValue::from("DONE")));
        assert_eq!(meta.param("limit"), Some(&ParamValue::from(10)));
        assert!(meta.param("missing").is_none());
    }

    #[test]
    fn test_criteria_matches() {
        let even = Criteria::<u32>::new("even", |n| n % 2 == 0);
        let copy = even.clone();

        assert!(even.matches(&4));
        assert!(!copy.matches(&3));
        assert_eq!(copy.description(), "even");
        assert!(Criteria::<u32>::all().matches(&7));
    }

    #[test]
    fn test_update_outcome_to_bool() {
        assert!(bool::from(UpdateOutcome::Updated));
        assert!(!bool::from(UpdateOutcome::NotFound));
        assert!(!UpdateOutcome::Rejected.is_updated());
    }
}
