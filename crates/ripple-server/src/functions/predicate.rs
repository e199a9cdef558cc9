//! Custom invalidation predicates.
//!
//! A function may refine "a change to one of my sources invalidates me" per
//! source. Evaluation is guarded: a predicate that errors or panics counts
//! as "invalidate", so a broken rule can only cost an extra cache miss.

use std::panic::{AssertUnwindSafe, catch_unwind};

use ripple_core::Change;
use tracing::warn;

use crate::metrics;

/// Error returned by a predicate that could not decide.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct PredicateError(pub String);

impl PredicateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Decides whether a change to a source invalidates a function's results.
pub trait InvalidationPredicate: Send + Sync {
    fn evaluate(&self, change: &Change) -> Result<bool, PredicateError>;
}

impl<F> InvalidationPredicate for F
where
    F: Fn(&Change) -> Result<bool, PredicateError> + Send + Sync,
{
    fn evaluate(&self, change: &Change) -> Result<bool, PredicateError> {
        self(change)
    }
}

/// Predicate that fires only for changes touching one of the given keys.
///
/// Changes that carry no keys (bulk writes, raw statements without a
/// `WHERE id = ...`) always fire.
pub struct AffectsKeys(pub Vec<String>);

impl InvalidationPredicate for AffectsKeys {
    fn evaluate(&self, change: &Change) -> Result<bool, PredicateError> {
        if change.affected_keys.is_empty() {
            return Ok(true);
        }
        Ok(self.0.iter().any(|key| change.affects_key(key)))
    }
}

/// Evaluate a predicate, treating errors and panics as `true`.
pub(crate) fn evaluate_guarded(
    function: &str,
    predicate: &dyn InvalidationPredicate,
    change: &Change,
) -> bool {
    match catch_unwind(AssertUnwindSafe(|| predicate.evaluate(change))) {
        Ok(Ok(decision)) => decision,
        Ok(Err(e)) => {
            warn!(
                function = %function,
                source = %change.source_name,
                error = %e,
                "Invalidation predicate failed; invalidating"
            );
            metrics::record_predicate_failure(function, "error");
            true
        }
        Err(panic) => {
            let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            warn!(
                function = %function,
                source = %change.source_name,
                panic = %panic_msg,
                "Invalidation predicate panicked; invalidating"
            );
            metrics::record_predicate_failure(function, "panic");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::ChangeOperation;

    fn change(keys: &[&str]) -> Change {
        Change::new(
            "posts",
            ChangeOperation::Update,
            keys.iter().map(|k| k.to_string()).collect(),
        )
    }

    #[test]
    fn test_closure_predicate() {
        let only_deletes =
            |c: &Change| -> Result<bool, PredicateError> { Ok(c.operation == ChangeOperation::Delete) };
        assert!(!evaluate_guarded("f", &only_deletes, &change(&[])));
    }

    #[test]
    fn test_error_fails_open() {
        let failing = |_: &Change| -> Result<bool, PredicateError> {
            Err(PredicateError::new("lookup failed"))
        };
        assert!(evaluate_guarded("f", &failing, &change(&[])));
    }

    #[test]
    fn test_panic_fails_open() {
        let panicking = |_: &Change| -> Result<bool, PredicateError> { panic!("boom") };
        assert!(evaluate_guarded("f", &panicking, &change(&[])));
    }

    #[test]
    fn test_affects_keys() {
        let rule = AffectsKeys(vec!["p1".into()]);
        assert!(evaluate_guarded("f", &rule, &change(&["p1", "p2"])));
        assert!(!evaluate_guarded("f", &rule, &change(&["p3"])));
        assert!(evaluate_guarded("f", &rule, &change(&[])));
    }
}
