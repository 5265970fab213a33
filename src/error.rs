//! Error taxonomy for the promise runtime.
//!
//! All rejection reasons ultimately resolve to a [`Reason`] — a cheaply
//! cloneable handle to a [`PromiseError`]. The runtime is single-threaded
//! (see the crate's Non-goals), so `Reason` is `Rc`-based rather than
//! `Arc`-based; nothing here is `Send`.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// A rejection reason shared along every fan-out path (then-chains,
/// combinators, cancellation cascades) without re-allocating the error.
pub type Reason = Rc<PromiseError>;

/// The closed set of error kinds the runtime itself produces, plus an
/// escape hatch (`Other`) for wrapping arbitrary user errors.
#[derive(Debug, thiserror::Error)]
pub enum PromiseError {
    /// A promise was resolved with itself, directly or transitively.
    #[error("promise was resolved with itself, forming a cycle")]
    Cycle,

    /// Raised when waiting on a cancelled promise, or when a combinator's
    /// composite rejects because one of its inputs was cancelled.
    #[error("promise cancelled{}", key_suffix(.key))]
    Cancelled {
        /// The combinator input key that was cancelled, if applicable.
        key: Option<String>,
    },

    /// `any([])`, or every operand of a combinator rejected/cancelled.
    #[error("all operands rejected or were cancelled")]
    Aggregate(AggregateError),

    /// `race([])` — there is nothing to settle with.
    #[error("race() called with no inputs to settle")]
    EmptyRace,

    /// Raised only by [`crate::combinators::timeout`].
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A combinator input was not a promise / a factory did not return one.
    #[error("expected a promise{}", key_suffix(.key))]
    NotAPromise {
        /// The offending input key, if applicable.
        key: Option<String>,
    },

    /// `concurrency <= 0`, `batch_size <= 0`, or `timeout <= 0`.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A non-error value was rejected with; the value's `Debug` rendering
    /// is preserved here since the runtime doesn't know how to keep the
    /// original typed value once erased into a `Reason`.
    #[error("rejected with a non-error value: {value}")]
    RejectionWrap {
        /// The `Debug`-formatted original value.
        value: String,
    },

    /// Wraps an arbitrary user-supplied error so it can flow through the
    /// same `Reason` channel as the built-in kinds.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error>),
}

fn key_suffix(key: &Option<String>) -> String {
    match key {
        Some(k) => format!(" (key {k})"),
        None => String::new(),
    }
}

/// A keyed collection of reasons, preserving the order each key was first
/// observed in. Produced by `any` (all rejected) and by cancel-handler /
/// child-cancel error collection during [`crate::promise::Promise::cancel`].
#[derive(Debug, Clone)]
pub struct AggregateError {
    pub causes: Vec<(String, Reason)>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cause(s): ", self.causes.len())?;
        for (i, (key, reason)) in self.causes.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{key}: {reason}")?;
        }
        Ok(())
    }
}

/// Wrap a non-error value into a [`Reason`], preserving its `Debug`
/// rendering — the realization of the source spec's `reject(r)` for
/// non-error `r`.
pub fn wrap_non_error<V: fmt::Debug>(value: V) -> Reason {
    Rc::new(PromiseError::RejectionWrap {
        value: format!("{value:?}"),
    })
}

/// Combine cancel-handler / child-cancel errors collected during a single
/// `cancel()` call: none -> `Ok(())`, one -> that reason verbatim, more
/// than one -> an `Aggregate` keyed by collection order.
pub fn combine_errors(mut errors: Vec<Reason>) -> Result<(), Reason> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.pop().expect("len checked")),
        _ => Err(Rc::new(PromiseError::Aggregate(AggregateError {
            causes: errors
                .into_iter()
                .enumerate()
                .map(|(i, e)| (i.to_string(), e))
                .collect(),
        }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_non_error_preserves_debug_rendering() {
        let r = wrap_non_error(42);
        match r.as_ref() {
            PromiseError::RejectionWrap { value } => assert_eq!(value, "42"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn combine_errors_empty_is_ok() {
        assert!(combine_errors(Vec::new()).is_ok());
    }

    #[test]
    fn combine_errors_single_passes_through() {
        let reason = Rc::new(PromiseError::Cycle);
        let err = combine_errors(vec![reason.clone()]).unwrap_err();
        assert!(Rc::ptr_eq(&err, &reason));
    }

    #[test]
    fn combine_errors_multiple_aggregates() {
        let errs = vec![Rc::new(PromiseError::Cycle), Rc::new(PromiseError::Cycle)];
        let err = combine_errors(errs).unwrap_err();
        match err.as_ref() {
            PromiseError::Aggregate(agg) => assert_eq!(agg.causes.len(), 2),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
