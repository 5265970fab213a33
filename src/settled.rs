//! [`SettledResult`] — the outcome recorded for each input of
//! [`crate::combinators::all_settled`] and [`crate::concurrency::concurrent_settled`].

use crate::error::{PromiseError, Reason};
use std::rc::Rc;

/// A promise's terminal outcome, reified as a value rather than a
/// `Result` so a settled-style combinator can report `Cancelled` as its
/// own case instead of forcing it through `Rejected`.
#[derive(Debug, Clone)]
pub enum SettledResult<T> {
    Fulfilled(T),
    Rejected(Reason),
    Cancelled,
}

impl<T> SettledResult<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Collapse back into a `Result`, mapping `Cancelled` to
    /// `PromiseError::Cancelled`.
    pub fn into_result(self) -> Result<T, Reason> {
        match self {
            Self::Fulfilled(v) => Ok(v),
            Self::Rejected(r) => Err(r),
            Self::Cancelled => Err(Rc::new(PromiseError::Cancelled { key: None })),
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Fulfilled(v) => Some(v),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&Reason> {
        match self {
            Self::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_match_variant() {
        let f: SettledResult<i32> = SettledResult::Fulfilled(1);
        assert!(f.is_fulfilled());
        assert!(!f.is_rejected());
        assert!(!f.is_cancelled());

        let c: SettledResult<i32> = SettledResult::Cancelled;
        assert!(c.is_cancelled());
        assert!(c.into_result().is_err());
    }

    #[test]
    fn into_result_preserves_reason() {
        let reason = Rc::new(PromiseError::Cycle);
        let r: SettledResult<i32> = SettledResult::Rejected(reason.clone());
        let err = r.into_result().unwrap_err();
        assert!(Rc::ptr_eq(&err, &reason));
    }
}
