//! [`CancellationToken`] — an independent cancellation signal that can
//! track arbitrarily-typed promises and be linked into fan-in trees,
//! distinct from a single promise's own `cancel()`/`cancel_chain()`.
//!
//! Styled after the teacher pack's `Arc<AtomicBool>`-based tokens (see
//! the `s1ntropy-ferrous-di` and `microsoft-amplifier-core` cancellation
//! modules) but `Rc`-based, since nothing in this crate crosses threads.

use crate::error::{PromiseError, Reason};
use crate::promise::{Loop, Node, Promise};
use event_loop::TimerId;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

type CancelCallback = Box<dyn FnOnce(&Reason)>;

struct TokenInner {
    cancelled: bool,
    reason: Option<Reason>,
    callbacks: Vec<CancelCallback>,
    tracked: Vec<Weak<dyn Node>>,
    timer: Option<(Loop, TimerId)>,
}

/// A cancellation signal independent of any single promise. Tracked
/// promises are held weakly — tracking one does not keep it alive.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Rc<RefCell<TokenInner>>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken {
            inner: Rc::new(RefCell::new(TokenInner {
                cancelled: false,
                reason: None,
                callbacks: Vec::new(),
                tracked: Vec::new(),
                timer: None,
            })),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.borrow().cancelled
    }

    pub fn reason(&self) -> Option<Reason> {
        self.inner.borrow().reason.clone()
    }

    /// Returns `Err(reason)` if already cancelled, `Ok(())` otherwise —
    /// the idiomatic realization of "check and bail" at cooperative
    /// cancellation points.
    pub fn throw_if_cancelled(&self) -> Result<(), Reason> {
        match self.reason() {
            Some(r) => Err(r),
            None => Ok(()),
        }
    }

    /// Cancel the token. A no-op if already cancelled — the first
    /// `cancel()` call wins and its reason sticks.
    pub fn cancel(&self, reason: impl Into<Reason>) {
        let (callbacks, tracked) = {
            let mut inner = self.inner.borrow_mut();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            inner.reason = Some(reason.into());
            if let Some((loop_, id)) = inner.timer.take() {
                loop_.borrow_mut().cancel_timer(id);
            }
            (
                std::mem::take(&mut inner.callbacks),
                std::mem::take(&mut inner.tracked),
            )
        };

        let reason = self.reason().expect("reason was just set above");
        for cb in callbacks {
            cb(&reason);
        }
        for weak in tracked {
            if let Some(node) = weak.upgrade() {
                if !node.is_terminal_node() {
                    let _ = node.cancel_node();
                }
            }
        }
    }

    /// Register a callback run when the token is cancelled, in
    /// registration order (FIFO) — unlike a promise's own cancel
    /// handlers, which run most-recently-registered first, since token
    /// callbacks model independent observers rather than nested cleanup.
    /// Invoked synchronously if the token is already cancelled.
    pub fn on_cancel<F>(&self, f: F)
    where
        F: FnOnce(&Reason) + 'static,
    {
        if let Some(reason) = self.reason() {
            f(&reason);
        } else {
            self.inner.borrow_mut().callbacks.push(Box::new(f));
        }
    }

    /// Start tracking `promise`: it will be cancelled (via
    /// `cancel_node`, not a fresh `cancel_chain` walk) when this token
    /// is cancelled. Tracking an already-cancelled token's promise
    /// cancels it immediately.
    pub fn track<T: Clone + 'static>(&self, promise: &Promise<T>) {
        if self.is_cancelled() {
            let _ = promise.cancel();
            return;
        }
        self.inner.borrow_mut().tracked.push(promise.weak_node());
    }

    /// Stop tracking `promise`. A no-op if it was never tracked or has
    /// already been dropped.
    pub fn untrack<T: Clone + 'static>(&self, promise: &Promise<T>) {
        let target = promise.node_id();
        self.inner
            .borrow_mut()
            .tracked
            .retain(|w| w.upgrade().map(|n| n.node_id() != target).unwrap_or(false));
    }

    /// Count of tracked promises still alive (pruning dropped weak
    /// references as a side effect).
    pub fn get_tracked_count(&self) -> usize {
        let mut inner = self.inner.borrow_mut();
        inner.tracked.retain(|w| w.upgrade().is_some());
        inner.tracked.len()
    }

    /// Stop tracking every promise without cancelling any of them.
    pub fn clear_tracked(&self) {
        self.inner.borrow_mut().tracked.clear();
    }

    /// Schedule this token to cancel itself after `duration`, via the
    /// same timer primitive [`crate::timer::delay`] uses. Replaces any
    /// previously scheduled `cancel_after` timer on this token.
    pub fn cancel_after(&self, loop_: &Loop, duration: Duration) {
        if let Some((old_loop, old_id)) = self.inner.borrow_mut().timer.take() {
            old_loop.borrow_mut().cancel_timer(old_id);
        }
        let token = self.clone();
        let id = loop_.borrow_mut().add_timer(duration, move || {
            token.cancel(Rc::new(PromiseError::Cancelled { key: None }));
        });
        self.inner.borrow_mut().timer = Some((loop_.clone(), id));
    }

    /// Build a token that cancels as soon as any of `tokens` does,
    /// fanning the first reason in through to the combined token. A
    /// single source is returned as-is (the same token, not a copy).
    pub fn linked(tokens: &[CancellationToken]) -> CancellationToken {
        if let [single] = tokens {
            return single.clone();
        }
        let combined = CancellationToken::new();
        for t in tokens {
            if let Some(reason) = t.reason() {
                combined.cancel(reason);
                return combined;
            }
        }
        for t in tokens {
            let combined = combined.clone();
            t.on_cancel(move |reason| combined.cancel(reason.clone()));
        }
        combined
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::new_loop;

    #[test]
    fn cancel_invokes_callbacks_in_registration_order() {
        let token = CancellationToken::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            token.on_cancel(move |_| order.borrow_mut().push(i));
        }
        token.cancel(Rc::new(PromiseError::Cycle));
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn second_cancel_call_is_a_noop() {
        let token = CancellationToken::new();
        token.cancel(Rc::new(PromiseError::Cycle));
        let first_reason = token.reason().unwrap();
        token.cancel(Rc::new(PromiseError::Timeout(Duration::from_secs(1))));
        assert!(Rc::ptr_eq(&token.reason().unwrap(), &first_reason));
    }

    #[test]
    fn on_cancel_runs_immediately_if_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel(Rc::new(PromiseError::Cycle));
        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();
        token.on_cancel(move |_| *ran2.borrow_mut() = true);
        assert!(*ran.borrow());
    }

    #[test]
    fn track_cancels_promise_when_token_cancels() {
        let l = new_loop();
        let token = CancellationToken::new();
        let (p, _r) = Promise::pending::<i32>(&l);
        token.track(&p);
        token.cancel(Rc::new(PromiseError::Cycle));
        assert!(p.is_cancelled());
    }

    #[test]
    fn untrack_prevents_future_cancellation() {
        let l = new_loop();
        let token = CancellationToken::new();
        let (p, _r) = Promise::pending::<i32>(&l);
        token.track(&p);
        token.untrack(&p);
        token.cancel(Rc::new(PromiseError::Cycle));
        assert!(!p.is_cancelled());
    }

    #[test]
    fn get_tracked_count_prunes_dropped_promises() {
        let l = new_loop();
        let token = CancellationToken::new();
        {
            let (p, _r) = Promise::pending::<i32>(&l);
            token.track(&p);
        }
        assert_eq!(token.get_tracked_count(), 0);
    }

    #[test]
    fn clear_tracked_detaches_without_cancelling() {
        let l = new_loop();
        let token = CancellationToken::new();
        let (p, _r) = Promise::pending::<i32>(&l);
        token.track(&p);
        token.clear_tracked();
        token.cancel(Rc::new(PromiseError::Cycle));
        assert!(!p.is_cancelled());
    }

    #[test]
    fn cancel_after_fires_once_the_loop_runs() {
        let l = new_loop();
        let token = CancellationToken::new();
        token.cancel_after(&l, Duration::from_millis(5));
        l.borrow_mut().run_until_idle();
        assert!(token.is_cancelled());
    }

    #[test]
    fn linked_token_cancels_when_any_input_does() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let combined = CancellationToken::linked(&[a.clone(), b.clone()]);
        assert!(!combined.is_cancelled());
        b.cancel(Rc::new(PromiseError::Cycle));
        assert!(combined.is_cancelled());
    }

    #[test]
    fn linked_token_cancelled_immediately_if_an_input_already_is() {
        let a = CancellationToken::new();
        a.cancel(Rc::new(PromiseError::Cycle));
        let combined = CancellationToken::linked(&[a]);
        assert!(combined.is_cancelled());
    }

    #[test]
    fn linked_with_a_single_source_returns_that_same_token() {
        let a = CancellationToken::new();
        let combined = CancellationToken::linked(&[a.clone()]);
        a.cancel(Rc::new(PromiseError::Cycle));
        assert!(combined.is_cancelled());
        assert!(Rc::ptr_eq(&a.inner, &combined.inner));
    }
}
