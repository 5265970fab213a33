//! `delay` — a cancellable promise backed by the event loop's timer list.

use crate::error::PromiseError;
use crate::promise::{Loop, Promise};
use std::rc::Rc;
use std::time::Duration;

/// A promise that fulfills with `()` after `duration`, or is rejected
/// with [`PromiseError::Cancelled`] if cancelled first.
pub fn delay(loop_: &Loop, duration: Duration) -> Promise<()> {
    let (promise, resolver) = Promise::pending(loop_);
    let timer_id = loop_.borrow_mut().add_timer(duration, {
        let resolver = resolver.clone();
        move || resolver.resolve(())
    });

    let loop_for_cancel = loop_.clone();
    let _ = promise.on_cancel(move || {
        loop_for_cancel.borrow_mut().cancel_timer(timer_id);
        Ok(())
    });

    promise
}

/// `delay(0)` still schedules through the timer primitive rather than
/// settling synchronously, keeping ordering relative to already-queued
/// micro-tasks predictable.
pub fn delay_zero(loop_: &Loop) -> Promise<()> {
    delay(loop_, Duration::from_secs(0))
}

pub(crate) fn cancelled_reason() -> crate::error::Reason {
    Rc::new(PromiseError::Cancelled { key: None })
}
