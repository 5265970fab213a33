//! A single-threaded promise and cancellation-token runtime with
//! structured combinators: a JS-`Promise`-shaped state machine adapted
//! to Rust's type system, plus `all`/`race`/`any`/`timeout`-style
//! collection combinators and a bounded-concurrency task runner, all
//! driven by an explicit, swappable event loop rather than an ambient
//! global one.
//!
//! ```
//! use promise_rt::{new_loop, Promise};
//!
//! let loop_ = new_loop();
//! let p = Promise::resolved(&loop_, 41).then_map(|v| v + 1);
//! let result = promise_rt::block_on(&p, &loop_, true);
//! assert_eq!(result.unwrap(), 42);
//! ```

mod cancellation;
mod combinators;
mod concurrency;
mod error;
mod promise;
mod reporter;
mod settled;
mod timer;

pub use cancellation::CancellationToken;
pub use combinators::{all, all_settled, any, race, timeout};
pub use concurrency::{batch, batch_settled, concurrent, concurrent_settled, map, Factory};
pub use error::{wrap_non_error, AggregateError, PromiseError, Reason};
pub use promise::{new_loop, Continuation, EventLoop, Loop, Outcome, Promise, Resolver, Thenable};
pub use reporter::{set_rejection_handler, ReporterFn};
pub use settled::SettledResult;
pub use timer::{delay, delay_zero};

/// Block the calling thread until `promise` settles, running `loop_`
/// until either it settles or the loop genuinely has no more work to
/// do. If `reset` is `true`, any leftover micro-tasks/timers are
/// discarded afterward so the loop handle can be reused cleanly.
///
/// Calling this from inside a reaction running on the same loop
/// deadlocks the reaction (the loop can't make progress while it's
/// already on the call stack) — this is a caller contract, not
/// something the runtime can check for you.
pub fn block_on<T: Clone + 'static>(promise: &Promise<T>, loop_: &Loop, reset: bool) -> Result<T, Reason> {
    if !promise.is_settled() {
        loop_.borrow_mut().run_until_idle();
    }

    let result = if promise.is_fulfilled() {
        Ok(promise.value().expect("is_fulfilled implies a value"))
    } else if promise.is_rejected() {
        Err(promise.reason().expect("is_rejected implies a reason"))
    } else if promise.is_cancelled() {
        Err(std::rc::Rc::new(PromiseError::Cancelled { key: None }))
    } else {
        Err(std::rc::Rc::new(PromiseError::Other(Box::new(
            StillPendingAfterIdle,
        ))))
    };

    if reset {
        loop_.borrow_mut().reset();
    }
    result
}

#[derive(Debug)]
struct StillPendingAfterIdle;

impl std::fmt::Display for StillPendingAfterIdle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "event loop went idle without the awaited promise ever settling"
        )
    }
}

impl std::error::Error for StillPendingAfterIdle {}
