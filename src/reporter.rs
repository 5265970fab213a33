//! Process-wide unhandled-rejection reporting.
//!
//! The promise core itself is entirely single-threaded (`Rc`/`RefCell`
//! throughout), but the reporter slot is process-global, so it is guarded
//! by a `Mutex` the way the runtime's design notes call for — a real
//! multi-threaded host embedding this crate could still swap the handler
//! safely from any thread, even though no `Promise<T>` ever crosses one.

use crate::error::Reason;
use std::sync::Mutex;

/// A registered rejection handler. Must be `Send` so the slot itself can
/// be `Sync`; it is not required to be callable from multiple threads at
/// once — the `Mutex` already serializes that.
pub type ReporterFn = Box<dyn Fn(&Reason) + Send>;

static REPORTER: Mutex<Option<ReporterFn>> = Mutex::new(None);

/// Install a new handler for unhandled rejections, returning whatever was
/// previously installed (`None` means the default `tracing`-based
/// reporter was in effect).
pub fn set_rejection_handler(handler: Option<ReporterFn>) -> Option<ReporterFn> {
    let mut guard = REPORTER.lock().unwrap_or_else(|e| e.into_inner());
    std::mem::replace(&mut guard, handler)
}

/// Called from `Inner<T>::drop` when a rejected, never-observed promise
/// is dropped.
pub(crate) fn report_unhandled(reason: &Reason) {
    let guard = REPORTER.lock().unwrap_or_else(|e| e.into_inner());
    match guard.as_ref() {
        Some(handler) => handler(reason),
        None => default_reporter(reason),
    }
}

fn default_reporter(reason: &Reason) {
    eprintln!("unhandled promise rejection: {reason}");
    tracing::error!(%reason, "unhandled promise rejection");
}
