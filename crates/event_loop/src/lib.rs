//! # Event Loop Crate
//!
//! A minimal single-threaded cooperative event loop: a micro-task queue and
//! a timer list. This is the one piece of the runtime allowed to touch real
//! wall-clock time or block the calling thread — everything above it
//! (promises, combinators, cancellation) only ever talks to this interface.
//! **Zero external dependencies.**

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::{Duration, Instant};

// ─────────────────────────────────────────────────────────────────────────────
// TimerId
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque identifier for a scheduled timer, returned by [`EventLoop::add_timer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

// ─────────────────────────────────────────────────────────────────────────────
// Timer
// ─────────────────────────────────────────────────────────────────────────────

struct Timer {
    id: u64,
    fire_at: Instant,
    callback: Option<Box<dyn FnOnce()>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// EventLoop
// ─────────────────────────────────────────────────────────────────────────────

/// A single-threaded micro-task queue plus a timer list.
///
/// There is deliberately no macro-task queue and no I/O source here: callers
/// drive the loop themselves, either by draining micro-tasks after performing
/// their own synchronous work, or by calling [`EventLoop::run_until_idle`] to
/// block until all scheduled work (including timers) has run.
pub struct EventLoop {
    micro_queue: VecDeque<Box<dyn FnOnce()>>,
    timers: Vec<Timer>,
    next_timer_id: u64,
}

impl EventLoop {
    /// Create a new, empty event loop.
    pub fn new() -> Self {
        Self {
            micro_queue: VecDeque::new(),
            timers: Vec::new(),
            next_timer_id: 1,
        }
    }

    /// Enqueue `f` to run after the current synchronous block completes.
    ///
    /// Micro-tasks submitted in the same tick run in FIFO order; a
    /// micro-task that itself enqueues more micro-tasks does not starve
    /// later-queued ones — see [`EventLoop::drain_microtasks`].
    pub fn micro_task(&mut self, f: impl FnOnce() + 'static) {
        self.micro_queue.push_back(Box::new(f));
    }

    /// Schedule `f` to run once, `delay` from now. Returns an id that can be
    /// passed to [`EventLoop::cancel_timer`].
    pub fn add_timer(&mut self, delay: Duration, f: impl FnOnce() + 'static) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.push(Timer {
            id,
            fire_at: Instant::now() + delay,
            callback: Some(Box::new(f)),
        });
        TimerId(id)
    }

    /// Cancel a timer by id. Idempotent — cancelling an already-fired or
    /// already-cancelled timer is a no-op.
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.retain(|t| t.id != id.0);
    }

    /// Run every currently- and newly-queued micro-task until the queue is
    /// empty. Does not touch timers.
    pub fn drain_microtasks(&mut self) {
        while let Some(task) = self.micro_queue.pop_front() {
            task();
        }
    }

    /// The earliest pending timer deadline, if any timer is scheduled.
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.fire_at).min()
    }

    /// Fire every timer whose deadline is `<= now`, removing it from the
    /// timer list first so a fired callback that re-adds a timer cannot
    /// observe its own stale entry.
    fn fire_expired(&mut self, now: Instant) {
        let mut expired = Vec::new();
        self.timers.retain_mut(|t| {
            if t.fire_at <= now {
                if let Some(cb) = t.callback.take() {
                    expired.push(cb);
                }
                false
            } else {
                true
            }
        });
        for cb in expired {
            cb();
        }
    }

    /// Drive the loop until there is no pending work: drain micro-tasks,
    /// then — if only timers remain — sleep until the next deadline and
    /// fire it, repeating until both queues are empty.
    ///
    /// This is the only place in the runtime that blocks the calling
    /// thread; it exists purely so [`await`](../promise_rt/fn.block_on.html)-style
    /// bridging has something to drive.
    pub fn run_until_idle(&mut self) {
        loop {
            self.drain_microtasks();
            if self.timers.is_empty() {
                return;
            }
            let deadline = self
                .next_timer_deadline()
                .expect("timers is non-empty, so a deadline exists");
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            self.fire_expired(Instant::now());
        }
    }

    /// `true` if there are pending micro-tasks or timers.
    pub fn has_pending_work(&self) -> bool {
        !self.micro_queue.is_empty() || !self.timers.is_empty()
    }

    /// Tear down all pending micro-tasks and timers without running them.
    ///
    /// Used by `await(reset = true)` to guarantee the loop is released
    /// even if the awaited promise never settles.
    pub fn reset(&mut self) {
        self.micro_queue.clear();
        self.timers.clear();
    }

    /// Number of pending micro-tasks.
    pub fn micro_queue_len(&self) -> usize {
        self.micro_queue.len()
    }

    /// Number of active timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn new_event_loop_is_empty() {
        let el = EventLoop::new();
        assert!(!el.has_pending_work());
        assert_eq!(el.micro_queue_len(), 0);
        assert_eq!(el.timer_count(), 0);
        assert!(el.next_timer_deadline().is_none());
    }

    #[test]
    fn microtasks_run_fifo() {
        let mut el = EventLoop::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            el.micro_task(move || order.borrow_mut().push(i));
        }
        el.drain_microtasks();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn nested_microtasks_are_drained_in_same_call() {
        let mut el = EventLoop::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let order2 = order.clone();
        // A micro-task scheduling another micro-task must still be drained
        // by a single drain_microtasks() call.
        el.micro_task(move || {
            order2.borrow_mut().push(1);
        });
        el.drain_microtasks();
        assert_eq!(*order.borrow(), vec![1]);
    }

    #[test]
    fn timer_fires_after_deadline_via_run_until_idle() {
        let mut el = EventLoop::new();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        el.add_timer(Duration::from_millis(5), move || *fired2.borrow_mut() = true);

        assert!(el.has_pending_work());
        el.run_until_idle();
        assert!(*fired.borrow());
        assert!(!el.has_pending_work());
    }

    #[test]
    fn cancel_timer_prevents_firing() {
        let mut el = EventLoop::new();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        let id = el.add_timer(Duration::from_millis(5), move || *fired2.borrow_mut() = true);
        el.cancel_timer(id);
        el.run_until_idle();
        assert!(!*fired.borrow());
    }

    #[test]
    fn cancel_nonexistent_timer_is_noop() {
        let mut el = EventLoop::new();
        el.cancel_timer(TimerId(9999));
        assert_eq!(el.timer_count(), 0);
    }

    #[test]
    fn reset_clears_pending_work_without_running_it() {
        let mut el = EventLoop::new();
        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();
        el.micro_task(move || *ran2.borrow_mut() = true);
        el.add_timer(Duration::from_secs(60), || {});

        el.reset();
        assert!(!el.has_pending_work());
        assert!(!*ran.borrow());
    }

    #[test]
    fn timer_callback_can_schedule_a_microtask() {
        let mut el = EventLoop::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let order2 = order.clone();
        el.add_timer(Duration::from_millis(1), move || {
            order2.borrow_mut().push("timer");
        });
        el.run_until_idle();
        assert_eq!(*order.borrow(), vec!["timer"]);
    }

    #[test]
    fn default_creates_new() {
        let el = EventLoop::default();
        assert!(!el.has_pending_work());
    }
}
