//! The core `Promise<T>` state machine: construction, adoption, reaction
//! dispatch, and the cancellation tree.
//!
//! Grounded on the index-based toy promise runtime in the teacher's
//! `js_builtins::promise` module, generalized from bytecode callback ids
//! to real closures and from a single global table to `Rc<RefCell<_>>`
//! nodes linked directly to each other.

use crate::error::{PromiseError, Reason};
use crate::reporter::report_unhandled;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

pub use event_loop::EventLoop;

/// A shared handle to the event loop a promise chain is bound to. Every
/// constructor takes one explicitly — there is no ambient global loop,
/// so a process can run more than one independent promise world (handy
/// in tests).
pub type Loop = Rc<RefCell<EventLoop>>;

/// Create a fresh, empty event loop handle.
pub fn new_loop() -> Loop {
    Rc::new(RefCell::new(EventLoop::new()))
}

type ReactionFn<T> = Box<dyn FnOnce(Settlement<T>)>;
type CancelHandler = Box<dyn FnOnce() -> Result<(), Reason>>;

#[derive(Clone)]
enum Settlement<T> {
    Fulfilled(T),
    Rejected(Reason),
}

#[derive(Clone)]
enum State<T> {
    Pending,
    Fulfilled(T),
    Rejected(Reason),
    Cancelled,
}

/// The result of a `then`/`catch` handler: either a plain value or a
/// "flatten into this promise" instruction — the Rust realization of
/// duck-typed thenable adoption from a single return slot.
pub enum Continuation<U> {
    Value(U),
    Chain(Promise<U>),
}

/// What a `then`/`catch`/`finally` handler returns: `Ok` settles normally
/// (by value or by flattening), `Err` is the realization of "the handler
/// threw" in a language without exceptions.
pub type Outcome<U> = Result<Continuation<U>, Reason>;

/// A type that can be adopted into a `Promise<T>` the way a foreign
/// thenable is adopted in the source runtime. Implement this to let
/// `Promise::resolve_foreign` bridge other async primitives in.
pub trait Thenable<T> {
    fn into_promise(self, loop_: &Loop) -> Promise<T>;
}

/// An object-safe view of a promise node used to walk the cancellation
/// tree, and to let [`crate::cancellation::CancellationToken`] track
/// arbitrarily-typed promises without knowing their `T`. `pub(crate)`
/// rather than private so the cancellation module can share it.
pub(crate) trait Node {
    fn cancel_node(&self) -> Result<(), Reason>;
    fn is_terminal_node(&self) -> bool;
    fn parent_node(&self) -> Option<Weak<dyn Node>>;
    fn node_id(&self) -> u64;
}

fn next_node_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

struct Inner<T> {
    id: u64,
    state: State<T>,
    reactions: Vec<ReactionFn<T>>,
    cancel_handlers: Vec<CancelHandler>,
    children: Vec<Weak<dyn Node>>,
    parent: Option<Weak<dyn Node>>,
    has_rejection_handler: bool,
    reason_accessed: bool,
    loop_: Loop,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let State::Rejected(reason) = &self.state {
            if !self.has_rejection_handler && !self.reason_accessed {
                report_unhandled(reason);
            }
        }
    }
}

impl<T: Clone + 'static> Node for RefCell<Inner<T>> {
    fn cancel_node(&self) -> Result<(), Reason> {
        cancel_impl(self)
    }

    fn is_terminal_node(&self) -> bool {
        !matches!(self.borrow().state, State::Pending)
    }

    fn parent_node(&self) -> Option<Weak<dyn Node>> {
        self.borrow().parent.clone()
    }

    fn node_id(&self) -> u64 {
        self.borrow().id
    }
}

/// A single-threaded, structurally-linked promise.
///
/// Cloning a `Promise<T>` clones the handle, not the state — all clones
/// observe the same underlying settlement, exactly like cloning an `Rc`.
pub struct Promise<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: self.inner.clone(),
        }
    }
}

/// The half of a promise handed to an executor closure: write-only,
/// unlike `Promise<T>` which also exposes `then`/`cancel`/accessors.
pub struct Resolver<T> {
    promise: Promise<T>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Resolver {
            promise: self.promise.clone(),
        }
    }
}

impl<T: Clone + 'static> Resolver<T> {
    pub fn resolve(&self, value: T) {
        self.promise.settle_fulfilled(value);
    }

    /// Adopt another promise of the same type, per the same rules as
    /// [`Promise::resolve_with`].
    pub fn resolve_with(&self, other: Promise<T>) {
        self.promise.resolve_with(other);
    }

    pub fn reject(&self, reason: impl Into<Reason>) {
        self.promise.settle_rejected(reason.into());
    }
}

impl<T: Clone + 'static> Promise<T> {
    fn pending_in(loop_: &Loop) -> Promise<T> {
        Promise {
            inner: Rc::new(RefCell::new(Inner {
                id: next_node_id(),
                state: State::Pending,
                reactions: Vec::new(),
                cancel_handlers: Vec::new(),
                children: Vec::new(),
                parent: None,
                has_rejection_handler: false,
                reason_accessed: false,
                loop_: loop_.clone(),
            })),
        }
    }

    fn settled_in(loop_: &Loop, state: State<T>) -> Promise<T> {
        Promise {
            inner: Rc::new(RefCell::new(Inner {
                id: next_node_id(),
                state,
                reactions: Vec::new(),
                cancel_handlers: Vec::new(),
                children: Vec::new(),
                parent: None,
                has_rejection_handler: false,
                reason_accessed: false,
                loop_: loop_.clone(),
            })),
        }
    }

    /// Create a pending promise paired with a resolver, the way
    /// `new Promise((resolve, reject) => ...)` hands out both halves.
    pub fn pending(loop_: &Loop) -> (Promise<T>, Resolver<T>) {
        let p = Promise::pending_in(loop_);
        let r = Resolver {
            promise: p.clone(),
        };
        (p, r)
    }

    /// Run `f` synchronously with a fresh resolver, JS-executor style.
    /// Unlike the source runtime, a panicking `f` is not caught — the
    /// resolver must be used explicitly to reject.
    pub fn with_executor<F>(loop_: &Loop, f: F) -> Promise<T>
    where
        F: FnOnce(Resolver<T>),
    {
        let p = Promise::pending_in(loop_);
        f(Resolver {
            promise: p.clone(),
        });
        p
    }

    /// An already-fulfilled promise.
    pub fn resolved(loop_: &Loop, value: T) -> Promise<T> {
        Promise::settled_in(loop_, State::Fulfilled(value))
    }

    /// An already-rejected promise.
    pub fn rejected(loop_: &Loop, reason: impl Into<Reason>) -> Promise<T> {
        Promise::settled_in(loop_, State::Rejected(reason.into()))
    }

    fn loop_handle(&self) -> Loop {
        self.inner.borrow().loop_.clone()
    }

    fn state_snapshot(&self) -> State<T> {
        self.inner.borrow().state.clone()
    }

    // ---- settlement -------------------------------------------------

    fn settle(&self, settlement: Settlement<T>) {
        let reactions = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                return;
            }
            inner.state = match &settlement {
                Settlement::Fulfilled(v) => State::Fulfilled(v.clone()),
                Settlement::Rejected(r) => State::Rejected(r.clone()),
            };
            std::mem::take(&mut inner.reactions)
        };
        if reactions.is_empty() {
            return;
        }
        let loop_ = self.loop_handle();
        let mut loop_mut = loop_.borrow_mut();
        for reaction in reactions {
            let s = settlement.clone();
            loop_mut.micro_task(move || reaction(s));
        }
    }

    fn settle_fulfilled(&self, value: T) {
        self.settle(Settlement::Fulfilled(value));
    }

    fn settle_rejected(&self, reason: Reason) {
        self.settle(Settlement::Rejected(reason));
    }

    /// Adopt another promise of the same type. Adopting oneself
    /// (directly, not merely a promise with equal output values) rejects
    /// with [`PromiseError::Cycle`] instead of deadlocking.
    pub fn resolve_with(&self, other: Promise<T>) {
        if Rc::ptr_eq(&self.inner, &other.inner) {
            self.settle_rejected(Rc::new(PromiseError::Cycle));
            return;
        }
        let self_for_fulfill = self.clone();
        let self_for_reject = self.clone();
        other.register_bridge(
            move |v| self_for_fulfill.settle_fulfilled(v),
            move |r| self_for_reject.settle_rejected(r),
        );

        let other_for_cancel = other.clone();
        let _ = self.on_cancel(move || {
            if !other_for_cancel.is_settled() {
                other_for_cancel.cancel()?;
            }
            Ok(())
        });
    }

    /// Adopt a foreign thenable, the generalized form of [`Self::resolve_with`].
    pub fn resolve_foreign<F: Thenable<T>>(&self, foreign: F) {
        let loop_ = self.loop_handle();
        let inner_promise = foreign.into_promise(&loop_);
        self.resolve_with(inner_promise);
    }

    /// Register a fire-and-forget reaction directly on `self` without
    /// allocating a child promise — used by adoption and by the
    /// combinators, which only need the side effect, not a derived
    /// promise anyone observes.
    fn register_bridge<F, G>(&self, on_fulfill: F, on_reject: G)
    where
        F: FnOnce(T) + 'static,
        G: FnOnce(Reason) + 'static,
    {
        self.inner.borrow_mut().has_rejection_handler = true;
        let bridge: ReactionFn<T> = Box::new(move |s| match s {
            Settlement::Fulfilled(v) => on_fulfill(v),
            Settlement::Rejected(r) => on_reject(r),
        });

        let state = self.state_snapshot();
        match state {
            State::Cancelled => {}
            State::Pending => {
                self.inner.borrow_mut().reactions.push(bridge);
            }
            State::Fulfilled(v) => {
                let loop_ = self.loop_handle();
                loop_
                    .borrow_mut()
                    .micro_task(move || bridge(Settlement::Fulfilled(v)));
            }
            State::Rejected(r) => {
                let loop_ = self.loop_handle();
                loop_
                    .borrow_mut()
                    .micro_task(move || bridge(Settlement::Rejected(r)));
            }
        }
    }

    /// Like [`Self::register_bridge`] but also observes cancellation,
    /// which never drives a settlement reaction. Used by the
    /// combinators, which must treat a mid-flight cancellation the same
    /// as a rejection.
    pub(crate) fn tap<F, G, H>(&self, on_fulfill: F, on_reject: G, on_cancel: H)
    where
        F: FnOnce(T) + 'static,
        G: FnOnce(Reason) + 'static,
        H: FnOnce() -> Result<(), Reason> + 'static,
    {
        self.register_bridge(on_fulfill, on_reject);
        let _ = self.on_cancel(on_cancel);
    }

    // ---- then / catch / finally -------------------------------------

    fn make_reaction<U, F, G>(child: Promise<U>, on_fulfill: F, on_reject: G) -> ReactionFn<T>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Outcome<U> + 'static,
        G: FnOnce(Reason) -> Outcome<U> + 'static,
    {
        Box::new(move |settlement| {
            if child.is_cancelled() {
                return;
            }
            let outcome = match settlement {
                Settlement::Fulfilled(v) => on_fulfill(v),
                Settlement::Rejected(r) => on_reject(r),
            };
            match outcome {
                Ok(Continuation::Value(v)) => child.settle_fulfilled(v),
                Ok(Continuation::Chain(p)) => child.resolve_with(p),
                Err(reason) => child.settle_rejected(reason),
            }
        })
    }

    /// `then(on_fulfill, on_reject)` with both handlers present, the most
    /// general registration form; used internally and by code that needs
    /// a differently-typed child while still observing rejections.
    pub fn then_catch<U, F, G>(&self, on_fulfill: F, on_reject: G) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Outcome<U> + 'static,
        G: FnOnce(Reason) -> Outcome<U> + 'static,
    {
        self.inner.borrow_mut().has_rejection_handler = true;
        let child: Promise<U> = Promise::pending_in(&self.loop_handle());
        let reaction = Self::make_reaction(child.clone(), on_fulfill, on_reject);
        self.register_onto(child, reaction)
    }

    fn register_onto<U: Clone + 'static>(
        &self,
        child: Promise<U>,
        reaction: ReactionFn<T>,
    ) -> Promise<U> {
        child.inner.borrow_mut().parent = Some(Rc::downgrade(&self.inner) as Weak<dyn Node>);
        self.inner
            .borrow_mut()
            .children
            .push(Rc::downgrade(&child.inner) as Weak<dyn Node>);

        let state = self.state_snapshot();
        match state {
            State::Cancelled => {
                let _ = child.cancel();
            }
            State::Pending => {
                self.inner.borrow_mut().reactions.push(reaction);
            }
            State::Fulfilled(v) => {
                let loop_ = self.loop_handle();
                loop_
                    .borrow_mut()
                    .micro_task(move || reaction(Settlement::Fulfilled(v)));
            }
            State::Rejected(r) => {
                let loop_ = self.loop_handle();
                loop_
                    .borrow_mut()
                    .micro_task(move || reaction(Settlement::Rejected(r)));
            }
        }
        child
    }

    /// `then(on_fulfill, null)` — rejection passes through unchanged.
    pub fn then<U, F>(&self, on_fulfill: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Outcome<U> + 'static,
    {
        self.then_catch(on_fulfill, |r| Err(r))
    }

    /// Infallible, non-flattening convenience over [`Self::then`].
    pub fn then_map<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.then(move |v| Ok(Continuation::Value(f(v))))
    }

    /// `then(null, on_reject)` — fulfillment passes through unchanged.
    pub fn catch<F>(&self, on_reject: F) -> Promise<T>
    where
        F: FnOnce(Reason) -> Outcome<T> + 'static,
    {
        self.then_catch(|v| Ok(Continuation::Value(v)), on_reject)
    }

    /// Infallible, non-flattening convenience over [`Self::catch`].
    pub fn catch_map<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(Reason) -> T + 'static,
    {
        self.catch(move |r| Ok(Continuation::Value(f(r))))
    }

    /// Runs `on_finally` regardless of how `self` settles (fulfilled,
    /// rejected, or cancelled) and otherwise preserves `self`'s outcome.
    /// If `on_finally` itself rejects, that rejection replaces `self`'s
    /// outcome; a chained cleanup promise is awaited before settling.
    pub fn finally<F>(&self, on_finally: F) -> Promise<T>
    where
        F: FnOnce() -> Outcome<()> + 'static,
    {
        let slot: Rc<RefCell<Option<Box<dyn FnOnce() -> Outcome<()>>>>> =
            Rc::new(RefCell::new(Some(Box::new(on_finally))));

        let slot_fulfill = slot.clone();
        let slot_reject = slot.clone();
        let child = self.then_catch(
            move |v| run_finally_then(slot_fulfill, move || Ok(Continuation::Value(v))),
            move |r| run_finally_then(slot_reject, move || Err(r)),
        );

        let slot_cancel = slot.clone();
        let _ = child.on_cancel(move || {
            if let Some(h) = slot_cancel.borrow_mut().take() {
                h().map(|_| ())?;
            }
            Ok(())
        });
        child
    }

    /// A stable identity for this promise's underlying node, usable to
    /// recognize the same promise across `Weak<dyn Node>` upgrades
    /// (e.g. in [`crate::cancellation::CancellationToken::untrack`]).
    pub(crate) fn node_id(&self) -> u64 {
        self.inner.borrow().id
    }

    /// A non-owning handle to this promise's cancellation node, erased
    /// to `T`, for [`crate::cancellation::CancellationToken`] to track.
    pub(crate) fn weak_node(&self) -> Weak<dyn Node> {
        Rc::downgrade(&self.inner) as Weak<dyn Node>
    }

    // ---- cancellation -------------------------------------------------

    /// Cancel this promise if still pending. A no-op otherwise. Cancel
    /// handlers run most-recently-registered first; errors from handlers
    /// (and from cascading into children) are combined per
    /// [`crate::error::combine_errors`].
    pub fn cancel(&self) -> Result<(), Reason> {
        cancel_impl(&self.inner)
    }

    /// Walk up through already-cancelled/terminal ancestors and cancel
    /// the highest-up node that is still pending — cancelling a leaf
    /// whose whole chain has already settled is a no-op.
    pub fn cancel_chain(&self) -> Result<(), Reason> {
        let mut current: Weak<dyn Node> = Rc::downgrade(&self.inner) as Weak<dyn Node>;
        loop {
            let Some(node) = current.upgrade() else {
                return Ok(());
            };
            match node.parent_node() {
                Some(parent_weak) => match parent_weak.upgrade() {
                    Some(parent_rc) if !parent_rc.is_terminal_node() => {
                        current = parent_weak;
                    }
                    _ => return node.cancel_node(),
                },
                None => return node.cancel_node(),
            }
        }
    }

    /// Register a handler invoked when this promise is cancelled. If
    /// already cancelled, invoked synchronously right away. Registering
    /// on a fulfilled/rejected promise silently stores the handler; it
    /// will never run.
    pub fn on_cancel<F>(&self, h: F) -> Result<(), Reason>
    where
        F: FnOnce() -> Result<(), Reason> + 'static,
    {
        let already_cancelled = matches!(self.inner.borrow().state, State::Cancelled);
        if already_cancelled {
            h()
        } else {
            self.inner.borrow_mut().cancel_handlers.push(Box::new(h));
            Ok(())
        }
    }

    // ---- accessors ------------------------------------------------------

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, State::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self.inner.borrow().state, State::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.borrow().state, State::Rejected(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.borrow().state, State::Cancelled)
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// The fulfilled value, if any. Marks the promise as observed for
    /// unhandled-rejection purposes (matching `reason()`'s behavior,
    /// since observing one terminal field implies the other was checked
    /// too in typical call patterns).
    pub fn value(&self) -> Option<T> {
        let mut inner = self.inner.borrow_mut();
        inner.reason_accessed = true;
        match &inner.state {
            State::Fulfilled(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// The rejection reason, if any. Marks the promise as observed so it
    /// is not reported as an unhandled rejection when dropped.
    pub fn reason(&self) -> Option<Reason> {
        let mut inner = self.inner.borrow_mut();
        inner.reason_accessed = true;
        match &inner.state {
            State::Rejected(r) => Some(r.clone()),
            _ => None,
        }
    }
}

fn run_finally_then<U>(
    slot: Rc<RefCell<Option<Box<dyn FnOnce() -> Outcome<()>>>>>,
    resume: impl FnOnce() -> Outcome<U> + 'static,
) -> Outcome<U>
where
    U: Clone + 'static,
{
    let Some(h) = slot.borrow_mut().take() else {
        return resume();
    };
    match h()? {
        Continuation::Value(()) => resume(),
        Continuation::Chain(cleanup) => {
            let (result, resolver) = Promise::pending(&cleanup.loop_handle());
            cleanup.tap(
                {
                    let resolver = resolver.clone();
                    move |_| match resume() {
                        Ok(Continuation::Value(v)) => resolver.resolve(v),
                        Ok(Continuation::Chain(p)) => resolver.resolve_with(p),
                        Err(r) => resolver.reject(r),
                    }
                },
                move |r| resolver.reject(r),
                || Ok(()),
            );
            Ok(Continuation::Chain(result))
        }
    }
}

/// Free function (rather than a `Promise<T>` method) so the `Node` impl
/// — which only has `&RefCell<Inner<T>>`, not an `Rc` — can share it.
fn cancel_impl<T: Clone + 'static>(inner_cell: &RefCell<Inner<T>>) -> Result<(), Reason> {
    let (handlers, children) = {
        let mut inner = inner_cell.borrow_mut();
        if !matches!(inner.state, State::Pending) {
            return Ok(());
        }
        inner.state = State::Cancelled;
        inner.reactions.clear();
        let handlers = std::mem::take(&mut inner.cancel_handlers);
        let children = inner.children.clone();
        (handlers, children)
    };

    let mut errors = Vec::new();
    for h in handlers.into_iter().rev() {
        if let Err(e) = h() {
            errors.push(e);
        }
    }
    for child_weak in children {
        if let Some(child) = child_weak.upgrade() {
            if !child.is_terminal_node() {
                if let Err(e) = child.cancel_node() {
                    errors.push(e);
                }
            }
        }
    }
    crate::error::combine_errors(errors)
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.borrow().state {
            State::Pending => "Pending",
            State::Fulfilled(_) => "Fulfilled",
            State::Rejected(_) => "Rejected",
            State::Cancelled => "Cancelled",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}
