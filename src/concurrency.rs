//! Bounded-concurrency task running: `concurrent`, `concurrent_settled`,
//! `batch`, `batch_settled`, and `map`.
//!
//! Unlike the collection combinators in [`crate::combinators`], these
//! operate on *factories* — zero-argument closures that start a promise
//! lazily — so that at most `limit` tasks are ever in flight at once. A
//! shared pump context (plain fields behind one `Rc`, per the runtime's
//! design notes) tracks the work queue and is re-entered from each
//! task's own settlement reaction.

use crate::error::{PromiseError, Reason};
use crate::promise::{Continuation, Loop, Outcome, Promise, Resolver};
use crate::settled::SettledResult;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// A lazily-started unit of work: called at most once, when a
/// concurrency slot is available.
pub type Factory<T> = Box<dyn FnOnce() -> Promise<T>>;

fn validate_limit(limit: usize) -> Result<(), Reason> {
    if limit == 0 {
        Err(Rc::new(PromiseError::InvalidArgument(
            "concurrency limit must be > 0",
        )))
    } else {
        Ok(())
    }
}

// ---- concurrent ----------------------------------------------------------

struct ConcurrentCtx<K, T> {
    queue: RefCell<VecDeque<(usize, K, Factory<T>)>>,
    active: RefCell<Vec<Promise<T>>>,
    keys: Vec<K>,
    values: RefCell<Vec<Option<T>>>,
    completed: Cell<usize>,
    total: usize,
    done: Cell<bool>,
    resolver: Resolver<Vec<(K, T)>>,
}

fn concurrent_short_circuit<K: Clone + 'static, T: Clone + 'static>(ctx: &Rc<ConcurrentCtx<K, T>>) {
    ctx.queue.borrow_mut().clear();
    for p in ctx.active.borrow().iter() {
        if !p.is_settled() {
            let _ = p.cancel_chain();
        }
    }
}

fn concurrent_spawn_next<K, T>(ctx: Rc<ConcurrentCtx<K, T>>)
where
    K: Clone + fmt::Display + 'static,
    T: Clone + 'static,
{
    if ctx.done.get() {
        return;
    }
    let Some((idx, key, factory)) = ctx.queue.borrow_mut().pop_front() else {
        return;
    };
    let promise = factory();
    ctx.active.borrow_mut().push(promise.clone());

    let ctx_f = ctx.clone();
    let ctx_r = ctx.clone();
    let ctx_c = ctx.clone();
    let key_c = key;

    promise.tap(
        move |v| {
            if ctx_f.done.get() {
                return;
            }
            ctx_f.values.borrow_mut()[idx] = Some(v);
            ctx_f.completed.set(ctx_f.completed.get() + 1);
            if ctx_f.completed.get() == ctx_f.total {
                ctx_f.done.set(true);
                let out = ctx_f
                    .keys
                    .iter()
                    .cloned()
                    .zip(ctx_f.values.borrow_mut().drain(..).map(|v| v.expect("all slots filled")))
                    .collect();
                ctx_f.resolver.resolve(out);
            } else {
                concurrent_spawn_next(ctx_f.clone());
            }
        },
        move |r| {
            if ctx_r.done.get() {
                return;
            }
            ctx_r.done.set(true);
            ctx_r.resolver.reject(r);
            concurrent_short_circuit(&ctx_r);
        },
        move || {
            if ctx_c.done.get() {
                return Ok(());
            }
            ctx_c.done.set(true);
            ctx_c.resolver.reject(Rc::new(PromiseError::Cancelled {
                key: Some(key_c.to_string()),
            }));
            concurrent_short_circuit(&ctx_c);
            Ok(())
        },
    );
}

/// Runs `tasks` with at most `limit` factories in flight at once,
/// refilling a slot as soon as it frees. Rejects (cancelling every
/// other in-flight or not-yet-started task) as soon as any task rejects
/// or is cancelled; otherwise fulfills with the values in input order.
pub fn concurrent<K, T>(loop_: &Loop, tasks: Vec<(K, Factory<T>)>, limit: usize) -> Promise<Vec<(K, T)>>
where
    K: Clone + fmt::Display + 'static,
    T: Clone + 'static,
{
    let (result, resolver) = Promise::pending(loop_);
    if tasks.is_empty() {
        resolver.resolve(Vec::new());
        return result;
    }
    if let Err(e) = validate_limit(limit) {
        resolver.reject(e);
        return result;
    }

    let total = tasks.len();
    let keys: Vec<K> = tasks.iter().map(|(k, _)| k.clone()).collect();
    let queue: VecDeque<(usize, K, Factory<T>)> = tasks
        .into_iter()
        .enumerate()
        .map(|(idx, (k, f))| (idx, k, f))
        .collect();

    let ctx = Rc::new(ConcurrentCtx {
        queue: RefCell::new(queue),
        active: RefCell::new(Vec::new()),
        values: RefCell::new(vec![None; total]),
        completed: Cell::new(0),
        total,
        done: Cell::new(false),
        resolver,
        keys,
    });

    let ctx_for_cancel = ctx.clone();
    let _ = result.on_cancel(move || {
        if ctx_for_cancel.done.get() {
            return Ok(());
        }
        ctx_for_cancel.done.set(true);
        concurrent_short_circuit(&ctx_for_cancel);
        Ok(())
    });

    for _ in 0..limit.min(total) {
        concurrent_spawn_next(ctx.clone());
    }

    result
}

// ---- concurrent_settled ----------------------------------------------------

struct SettledCtx<K, T> {
    queue: RefCell<VecDeque<(usize, K, Factory<T>)>>,
    slots: RefCell<Vec<Option<SettledResult<T>>>>,
    completed: Cell<usize>,
    total: usize,
    resolver: Resolver<Vec<(K, SettledResult<T>)>>,
    keys: Vec<K>,
}

fn settled_spawn_next<K, T>(ctx: Rc<SettledCtx<K, T>>)
where
    K: Clone + 'static,
    T: Clone + 'static,
{
    let Some((idx, _key, factory)) = ctx.queue.borrow_mut().pop_front() else {
        return;
    };
    let promise = factory();

    let finish = |ctx: &Rc<SettledCtx<K, T>>| {
        ctx.completed.set(ctx.completed.get() + 1);
        if ctx.completed.get() == ctx.total {
            let out = ctx
                .keys
                .iter()
                .cloned()
                .zip(ctx.slots.borrow_mut().drain(..).map(|s| s.expect("all slots filled")))
                .collect();
            ctx.resolver.resolve(out);
        } else {
            settled_spawn_next(ctx.clone());
        }
    };

    let ctx_f = ctx.clone();
    let ctx_r = ctx.clone();
    let ctx_c = ctx;

    promise.tap(
        move |v| {
            ctx_f.slots.borrow_mut()[idx] = Some(SettledResult::Fulfilled(v));
            finish(&ctx_f);
        },
        move |r| {
            ctx_r.slots.borrow_mut()[idx] = Some(SettledResult::Rejected(r));
            finish(&ctx_r);
        },
        move || {
            ctx_c.slots.borrow_mut()[idx] = Some(SettledResult::Cancelled);
            finish(&ctx_c);
            Ok(())
        },
    );
}

/// Runs `tasks` with at most `limit` factories in flight, never
/// short-circuiting: every task runs to some terminal outcome and the
/// result always fulfills with the ordered outcomes.
pub fn concurrent_settled<K, T>(
    loop_: &Loop,
    tasks: Vec<(K, Factory<T>)>,
    limit: usize,
) -> Promise<Vec<(K, SettledResult<T>)>>
where
    K: Clone + 'static,
    T: Clone + 'static,
{
    let (result, resolver) = Promise::pending(loop_);
    if tasks.is_empty() {
        resolver.resolve(Vec::new());
        return result;
    }
    if let Err(e) = validate_limit(limit) {
        resolver.reject(e);
        return result;
    }

    let total = tasks.len();
    let keys: Vec<K> = tasks.iter().map(|(k, _)| k.clone()).collect();
    let queue: VecDeque<(usize, K, Factory<T>)> = tasks
        .into_iter()
        .enumerate()
        .map(|(idx, (k, f))| (idx, k, f))
        .collect();

    let ctx = Rc::new(SettledCtx {
        queue: RefCell::new(queue),
        slots: RefCell::new(vec![None; total]),
        completed: Cell::new(0),
        total,
        resolver,
        keys,
    });

    for _ in 0..limit.min(total) {
        settled_spawn_next(ctx.clone());
    }

    result
}

// ---- batch / batch_settled -------------------------------------------------

fn chunk<K, T>(tasks: Vec<(K, Factory<T>)>, batch_size: usize) -> Vec<Vec<(K, Factory<T>)>> {
    let mut chunks = Vec::new();
    let mut current = Vec::with_capacity(batch_size);
    for item in tasks {
        current.push(item);
        if current.len() == batch_size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(batch_size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Splits `tasks` into sequential batches of `batch_size`, running each
/// batch's tasks fully concurrently (at most `concurrency` in flight at
/// once, default `batch_size`) and waiting for the whole batch before
/// starting the next. Short-circuits like `all`/`concurrent`: a
/// rejection or cancellation anywhere stops further batches from
/// starting and cancels the rest of the current batch.
pub fn batch<K, T>(
    loop_: &Loop,
    tasks: Vec<(K, Factory<T>)>,
    batch_size: usize,
    concurrency: Option<usize>,
) -> Promise<Vec<(K, T)>>
where
    K: Clone + fmt::Display + 'static,
    T: Clone + 'static,
{
    if let Err(e) = validate_limit(batch_size) {
        return Promise::rejected(loop_, e);
    }
    let concurrency = concurrency.unwrap_or(batch_size);
    if let Err(e) = validate_limit(concurrency) {
        return Promise::rejected(loop_, e);
    }
    let chunks = chunk(tasks, batch_size);
    run_batches(loop_.clone(), chunks, concurrency, Vec::new())
}

fn run_batches<K, T>(
    loop_: Loop,
    mut chunks: Vec<Vec<(K, Factory<T>)>>,
    concurrency: usize,
    mut acc: Vec<(K, T)>,
) -> Promise<Vec<(K, T)>>
where
    K: Clone + fmt::Display + 'static,
    T: Clone + 'static,
{
    if chunks.is_empty() {
        return Promise::resolved(&loop_, acc);
    }
    let this_batch = chunks.remove(0);
    let batch_result = concurrent(&loop_, this_batch, concurrency);
    batch_result.then(move |mut values: Vec<(K, T)>| -> Outcome<Vec<(K, T)>> {
        acc.append(&mut values);
        Ok(Continuation::Chain(run_batches(loop_, chunks, concurrency, acc)))
    })
}

/// Like [`batch`], but every batch runs to completion with
/// [`concurrent_settled`] semantics and all batches always run — the
/// result always fulfills with every task's outcome in order.
pub fn batch_settled<K, T>(
    loop_: &Loop,
    tasks: Vec<(K, Factory<T>)>,
    batch_size: usize,
    concurrency: Option<usize>,
) -> Promise<Vec<(K, SettledResult<T>)>>
where
    K: Clone + 'static,
    T: Clone + 'static,
{
    if let Err(e) = validate_limit(batch_size) {
        return Promise::rejected(loop_, e);
    }
    let concurrency = concurrency.unwrap_or(batch_size);
    if let Err(e) = validate_limit(concurrency) {
        return Promise::rejected(loop_, e);
    }
    let chunks = chunk(tasks, batch_size);
    run_batches_settled(loop_.clone(), chunks, concurrency, Vec::new())
}

fn run_batches_settled<K, T>(
    loop_: Loop,
    mut chunks: Vec<Vec<(K, Factory<T>)>>,
    concurrency: usize,
    mut acc: Vec<(K, SettledResult<T>)>,
) -> Promise<Vec<(K, SettledResult<T>)>>
where
    K: Clone + 'static,
    T: Clone + 'static,
{
    if chunks.is_empty() {
        return Promise::resolved(&loop_, acc);
    }
    let this_batch = chunks.remove(0);
    let batch_result = concurrent_settled(&loop_, this_batch, concurrency);
    batch_result.then(move |mut values| -> Outcome<Vec<(K, SettledResult<T>)>> {
        acc.append(&mut values);
        Ok(Continuation::Chain(run_batches_settled(
            loop_, chunks, concurrency, acc,
        )))
    })
}

/// Applies `mapper` to every `(item, key)` pair with at most `limit`
/// calls in flight (default: unbounded), preserving input order — sugar
/// over [`concurrent`] for the common case of mapping a single function
/// over a collection instead of supplying bespoke per-item factories.
/// `mapper` may return a plain value (`Continuation::Value`) or chain
/// onto another promise (`Continuation::Chain`), mirroring `then`.
pub fn map<K, T, U, F>(
    loop_: &Loop,
    items: Vec<(K, T)>,
    limit: Option<usize>,
    mapper: F,
) -> Promise<Vec<(K, U)>>
where
    K: Clone + fmt::Display + 'static,
    T: 'static,
    U: Clone + 'static,
    F: Fn(T, K) -> Continuation<U> + Clone + 'static,
{
    let limit = limit.unwrap_or(usize::MAX);
    let loop_for_tasks = loop_.clone();
    let tasks: Vec<(K, Factory<U>)> = items
        .into_iter()
        .map(|(k, v)| {
            let mapper = mapper.clone();
            let loop_ = loop_for_tasks.clone();
            let key_for_call = k.clone();
            let factory: Factory<U> = Box::new(move || match mapper(v, key_for_call) {
                Continuation::Value(out) => Promise::resolved(&loop_, out),
                Continuation::Chain(p) => p,
            });
            (k, factory)
        })
        .collect();
    concurrent(loop_, tasks, limit)
}
