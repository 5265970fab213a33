//! Keyed collection combinators: `all`, `all_settled`, `race`, `any`, and
//! `timeout`. Every combinator takes its inputs as an ordered
//! `Vec<(K, Promise<T>)>` rather than a map, so the output preserves
//! insertion order without requiring `K: Hash + Eq` — only `Clone` and a
//! way to render the key into an error message.

use crate::error::{AggregateError, PromiseError, Reason};
use crate::promise::{Loop, Promise};
use crate::settled::SettledResult;
use crate::timer::delay;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

fn cancel_rest<K, T: Clone + 'static>(inputs: &[(K, Promise<T>)], except: usize) {
    for (idx, (_, p)) in inputs.iter().enumerate() {
        if idx != except && !p.is_settled() {
            let _ = p.cancel_chain();
        }
    }
}

/// Waits for every input to fulfill, producing their values in input
/// order. Rejects (and cancels every other still-pending input) as soon
/// as any input rejects or is cancelled.
pub fn all<K, T>(loop_: &Loop, inputs: Vec<(K, Promise<T>)>) -> Promise<Vec<(K, T)>>
where
    K: Clone + fmt::Display + 'static,
    T: Clone + 'static,
{
    let (result, resolver) = Promise::pending(loop_);
    if inputs.is_empty() {
        resolver.resolve(Vec::new());
        return result;
    }

    for (idx, (key, p)) in inputs.iter().enumerate() {
        if p.is_cancelled() {
            let reason = Rc::new(PromiseError::Cancelled {
                key: Some(key.to_string()),
            });
            resolver.reject(reason);
            cancel_rest(&inputs, idx);
            return result;
        }
    }

    let total = inputs.len();
    let completed = Rc::new(Cell::new(0usize));
    let done = Rc::new(Cell::new(false));
    let values: Rc<std::cell::RefCell<Vec<Option<T>>>> =
        Rc::new(std::cell::RefCell::new(vec![None; total]));
    let keys: Rc<Vec<K>> = Rc::new(inputs.iter().map(|(k, _)| k.clone()).collect());
    let inputs_rc: Rc<Vec<(K, Promise<T>)>> = Rc::new(inputs);

    for idx in 0..total {
        let resolver_f = resolver.clone();
        let values_f = values.clone();
        let completed_f = completed.clone();
        let done_f = done.clone();
        let keys_f = keys.clone();

        let resolver_r = resolver.clone();
        let done_r = done.clone();
        let inputs_r = inputs_rc.clone();

        let resolver_c = resolver.clone();
        let done_c = done.clone();
        let inputs_c = inputs_rc.clone();
        let key_c = keys[idx].clone();

        inputs_rc[idx].1.tap(
            move |v| {
                if done_f.get() {
                    return;
                }
                values_f.borrow_mut()[idx] = Some(v);
                completed_f.set(completed_f.get() + 1);
                if completed_f.get() == total {
                    done_f.set(true);
                    let out = keys_f
                        .iter()
                        .cloned()
                        .zip(values_f.borrow_mut().drain(..).map(|v| v.expect("all slots filled")))
                        .collect();
                    resolver_f.resolve(out);
                }
            },
            move |r| {
                if done_r.get() {
                    return;
                }
                done_r.set(true);
                resolver_r.reject(r);
                cancel_rest(&inputs_r, idx);
            },
            move || {
                if done_c.get() {
                    return Ok(());
                }
                done_c.set(true);
                resolver_c.reject(Rc::new(PromiseError::Cancelled {
                    key: Some(key_c.to_string()),
                }));
                cancel_rest(&inputs_c, idx);
                Ok(())
            },
        );
    }

    result
}

/// Waits for every input to settle (fulfilled, rejected, or cancelled)
/// and always fulfills with the ordered outcomes — never rejects.
pub fn all_settled<K, T>(loop_: &Loop, inputs: Vec<(K, Promise<T>)>) -> Promise<Vec<(K, SettledResult<T>)>>
where
    K: Clone + 'static,
    T: Clone + 'static,
{
    let (result, resolver) = Promise::pending(loop_);
    if inputs.is_empty() {
        resolver.resolve(Vec::new());
        return result;
    }

    let total = inputs.len();
    let completed = Rc::new(Cell::new(0usize));
    let slots: Rc<std::cell::RefCell<Vec<Option<SettledResult<T>>>>> =
        Rc::new(std::cell::RefCell::new(vec![None; total]));
    let keys: Rc<Vec<K>> = Rc::new(inputs.iter().map(|(k, _)| k.clone()).collect());

    for (idx, (_, p)) in inputs.into_iter().enumerate() {
        let slots_f = slots.clone();
        let completed_f = completed.clone();
        let resolver_f = resolver.clone();
        let keys_f = keys.clone();

        let slots_r = slots.clone();
        let completed_r = completed.clone();
        let resolver_r = resolver.clone();
        let keys_r = keys.clone();

        let slots_c = slots.clone();
        let completed_c = completed.clone();
        let resolver_c = resolver.clone();
        let keys_c = keys.clone();

        let finish = move |slots: &Rc<std::cell::RefCell<Vec<Option<SettledResult<T>>>>>,
                            completed: &Rc<Cell<usize>>,
                            keys: &Rc<Vec<K>>,
                            resolver: &crate::promise::Resolver<Vec<(K, SettledResult<T>)>>| {
            completed.set(completed.get() + 1);
            if completed.get() == total {
                let out = keys
                    .iter()
                    .cloned()
                    .zip(slots.borrow_mut().drain(..).map(|s| s.expect("all slots filled")))
                    .collect();
                resolver.resolve(out);
            }
        };

        p.tap(
            move |v| {
                slots_f.borrow_mut()[idx] = Some(SettledResult::Fulfilled(v));
                finish(&slots_f, &completed_f, &keys_f, &resolver_f);
            },
            move |r| {
                slots_r.borrow_mut()[idx] = Some(SettledResult::Rejected(r));
                finish(&slots_r, &completed_r, &keys_r, &resolver_r);
            },
            move || {
                slots_c.borrow_mut()[idx] = Some(SettledResult::Cancelled);
                finish(&slots_c, &completed_c, &keys_c, &resolver_c);
                Ok(())
            },
        );
    }

    result
}

/// Settles with the first input to settle, tagged with its key, fanning
/// cancellation out to every other still-pending input. Rejects with
/// [`PromiseError::EmptyRace`] if `inputs` is empty. Cancelling the
/// returned promise itself fans cancellation out to every input.
pub fn race<K, T>(loop_: &Loop, inputs: Vec<(K, Promise<T>)>) -> Promise<(K, T)>
where
    K: Clone + fmt::Display + 'static,
    T: Clone + 'static,
{
    let (result, resolver) = Promise::pending(loop_);
    if inputs.is_empty() {
        resolver.reject(Rc::new(PromiseError::EmptyRace));
        return result;
    }

    let done = Rc::new(Cell::new(false));
    let inputs_rc: Rc<Vec<(K, Promise<T>)>> = Rc::new(inputs);

    let inputs_for_cancel = inputs_rc.clone();
    let done_for_cancel = done.clone();
    let _ = result.on_cancel(move || {
        if done_for_cancel.get() {
            return Ok(());
        }
        done_for_cancel.set(true);
        cancel_rest(&inputs_for_cancel, usize::MAX);
        Ok(())
    });

    for idx in 0..inputs_rc.len() {
        let key = inputs_rc[idx].0.clone();
        let resolver_f = resolver.clone();
        let done_f = done.clone();
        let inputs_f = inputs_rc.clone();
        let key_f = key.clone();

        let resolver_r = resolver.clone();
        let done_r = done.clone();
        let inputs_r = inputs_rc.clone();

        let resolver_c = resolver.clone();
        let done_c = done.clone();
        let inputs_c = inputs_rc.clone();
        let key_c = key;

        inputs_rc[idx].1.tap(
            move |v| {
                if done_f.get() {
                    return;
                }
                done_f.set(true);
                resolver_f.resolve((key_f, v));
                cancel_rest(&inputs_f, idx);
            },
            move |r| {
                if done_r.get() {
                    return;
                }
                done_r.set(true);
                resolver_r.reject(r);
                cancel_rest(&inputs_r, idx);
            },
            move || {
                if done_c.get() {
                    return Ok(());
                }
                done_c.set(true);
                resolver_c.reject(Rc::new(PromiseError::Cancelled {
                    key: Some(key_c.to_string()),
                }));
                cancel_rest(&inputs_c, idx);
                Ok(())
            },
        );
    }

    result
}

/// Settles with the first input to fulfill, tagged with its key.
/// Rejects with an [`AggregateError`] only once every input has rejected
/// or been cancelled; rejects immediately with an empty `AggregateError`
/// if `inputs` is empty.
pub fn any<K, T>(loop_: &Loop, inputs: Vec<(K, Promise<T>)>) -> Promise<(K, T)>
where
    K: Clone + fmt::Display + 'static,
    T: Clone + 'static,
{
    let (result, resolver) = Promise::pending(loop_);
    if inputs.is_empty() {
        resolver.reject(Rc::new(PromiseError::Aggregate(AggregateError {
            causes: Vec::new(),
        })));
        return result;
    }

    let total = inputs.len();
    let done = Rc::new(Cell::new(false));
    let failed = Rc::new(Cell::new(0usize));
    let causes: Rc<std::cell::RefCell<Vec<Option<(String, Reason)>>>> =
        Rc::new(std::cell::RefCell::new(vec![None; total]));
    let inputs_rc: Rc<Vec<(K, Promise<T>)>> = Rc::new(inputs);

    for idx in 0..inputs_rc.len() {
        let key = inputs_rc[idx].0.clone();

        let resolver_f = resolver.clone();
        let done_f = done.clone();
        let inputs_f = inputs_rc.clone();
        let key_f = key.clone();

        let causes_r = causes.clone();
        let failed_r = failed.clone();
        let resolver_r = resolver.clone();
        let done_r = done.clone();
        let key_r = key.clone();

        let causes_c = causes.clone();
        let failed_c = failed.clone();
        let resolver_c = resolver.clone();
        let done_c = done.clone();
        let key_c = key;

        let record_failure = move |causes: &Rc<std::cell::RefCell<Vec<Option<(String, Reason)>>>>,
                                    failed: &Rc<Cell<usize>>,
                                    done: &Rc<Cell<bool>>,
                                    resolver: &crate::promise::Resolver<(K, T)>,
                                    key: String,
                                    reason: Reason| {
            if done.get() {
                return;
            }
            causes.borrow_mut()[idx] = Some((key, reason));
            failed.set(failed.get() + 1);
            if failed.get() == total {
                let all_causes = causes
                    .borrow_mut()
                    .drain(..)
                    .map(|c| c.expect("all slots filled"))
                    .collect();
                resolver.reject(Rc::new(PromiseError::Aggregate(AggregateError {
                    causes: all_causes,
                })));
            }
        };

        inputs_rc[idx].1.tap(
            move |v| {
                if done_f.get() {
                    return;
                }
                done_f.set(true);
                resolver_f.resolve((key_f, v));
                cancel_rest(&inputs_f, idx);
            },
            move |r| record_failure(&causes_r, &failed_r, &done_r, &resolver_r, key_r.to_string(), r),
            move || {
                record_failure(
                    &causes_c,
                    &failed_c,
                    &done_c,
                    &resolver_c,
                    key_c.to_string(),
                    Rc::new(PromiseError::Cancelled {
                        key: Some(key_c.to_string()),
                    }),
                );
                Ok(())
            },
        );
    }

    result
}

/// Races `p` against a `duration`-long timer. If `p` settles first, its
/// outcome passes through unchanged and the timer is cancelled. If the
/// timer fires first, `p`'s whole chain is cancelled and the result
/// rejects with [`PromiseError::Timeout`]. `duration` must be non-zero —
/// a zero duration rejects immediately with
/// [`PromiseError::InvalidArgument`]. Cancelling the returned promise
/// cancels both `p` and the timer.
pub fn timeout<T: Clone + 'static>(loop_: &Loop, p: Promise<T>, duration: Duration) -> Promise<T> {
    if duration.is_zero() {
        return Promise::rejected(
            loop_,
            Rc::new(PromiseError::InvalidArgument("timeout duration must be > 0")),
        );
    }

    let (result, resolver) = Promise::pending(loop_);
    let timer = delay(loop_, duration);
    let done = Rc::new(Cell::new(false));

    let p_for_timer_branch = p.clone();
    let resolver_for_timer = resolver.clone();
    let done_for_timer = done.clone();
    timer.tap(
        move |()| {
            if done_for_timer.get() {
                return;
            }
            done_for_timer.set(true);
            let _ = p_for_timer_branch.cancel_chain();
            resolver_for_timer.reject(Rc::new(PromiseError::Timeout(duration)));
        },
        |_| {},
        || Ok(()),
    );

    let timer_for_fulfill = timer.clone();
    let resolver_f = resolver.clone();
    let done_f = done.clone();
    let timer_for_reject = timer.clone();
    let resolver_r = resolver.clone();
    let done_r = done.clone();
    let resolver_c = resolver.clone();
    let done_c = done.clone();

    p.tap(
        move |v| {
            if done_f.get() {
                return;
            }
            done_f.set(true);
            let _ = timer_for_fulfill.cancel();
            resolver_f.resolve(v);
        },
        move |r| {
            if done_r.get() {
                return;
            }
            done_r.set(true);
            let _ = timer_for_reject.cancel();
            resolver_r.reject(r);
        },
        move || {
            if done_c.get() {
                return Ok(());
            }
            done_c.set(true);
            resolver_c.reject(Rc::new(PromiseError::Cancelled { key: None }));
            Ok(())
        },
    );

    let p_for_cancel = p.clone();
    let timer_for_cancel = timer.clone();
    let done_for_cancel = done.clone();
    let _ = result.on_cancel(move || {
        if done_for_cancel.get() {
            return Ok(());
        }
        done_for_cancel.set(true);
        let _ = p_for_cancel.cancel_chain();
        let _ = timer_for_cancel.cancel();
        Ok(())
    });

    result
}
