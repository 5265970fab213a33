//! Property-based tests for the invariants that benefit from randomized
//! shapes rather than a single fixed example (P1, P4, P6, P7, P8, P11,
//! P13, P16, P17). The remaining properties concern specific
//! cross-component wiring (e.g. P18's weak tracking) and are covered as
//! targeted unit/integration tests instead.

use proptest::prelude::*;
use promise_rt::{
    all, all_settled, batch, block_on, concurrent, new_loop, Continuation, Factory, Promise,
    PromiseError,
};
use std::cell::RefCell;
use std::rc::Rc;

proptest! {
    /// P1: a promise's terminal state, once reached, never changes no
    /// matter how many more operations are applied to it.
    #[test]
    fn p1_single_transition_is_absorbing(value in any::<i32>(), extra_cancels in 0..5usize) {
        let loop_ = new_loop();
        let p = Promise::resolved(&loop_, value);
        loop_.borrow_mut().run_until_idle();
        assert!(p.is_fulfilled());

        for _ in 0..extra_cancels {
            let _ = p.cancel();
        }
        prop_assert!(p.is_fulfilled());
        prop_assert_eq!(p.value(), Some(value));
    }

    /// P4: recursively nesting `resolved(resolved(...))` via `then`
    /// returning a `Continuation::Chain` unwraps to the innermost value
    /// for any finite nesting depth.
    #[test]
    fn p4_recursive_unwrapping_reaches_the_innermost_value(value in any::<i32>(), depth in 0..8usize) {
        let loop_ = new_loop();
        let mut p = Promise::resolved(&loop_, value);
        for _ in 0..depth {
            let inner_loop = loop_.clone();
            p = Promise::resolved(&loop_, ()).then(move |_| {
                Ok(Continuation::Chain(Promise::resolved(&inner_loop, value)))
            });
        }
        let result = block_on(&p, &loop_, true);
        prop_assert_eq!(result.unwrap(), value);
    }

    /// P6: reactions registered on a still-pending promise fire in the
    /// order they were registered, once it settles.
    #[test]
    fn p6_microtask_order_is_fifo(n in 1..8usize) {
        let loop_ = new_loop();
        let (p, resolver) = Promise::pending::<i32>(&loop_);
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..n {
            let order = order.clone();
            p.then_map(move |_| order.borrow_mut().push(i));
        }
        resolver.resolve(0);
        loop_.borrow_mut().run_until_idle();
        let recorded = order.borrow().clone();
        prop_assert_eq!(recorded, (0..n).collect::<Vec<_>>());
    }

    /// P7: a promise's own cancel handlers run in reverse registration
    /// order (LIFO).
    #[test]
    fn p7_cancel_handlers_run_lifo(n in 1..8usize) {
        let loop_ = new_loop();
        let (p, _resolver) = Promise::pending::<i32>(&loop_);
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..n {
            let order = order.clone();
            p.on_cancel(move || {
                order.borrow_mut().push(i);
                Ok(())
            }).unwrap();
        }
        p.cancel().unwrap();
        let recorded = order.borrow().clone();
        let expected: Vec<usize> = (0..n).rev().collect();
        prop_assert_eq!(recorded, expected);
    }

    /// P8: a cancellation token's callbacks run in registration order,
    /// and any cancel after the first is a no-op.
    #[test]
    fn p8_token_callbacks_run_fifo_and_later_cancels_are_noops(n in 1..8usize) {
        use promise_rt::CancellationToken;

        let token = CancellationToken::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..n {
            let order = order.clone();
            token.on_cancel(move |_| order.borrow_mut().push(i));
        }
        token.cancel(Rc::new(PromiseError::Cycle));
        let first_reason = token.reason().unwrap();
        token.cancel(Rc::new(PromiseError::Cycle));

        let recorded = order.borrow().clone();
        prop_assert_eq!(recorded, (0..n).collect::<Vec<_>>());
        prop_assert!(Rc::ptr_eq(&token.reason().unwrap(), &first_reason));
    }

    /// P11: when every input to `all` fulfills, the output preserves the
    /// input's key order regardless of how the values are shuffled.
    #[test]
    fn p11_all_preserves_key_order(values in prop::collection::vec(any::<i32>(), 1..8)) {
        let loop_ = new_loop();
        let inputs: Vec<(usize, Promise<i32>)> = values
            .iter()
            .enumerate()
            .map(|(i, v)| (i, Promise::resolved(&loop_, *v)))
            .collect();
        let expected: Vec<(usize, i32)> = values.iter().cloned().enumerate().collect();
        let result = all(&loop_, inputs);
        let out = block_on(&result, &loop_, true).unwrap();
        prop_assert_eq!(out, expected);
    }

    /// P13: `all_settled` never rejects, always returns one outcome per
    /// input, in order, regardless of the mix of fulfilled/rejected
    /// inputs.
    #[test]
    fn p13_all_settled_never_rejects_and_preserves_length(
        outcomes in prop::collection::vec(any::<bool>(), 1..8)
    ) {
        let loop_ = new_loop();
        let total = outcomes.len();
        let inputs: Vec<(usize, Promise<i32>)> = outcomes
            .iter()
            .enumerate()
            .map(|(i, fulfil)| {
                let p = if *fulfil {
                    Promise::resolved(&loop_, i as i32)
                } else {
                    Promise::rejected(&loop_, Rc::new(PromiseError::Cycle))
                };
                (i, p)
            })
            .collect();
        let result = all_settled(&loop_, inputs);
        let settled = block_on(&result, &loop_, true).unwrap();
        prop_assert_eq!(settled.len(), total);
        for (i, (key, outcome)) in settled.iter().enumerate() {
            prop_assert_eq!(*key, i);
            prop_assert_eq!(outcome.is_fulfilled(), outcomes[i]);
        }
    }

    /// P16: at no point does `concurrent` run more than `limit` tasks at
    /// once, for varying task counts and limits.
    #[test]
    fn p16_concurrent_never_exceeds_its_limit(total in 1..12usize, limit in 1..6usize) {
        let loop_ = new_loop();
        let in_flight = Rc::new(std::cell::Cell::new(0usize));
        let peak = Rc::new(std::cell::Cell::new(0usize));

        let tasks: Vec<(usize, Factory<i32>)> = (0..total)
            .map(|i| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                let loop_ = loop_.clone();
                let factory: Factory<i32> = Box::new(move || {
                    in_flight.set(in_flight.get() + 1);
                    peak.set(peak.get().max(in_flight.get()));
                    let in_flight2 = in_flight.clone();
                    Promise::resolved(&loop_, ()).then_map(move |_| {
                        in_flight2.set(in_flight2.get() - 1);
                        i as i32
                    })
                });
                (i, factory)
            })
            .collect();

        let result = concurrent(&loop_, tasks, limit);
        let values = block_on(&result, &loop_, true).unwrap();
        prop_assert_eq!(values.len(), total);
        prop_assert!(peak.get() <= limit);
    }

    /// P17: `batch` preserves full input insertion order in its output,
    /// regardless of batch size.
    #[test]
    fn p17_batch_preserves_input_order(total in 1..12usize, batch_size in 1..6usize) {
        let loop_ = new_loop();
        let tasks: Vec<(usize, Factory<i32>)> = (0..total)
            .map(|i| {
                let loop_ = loop_.clone();
                let factory: Factory<i32> =
                    Box::new(move || Promise::resolved(&loop_, i as i32));
                (i, factory)
            })
            .collect();
        let result = batch(&loop_, tasks, batch_size, None);
        let values = block_on(&result, &loop_, true).unwrap();
        let expected: Vec<(usize, i32)> = (0..total).map(|i| (i, i as i32)).collect();
        prop_assert_eq!(values, expected);
    }
}
