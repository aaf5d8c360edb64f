//! Combinators over collections of deferreds.
//!
//! Results are keyed by input index. Canceling a combined deferred cancels
//! every input; inputs that already settled ignore it.

use super::{Deferred, Resolution, StepResult};
use crate::error::Reason;
use core::cell::{Cell, RefCell};
use std::rc::Rc;

/// Waits for every input to settle.
///
/// Completes with the values in input order once all inputs fulfill. If any
/// input fails, the join fails after all inputs have settled, carrying the
/// lowest-indexed non-cancel failure (or the lowest-indexed cancellation
/// when nothing else failed). Progress updates from every input are
/// forwarded as they arrive.
pub fn join<T: Clone + 'static, P: Clone + 'static>(
    items: Vec<Deferred<T, P>>,
) -> Deferred<Vec<T>, P> {
    if items.is_empty() {
        return Deferred::wrap(Vec::new());
    }
    let items = Rc::new(items);
    let to_cancel = items.clone();
    Deferred::with_cancel(
        move || {
            for item in to_cancel.iter() {
                item.cancel();
            }
        },
        move |completer| {
            let count = items.len();
            let results: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new(vec![None; count]));
            let failures: Rc<RefCell<Vec<(usize, Reason)>>> = Rc::new(RefCell::new(Vec::new()));
            let remaining = Rc::new(Cell::new(count));

            for (index, item) in items.iter().enumerate() {
                let on_value = {
                    let results = results.clone();
                    let failures = failures.clone();
                    let remaining = remaining.clone();
                    let completer = completer.clone();
                    move |value: T| {
                        results.borrow_mut()[index] = Some(value);
                        settle_join(&remaining, &failures, &results, &completer);
                        Ok(Resolution::Value(()))
                    }
                };
                let on_failure = {
                    let results = results.clone();
                    let failures = failures.clone();
                    let remaining = remaining.clone();
                    let completer = completer.clone();
                    move |reason: Reason| {
                        failures.borrow_mut().push((index, reason));
                        settle_join(&remaining, &failures, &results, &completer);
                        Ok(Resolution::Value(()))
                    }
                };
                let on_progress = {
                    let completer = completer.clone();
                    move |p: &P| completer.progress(p.clone())
                };
                item.done(
                    Some(Box::new(on_value)),
                    Some(Box::new(on_failure)),
                    Some(Box::new(on_progress)),
                );
            }
            Ok(())
        },
    )
}

fn settle_join<T: Clone + 'static, P: Clone + 'static>(
    remaining: &Rc<Cell<usize>>,
    failures: &Rc<RefCell<Vec<(usize, Reason)>>>,
    results: &Rc<RefCell<Vec<Option<T>>>>,
    completer: &super::Completer<Vec<T>, P>,
) {
    let left = remaining.get() - 1;
    remaining.set(left);
    if left > 0 {
        return;
    }
    // Decide the outcome with the interior borrows released before settling,
    // since settlement runs listeners synchronously.
    let failure = {
        let mut failures = failures.borrow_mut();
        failures.sort_by_key(|(index, _)| *index);
        failures
            .iter()
            .find(|(_, r)| !r.is_canceled())
            .or_else(|| failures.first())
            .map(|(_, r)| r.clone())
    };
    match failure {
        Some(reason) => completer.error(reason),
        None => {
            let values: Vec<T> = results
                .borrow_mut()
                .iter_mut()
                .map(|slot| slot.take().expect("every settled input stored a value"))
                .collect();
            completer.complete(values);
        }
    }
}

/// Settles with the first input to settle.
///
/// Completes with `(index, value)` of the first fulfillment and cancels the
/// remaining inputs. If every input fails, fails like [`join`]. An empty
/// input set fails immediately.
pub fn any<T: Clone + 'static, P: Clone + 'static>(
    items: Vec<Deferred<T, P>>,
) -> Deferred<(usize, T), P> {
    if items.is_empty() {
        return Deferred::wrap_error(Reason::failure("any() requires at least one deferred"));
    }
    let items = Rc::new(items);
    let to_cancel = items.clone();
    Deferred::with_cancel(
        move || {
            for item in to_cancel.iter() {
                item.cancel();
            }
        },
        move |completer| {
            let count = items.len();
            let failures: Rc<RefCell<Vec<(usize, Reason)>>> = Rc::new(RefCell::new(Vec::new()));
            let remaining = Rc::new(Cell::new(count));

            for (index, item) in items.iter().enumerate() {
                let on_value = {
                    let completer = completer.clone();
                    let others = items.clone();
                    move |value: T| {
                        completer.complete((index, value));
                        for (j, other) in others.iter().enumerate() {
                            if j != index {
                                other.cancel();
                            }
                        }
                        Ok(Resolution::Value(()))
                    }
                };
                let on_failure = {
                    let completer = completer.clone();
                    let failures = failures.clone();
                    let remaining = remaining.clone();
                    move |reason: Reason| {
                        failures.borrow_mut().push((index, reason));
                        let left = remaining.get() - 1;
                        remaining.set(left);
                        if left == 0 {
                            let reason = {
                                let mut failures = failures.borrow_mut();
                                failures.sort_by_key(|(i, _)| *i);
                                failures
                                    .iter()
                                    .find(|(_, r)| !r.is_canceled())
                                    .or_else(|| failures.first())
                                    .map(|(_, r)| r.clone())
                                    .expect("failure list is non-empty")
                            };
                            completer.error(reason);
                        }
                        Ok(Resolution::Value(()))
                    }
                };
                item.done(Some(Box::new(on_value)), Some(Box::new(on_failure)), None);
            }
            Ok(())
        },
    )
}

/// Applies one handler to every input and joins the results.
pub fn then_each<T: Clone + 'static, U: Clone + 'static, P: Clone + 'static>(
    items: Vec<Deferred<T, P>>,
    handler: Rc<dyn Fn(T) -> StepResult<U, P>>,
) -> Deferred<Vec<U>, P> {
    join(
        items
            .into_iter()
            .map(|item| {
                let handler = handler.clone();
                item.then(move |value| handler(value), None, None)
            })
            .collect(),
    )
}

/// Couples a timer deferred with a target deferred.
///
/// Whichever settles first cancels the other: the timer firing (or failing
/// for any non-cancel reason) cancels the target, and the target settling
/// cancels the timer. There is no timer subsystem here — any deferred can be
/// the timer; the host typically completes one from a platform timeout.
pub fn with_timeout<T: Clone + 'static, P: Clone + 'static>(
    timer: Deferred<(), P>,
    target: Deferred<T, P>,
) -> Deferred<T, P> {
    let out = {
        let timer_on_value = timer.clone();
        let timer_on_error = timer.clone();
        target.then(
            move |value| {
                timer_on_value.cancel();
                Ok(Resolution::Value(value))
            },
            Some(Box::new(move |reason| {
                timer_on_error.cancel();
                Err(reason)
            })),
            None,
        )
    };
    let target_on_fire = target.clone();
    let target_on_error = target;
    timer.done(
        Some(Box::new(move |()| {
            target_on_fire.cancel();
            Ok(Resolution::Value(()))
        })),
        Some(Box::new(move |reason| {
            if !reason.is_canceled() {
                target_on_error.cancel();
            }
            Ok(Resolution::Value(()))
        })),
        None,
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Signal;
    use crate::test_utils::init_test_logging;

    fn observe<T: Clone + 'static, P: Clone + 'static>(
        d: &Deferred<T, P>,
    ) -> Rc<RefCell<Option<Result<T, Reason>>>> {
        let slot = Rc::new(RefCell::new(None));
        let ok = slot.clone();
        let err = slot.clone();
        d.then(
            move |v| {
                *ok.borrow_mut() = Some(Ok(v));
                Ok(Resolution::Value(()))
            },
            Some(Box::new(move |r| {
                *err.borrow_mut() = Some(Err(r));
                Ok(Resolution::Value(()))
            })),
            None,
        );
        slot
    }

    #[test]
    fn join_completes_in_input_order() {
        init_test_logging();
        let a = Signal::<i32>::new();
        let b = Signal::<i32>::new();
        let joined = join(vec![a.deferred(), b.deferred()]);
        let result = observe(&joined);

        // Settle out of order; results stay keyed by input index.
        b.complete(2);
        assert!(result.borrow().is_none());
        a.complete(1);
        assert_eq!(result.borrow_mut().take(), Some(Ok(vec![1, 2])));
    }

    #[test]
    fn join_fails_only_after_all_settle() {
        init_test_logging();
        let a = Signal::<i32>::new();
        let b = Signal::<i32>::new();
        let joined = join(vec![a.deferred(), b.deferred()]);
        let result = observe(&joined);

        a.error(Reason::failure("first down"));
        assert!(result.borrow().is_none(), "join waits for every input");
        b.complete(2);
        let failure = result.borrow_mut().take().expect("settled");
        assert_eq!(failure.expect_err("joined failed").message(), "first down");
    }

    #[test]
    fn join_of_nothing_completes_immediately() {
        init_test_logging();
        let joined = join::<i32, ()>(Vec::new());
        let result = observe(&joined);
        assert_eq!(result.borrow_mut().take(), Some(Ok(Vec::new())));
    }

    #[test]
    fn canceling_join_cancels_inputs() {
        init_test_logging();
        let a = Signal::<i32>::new();
        let b = Signal::<i32>::new();
        let a_result = observe(&a.deferred());
        let joined = join(vec![a.deferred(), b.deferred()]);
        joined.cancel();

        let failure = a_result.borrow_mut().take().expect("input settled");
        assert!(failure.expect_err("canceled").is_canceled());
    }

    #[test]
    fn any_takes_the_first_fulfillment_and_cancels_the_rest() {
        init_test_logging();
        let a = Signal::<i32>::new();
        let b = Signal::<i32>::new();
        let b_result = observe(&b.deferred());
        let first = any(vec![a.deferred(), b.deferred()]);
        let result = observe(&first);

        a.complete(10);
        assert_eq!(result.borrow_mut().take(), Some(Ok((0, 10))));
        let loser = b_result.borrow_mut().take().expect("loser settled");
        assert!(loser.expect_err("canceled").is_canceled());
    }

    #[test]
    fn any_fails_once_every_input_failed() {
        init_test_logging();
        let a = Signal::<i32>::new();
        let b = Signal::<i32>::new();
        let first = any(vec![a.deferred(), b.deferred()]);
        let result = observe(&first);

        a.error(Reason::failure("a failed"));
        assert!(result.borrow().is_none());
        b.error(Reason::failure("b failed"));
        let failure = result.borrow_mut().take().expect("settled");
        assert_eq!(failure.expect_err("any failed").message(), "a failed");
    }

    #[test]
    fn then_each_maps_every_value() {
        init_test_logging();
        let a = Signal::<i32>::new();
        let b = Signal::<i32>::new();
        let mapped = then_each(
            vec![a.deferred(), b.deferred()],
            Rc::new(|v| Ok(Resolution::Value(v * 10))),
        );
        let result = observe(&mapped);
        a.complete(1);
        b.complete(2);
        assert_eq!(result.borrow_mut().take(), Some(Ok(vec![10, 20])));
    }

    #[test]
    fn timeout_firing_cancels_the_target() {
        init_test_logging();
        let timer = Signal::<()>::new();
        let target = Signal::<i32>::new();
        let guarded = with_timeout(timer.deferred(), target.deferred());
        let result = observe(&guarded);

        timer.complete(());
        let failure = result.borrow_mut().take().expect("settled");
        assert!(failure.expect_err("timed out").is_canceled());
    }

    #[test]
    fn target_settling_cancels_the_timer() {
        init_test_logging();
        let timer = Signal::<()>::new();
        let target = Signal::<i32>::new();
        let timer_result = observe(&timer.deferred());
        let guarded = with_timeout(timer.deferred(), target.deferred());
        let result = observe(&guarded);

        target.complete(5);
        assert_eq!(result.borrow_mut().take(), Some(Ok(5)));
        let timer_outcome = timer_result.borrow_mut().take().expect("timer settled");
        assert!(timer_outcome.expect_err("canceled").is_canceled());
    }
}
