//! Already-settled deferred representations and the synchronous fast path.
//!
//! A deferred that is born settled — `wrap`, `wrap_error`, or the result of a
//! handler running against a terminal instance — carries no listener
//! bookkeeping: only the outcome. `then`/`done` against these behave exactly
//! like the full state machine's terminal phases, invoking handlers
//! synchronously at call time.

use super::diagnostics;
use super::{Deferred, DoneHandler, ErrorHandler, Resolution, StepResult};
use crate::error::Reason;
use crate::types::DiagId;
use std::rc::Rc;

/// Outcome-only representation of a fulfilled deferred.
pub(crate) struct FulfilledRepr<T> {
    pub(crate) diag: DiagId,
    pub(crate) value: T,
}

impl<T> FulfilledRepr<T> {
    pub(crate) fn new(value: T) -> Rc<Self> {
        Rc::new(Self {
            diag: DiagId::next(),
            value,
        })
    }
}

/// Outcome-only representation of a rejected deferred (explicit or thrown;
/// the distinction lives in the reason's origin tag).
pub(crate) struct RejectedRepr {
    pub(crate) diag: DiagId,
    pub(crate) reason: Reason,
}

impl RejectedRepr {
    pub(crate) fn new(reason: Reason) -> Rc<Self> {
        Rc::new(Self {
            diag: DiagId::next(),
            reason,
        })
    }
}

/// Runs a completion handler against a settled value.
pub(crate) fn sync_complete<T, U: Clone + 'static, P: Clone + 'static>(
    value: T,
    parent: DiagId,
    on_complete: Box<dyn FnOnce(T) -> StepResult<U, P>>,
) -> Deferred<U, P> {
    match on_complete(value) {
        Ok(Resolution::Value(u)) => Deferred::wrap(u),
        Ok(Resolution::Chain(d)) => d,
        Err(thrown) => Deferred::thrown(thrown, parent),
    }
}

/// Runs an error handler against a settled failure.
///
/// `reuse` is the existing rejected representation, handed back unchanged
/// when the handler is absent or rethrows the identical failure — an
/// identity-preserving optimization, not an observable behavior change.
pub(crate) fn sync_recover<U: Clone + 'static, P: Clone + 'static>(
    reason: Reason,
    parent: DiagId,
    reuse: Option<&Rc<RejectedRepr>>,
    on_error: Option<ErrorHandler<U, P>>,
) -> Deferred<U, P> {
    match on_error {
        Some(handler) => {
            reason.mark_observed();
            match handler(reason.clone()) {
                Ok(Resolution::Value(u)) => Deferred::wrap(u),
                Ok(Resolution::Chain(d)) => d,
                Err(thrown) if thrown.same_chain(&reason) => match reuse {
                    Some(repr) => Deferred::from_rejected_repr(repr.clone()),
                    None => Deferred::propagate_failure(thrown),
                },
                Err(thrown) => Deferred::thrown(thrown, parent),
            }
        }
        None => match reuse {
            Some(repr) => Deferred::from_rejected_repr(repr.clone()),
            None => Deferred::propagate_failure(reason),
        },
    }
}

/// `done` against a settled value.
pub(crate) fn sync_done_value<T, P: Clone + 'static>(
    value: T,
    parent: DiagId,
    on_complete: Option<DoneHandler<T, P>>,
) {
    let Some(handler) = on_complete else {
        return;
    };
    match handler(value) {
        Ok(Resolution::Value(())) => {}
        // A chained result from a done handler is observed only for
        // failures, which resurface through the rethrow hook.
        Ok(Resolution::Chain(d)) => d.done(None, None, None),
        Err(thrown) => {
            if !thrown.already_reported() {
                thrown.mark_exception();
            }
            diagnostics::report(parent, &thrown);
            diagnostics::rethrow(thrown);
        }
    }
}

/// `done` against a settled failure: unhandled non-cancel failures rethrow
/// asynchronously on a fresh scheduler turn.
pub(crate) fn sync_done_failure<P: Clone + 'static>(
    reason: Reason,
    parent: DiagId,
    on_error: Option<ErrorHandler<(), P>>,
) {
    match on_error {
        Some(handler) => {
            reason.mark_observed();
            match handler(reason.clone()) {
                Ok(Resolution::Value(())) => {}
                Ok(Resolution::Chain(d)) => d.done(None, None, None),
                Err(thrown) if thrown.same_chain(&reason) => diagnostics::rethrow(thrown),
                Err(thrown) => {
                    if !thrown.already_reported() {
                        thrown.mark_exception();
                    }
                    diagnostics::report(parent, &thrown);
                    diagnostics::rethrow(thrown);
                }
            }
        }
        None => diagnostics::rethrow(reason),
    }
}
