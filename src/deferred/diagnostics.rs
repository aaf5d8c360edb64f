//! Process-wide failure diagnostics.
//!
//! Two hooks live here, both thread-local because the substrate is
//! single-threaded:
//!
//! - the **unhandled-error channel**: every originated (not merely
//!   propagated) failure is reported here exactly once per causal chain;
//! - the **rethrow hook**: `done` routes unhandled failures through it so
//!   they resurface on a fresh scheduler turn instead of being swallowed.
//!   [`Scheduler::install_rethrow_hook`](crate::scheduler::Scheduler::install_rethrow_hook)
//!   wires it to a normal-priority job that panics with the failure.
//!
//! Cancellation never reaches either hook.

use crate::error::{Origin, Reason, ReasonKind};
use crate::types::{DiagId, ErrorId};
use core::cell::{Cell, RefCell};
use std::rc::Rc;

/// A report delivered on the unhandled-error channel.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Causal chain id of the failure.
    pub id: ErrorId,
    /// Explicit rejection vs uncaught throw.
    pub origin: Origin,
    /// Failure classification.
    pub kind: ReasonKind,
    /// Diagnostic id of the deferred the failure originated in.
    pub parent_context: DiagId,
    /// True if some error handler on the chain had been registered when the
    /// report fired.
    pub handled: bool,
    /// Human-readable failure message.
    pub message: String,
}

type ErrorHook = Rc<dyn Fn(&ErrorEvent)>;
type RethrowHook = Rc<dyn Fn(Reason)>;

thread_local! {
    static SUBSCRIBERS: RefCell<Vec<(u64, ErrorHook)>> = const { RefCell::new(Vec::new()) };
    static NEXT_SUBSCRIBER: Cell<u64> = const { Cell::new(1) };
    static RETHROW: RefCell<Option<RethrowHook>> = const { RefCell::new(None) };
}

/// Subscription guard for the unhandled-error channel.
///
/// Dropping it unsubscribes the hook.
#[must_use = "dropping the subscription unsubscribes the hook"]
#[derive(Debug)]
pub struct ErrorSubscription {
    id: u64,
}

impl Drop for ErrorSubscription {
    fn drop(&mut self) {
        SUBSCRIBERS.with(|subs| subs.borrow_mut().retain(|(id, _)| *id != self.id));
    }
}

/// Registers a hook on the unhandled-error channel.
pub fn subscribe_errors(hook: impl Fn(&ErrorEvent) + 'static) -> ErrorSubscription {
    let id = NEXT_SUBSCRIBER.with(|n| {
        let id = n.get();
        n.set(id + 1);
        id
    });
    SUBSCRIBERS.with(|subs| subs.borrow_mut().push((id, Rc::new(hook))));
    ErrorSubscription { id }
}

/// Delivers an originated failure to every subscriber.
pub(crate) fn emit(event: &ErrorEvent) {
    tracing::debug!(
        id = event.id.get(),
        origin = ?event.origin,
        parent = %event.parent_context,
        handled = event.handled,
        message = %event.message,
        "error originated"
    );
    // Snapshot so hooks may (un)subscribe re-entrantly.
    let hooks: Vec<ErrorHook> =
        SUBSCRIBERS.with(|subs| subs.borrow().iter().map(|(_, h)| h.clone()).collect());
    for hook in hooks {
        hook(event);
    }
}

/// Reports an originating failure on the channel, once per causal chain.
///
/// Propagated failures (already reported) and cancellation are no-ops.
pub(crate) fn report(parent_context: DiagId, reason: &Reason) {
    if !reason.claim_report() {
        return;
    }
    emit(&ErrorEvent {
        id: reason.id(),
        origin: reason.origin(),
        kind: reason.kind(),
        parent_context,
        handled: reason.was_observed(),
        message: reason.message().to_string(),
    });
}

/// Installs the rethrow hook, replacing any previous one.
pub fn set_rethrow_hook(hook: impl Fn(Reason) + 'static) {
    RETHROW.with(|cell| *cell.borrow_mut() = Some(Rc::new(hook)));
}

/// Removes the rethrow hook; unhandled failures panic at the rethrow site.
pub fn clear_rethrow_hook() {
    RETHROW.with(|cell| *cell.borrow_mut() = None);
}

/// Routes an unhandled failure out of `done`.
///
/// Cancellation is always suppressed. Without an installed hook the failure
/// panics immediately — an unhandled failure is a bug, and silence would
/// hide it.
pub(crate) fn rethrow(reason: Reason) {
    if reason.is_canceled() {
        tracing::trace!(id = reason.id().get(), "suppressing canceled failure");
        return;
    }
    let hook = RETHROW.with(|cell| cell.borrow().clone());
    match hook {
        Some(hook) => {
            tracing::debug!(id = reason.id().get(), "rethrowing unhandled failure");
            hook(reason);
        }
        None => panic!("unhandled deferred failure: {reason}"),
    }
}
