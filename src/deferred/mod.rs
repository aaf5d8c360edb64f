//! Deferred values: composition for work whose result is not yet known.
//!
//! A [`Deferred<T, P>`] is a handle to a value of type `T` that may not exist
//! yet, with progress updates of type `P` (default `()`). Continuations are
//! registered with [`then`](Deferred::then) / [`done`](Deferred::done);
//! producers drive a deferred through a [`Completer`] or a
//! [`Signal`](signal::Signal).
//!
//! Handlers return [`StepResult`]: `Ok(Resolution::Value(_))` to settle with
//! a value, `Ok(Resolution::Chain(_))` to settle with another deferred
//! (flattened automatically), or `Err(_)` to fail — the explicit counterpart
//! of throwing.
//!
//! On an already-settled instance, `then` invokes its handler synchronously
//! at call time rather than on a later turn. This is a deliberate divergence
//! from queued-microtask promise semantics: the host has no native microtask
//! queue, and synchronous invocation keeps ordering predictable for resolved
//! values. Downstream code relies on it; do not "fix" it toward deferral.

pub(crate) mod core;
pub mod diagnostics;
pub(crate) mod notify;
pub(crate) mod settled;

pub mod combine;
pub mod signal;

use self::core::CoreNode;
use self::settled::{FulfilledRepr, RejectedRepr};
use crate::error::Reason;
use crate::types::DiagId;
use std::rc::{Rc, Weak};

pub use signal::Signal;

/// What a completion carries: a plain value, or another deferred to flatten.
pub enum Resolution<T, P = ()> {
    /// Settle with this value.
    Value(T),
    /// Settle once this deferred settles, with its outcome.
    Chain(Deferred<T, P>),
}

/// Result of a continuation handler; `Err` is the explicit form of throwing.
pub type StepResult<T, P = ()> = Result<Resolution<T, P>, Reason>;

/// Boxed error handler for [`Deferred::then`].
pub type ErrorHandler<U, P = ()> = Box<dyn FnOnce(Reason) -> StepResult<U, P>>;

/// Boxed completion handler for [`Deferred::done`].
pub type DoneHandler<T, P = ()> = Box<dyn FnOnce(T) -> StepResult<(), P>>;

/// Boxed progress handler.
pub type ProgressHandler<P> = Box<dyn Fn(&P)>;

pub(crate) enum Repr<T, P> {
    Core(Rc<CoreNode<T, P>>),
    Fulfilled(Rc<FulfilledRepr<T>>),
    Rejected(Rc<RejectedRepr>),
    Thrown(Rc<RejectedRepr>),
}

impl<T, P> Clone for Repr<T, P> {
    fn clone(&self) -> Self {
        match self {
            Self::Core(n) => Self::Core(n.clone()),
            Self::Fulfilled(n) => Self::Fulfilled(n.clone()),
            Self::Rejected(n) => Self::Rejected(n.clone()),
            Self::Thrown(n) => Self::Thrown(n.clone()),
        }
    }
}

/// A deferred value: either a full pending state machine or a lightweight
/// already-settled representation.
///
/// Cloning is cheap and shares the underlying instance.
pub struct Deferred<T, P = ()> {
    repr: Repr<T, P>,
}

impl<T, P> Clone for Deferred<T, P> {
    fn clone(&self) -> Self {
        Self {
            repr: self.repr.clone(),
        }
    }
}

impl<T: Clone + 'static, P: Clone + 'static> Deferred<T, P> {
    /// Creates a pending deferred driven by `init`.
    ///
    /// `init` receives the producer handle; a failure returned from it
    /// becomes the deferred's error value, tagged as a thrown exception.
    pub fn new(init: impl FnOnce(&Completer<T, P>) -> Result<(), Reason>) -> Self {
        Self::build(None, init)
    }

    /// Like [`Deferred::new`], with a callback invoked on cancellation.
    pub fn with_cancel(
        on_cancel: impl FnOnce() + 'static,
        init: impl FnOnce(&Completer<T, P>) -> Result<(), Reason>,
    ) -> Self {
        Self::build(Some(Box::new(on_cancel)), init)
    }

    fn build(
        on_cancel: Option<Box<dyn FnOnce()>>,
        init: impl FnOnce(&Completer<T, P>) -> Result<(), Reason>,
    ) -> Self {
        let node = CoreNode::new();
        node.enter();
        if let Some(action) = on_cancel {
            node.set_cancel_action(action);
        }
        let completer = Completer {
            node: Rc::downgrade(&node),
        };
        if let Err(reason) = init(&completer) {
            node.fail_from_init(reason);
        }
        Self::from_core(node)
    }

    /// Lifts a plain value into an already-fulfilled deferred.
    #[must_use]
    pub fn wrap(value: T) -> Self {
        Self {
            repr: Repr::Fulfilled(FulfilledRepr::new(value)),
        }
    }

    /// Lifts a failure into an already-rejected deferred.
    ///
    /// The failure originates here: it is reported on the unhandled-error
    /// channel (unless it is the cancellation sentinel or was already
    /// reported upstream).
    #[must_use]
    pub fn wrap_error(reason: Reason) -> Self {
        let repr = RejectedRepr::new(reason);
        diagnostics::report(repr.diag, &repr.reason);
        Self {
            repr: Repr::Rejected(repr),
        }
    }

    /// The explicit value-or-deferred coercion.
    #[must_use]
    pub fn from_resolution(resolution: Resolution<T, P>) -> Self {
        match resolution {
            Resolution::Value(v) => Self::wrap(v),
            Resolution::Chain(d) => d,
        }
    }

    /// Registers continuations and returns the chained deferred.
    ///
    /// On a settled instance the relevant handler runs synchronously, now.
    /// Canceling the returned deferred forwards the cancel request to this
    /// one if it is still pending.
    pub fn then<U: Clone + 'static>(
        &self,
        on_complete: impl FnOnce(T) -> StepResult<U, P> + 'static,
        on_error: Option<ErrorHandler<U, P>>,
        on_progress: Option<ProgressHandler<P>>,
    ) -> Deferred<U, P> {
        match &self.repr {
            Repr::Core(node) => node.then(Box::new(on_complete), on_error, on_progress),
            Repr::Fulfilled(f) => {
                settled::sync_complete(f.value.clone(), f.diag, Box::new(on_complete))
            }
            Repr::Rejected(r) | Repr::Thrown(r) => {
                settled::sync_recover(r.reason.clone(), r.diag, Some(r), on_error)
            }
        }
    }

    /// Error-only chaining: passes a fulfillment through unchanged.
    pub fn recover(
        &self,
        on_error: impl FnOnce(Reason) -> StepResult<T, P> + 'static,
    ) -> Deferred<T, P> {
        self.then(
            |value| Ok(Resolution::Value(value)),
            Some(Box::new(on_error)),
            None,
        )
    }

    /// Progress-only chaining: value and failure pass through unchanged.
    pub fn watch_progress(&self, on_progress: impl Fn(&P) + 'static) -> Deferred<T, P> {
        self.then(
            |value| Ok(Resolution::Value(value)),
            None,
            Some(Box::new(on_progress)),
        )
    }

    /// Terminal composition: no chained deferred is produced.
    ///
    /// A failure that reaches here unhandled — no error handler, or the
    /// handler itself fails — is rethrown asynchronously through the
    /// installed rethrow hook so it surfaces as a top-level error instead of
    /// being swallowed. Cancellation is the one exception: always suppressed.
    pub fn done(
        &self,
        on_complete: Option<DoneHandler<T, P>>,
        on_error: Option<ErrorHandler<(), P>>,
        on_progress: Option<ProgressHandler<P>>,
    ) {
        match &self.repr {
            Repr::Core(node) => node.done(on_complete, on_error, on_progress),
            Repr::Fulfilled(f) => settled::sync_done_value(f.value.clone(), f.diag, on_complete),
            Repr::Rejected(r) | Repr::Thrown(r) => {
                settled::sync_done_failure(r.reason.clone(), r.diag, on_error)
            }
        }
    }

    /// Requests cancellation.
    ///
    /// No-op on a settled instance; idempotent on a pending one. A deferred
    /// waiting on a nested deferred forwards the request to it first; a
    /// chained deferred forwards it to its parent.
    pub fn cancel(&self) {
        match &self.repr {
            Repr::Core(node) => node.cancel(),
            Repr::Fulfilled(_) | Repr::Rejected(_) | Repr::Thrown(_) => {}
        }
    }

    /// Diagnostic identity of this instance.
    #[must_use]
    pub fn diag_id(&self) -> DiagId {
        match &self.repr {
            Repr::Core(node) => node.diag(),
            Repr::Fulfilled(f) => f.diag,
            Repr::Rejected(r) | Repr::Thrown(r) => r.diag,
        }
    }

    pub(crate) fn from_core(node: Rc<CoreNode<T, P>>) -> Self {
        Self {
            repr: Repr::Core(node),
        }
    }

    pub(crate) fn repr(&self) -> &Repr<T, P> {
        &self.repr
    }

    /// A rejected deferred carrying an already-reported failure; does not
    /// re-fire diagnostics.
    pub(crate) fn propagate_failure(reason: Reason) -> Self {
        Self {
            repr: Repr::Rejected(RejectedRepr::new(reason)),
        }
    }

    /// A rejected deferred for a failure that escaped a handler.
    pub(crate) fn thrown(reason: Reason, parent: DiagId) -> Self {
        if !reason.already_reported() {
            reason.mark_exception();
        }
        diagnostics::report(parent, &reason);
        Self {
            repr: Repr::Thrown(RejectedRepr::new(reason)),
        }
    }

    pub(crate) fn from_rejected_repr(repr: Rc<RejectedRepr>) -> Self {
        Self {
            repr: Repr::Rejected(repr),
        }
    }
}

impl<T, P> std::fmt::Debug for Deferred<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (variant, diag) = match &self.repr {
            Repr::Core(n) => ("core", n.diag()),
            Repr::Fulfilled(n) => ("fulfilled", n.diag),
            Repr::Rejected(n) => ("rejected", n.diag),
            Repr::Thrown(n) => ("thrown", n.diag),
        };
        write!(f, "Deferred({variant}, {diag})")
    }
}

/// Producer handle for a pending deferred.
///
/// All operations are no-ops once the deferred has settled or the instance
/// has been dropped.
pub struct Completer<T, P = ()> {
    node: Weak<CoreNode<T, P>>,
}

impl<T, P> Clone for Completer<T, P> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T: Clone + 'static, P: Clone + 'static> Completer<T, P> {
    /// Completes with a value.
    pub fn complete(&self, value: T) {
        if let Some(node) = self.node.upgrade() {
            node.complete(Resolution::Value(value));
        }
    }

    /// Completes with another deferred; the outer one settles when the
    /// inner one does (automatic flattening).
    pub fn chain(&self, inner: Deferred<T, P>) {
        if let Some(node) = self.node.upgrade() {
            node.complete(Resolution::Chain(inner));
        }
    }

    /// Rejects with a failure.
    pub fn error(&self, reason: Reason) {
        if let Some(node) = self.node.upgrade() {
            node.producer_error(reason);
        }
    }

    /// Forwards a progress update to currently registered listeners.
    /// Progress is never buffered.
    pub fn progress(&self, value: P) {
        if let Some(node) = self.node.upgrade() {
            node.progress(&value);
        }
    }
}

impl<T, P> std::fmt::Debug for Completer<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Completer")
    }
}
