//! External producer handle for a cancellable deferred.

use super::{Completer, Deferred, Resolution};
use crate::error::Reason;

/// A producer-side handle paired with the deferred it drives.
///
/// Where [`Deferred::new`](super::Deferred::new) hands the completer to an
/// initializer and forgets it, a `Signal` keeps the producer side around for
/// code that completes a deferred from the outside — drain coordinators,
/// request plumbing, tests.
pub struct Signal<T, P = ()> {
    deferred: Deferred<T, P>,
    completer: Completer<T, P>,
}

impl<T: Clone + 'static, P: Clone + 'static> Signal<T, P> {
    /// Creates a signal with no cancel callback.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a signal whose deferred runs `on_cancel` when canceled.
    #[must_use]
    pub fn with_cancel(on_cancel: impl FnOnce() + 'static) -> Self {
        Self::build(Some(Box::new(on_cancel)))
    }

    fn build(on_cancel: Option<Box<dyn FnOnce()>>) -> Self {
        let mut handle = None;
        let deferred = match on_cancel {
            Some(action) => Deferred::with_cancel(action, |completer| {
                handle = Some(completer.clone());
                Ok(())
            }),
            None => Deferred::new(|completer| {
                handle = Some(completer.clone());
                Ok(())
            }),
        };
        let completer = handle.expect("initializer always runs");
        Self {
            deferred,
            completer,
        }
    }

    /// Returns a handle to the consumer side.
    #[must_use]
    pub fn deferred(&self) -> Deferred<T, P> {
        self.deferred.clone()
    }

    /// Completes with a value. No-op once settled.
    pub fn complete(&self, value: T) {
        self.completer.complete(value);
    }

    /// Completes with another deferred (flattened). No-op once settled.
    pub fn chain(&self, inner: Deferred<T, P>) {
        self.completer.chain(inner);
    }

    /// Rejects with a failure. No-op once settled.
    pub fn error(&self, reason: Reason) {
        self.completer.error(reason);
    }

    /// Forwards a progress update to current listeners.
    pub fn progress(&self, value: P) {
        self.completer.progress(value);
    }

    /// Cancels the underlying deferred.
    pub fn cancel(&self) {
        self.deferred.cancel();
    }
}

impl<T: Clone + 'static, P: Clone + 'static> Default for Signal<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, P> std::fmt::Debug for Signal<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signal({:?})", self.deferred)
    }
}
