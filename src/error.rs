//! Error values for the deferred machinery.
//!
//! A [`Reason`] is the single error currency of the crate. It is a cheap
//! shared handle: cloning it propagates the *same* failure through a chain of
//! continuations, preserving the causal [`ErrorId`] and the once-only
//! diagnostics flags. Two reasons compare equal when they belong to the same
//! causal chain.
//!
//! The taxonomy follows the substrate's contract:
//!
//! - **explicit rejection** — a producer invoked the error callback, or a
//!   handler returned a fresh failure ([`Origin::Rejection`])
//! - **thrown exception** — a failure surfaced from an initializer or a
//!   handler that "threw" ([`Origin::Exception`])
//! - **cancellation** — the distinguished sentinel ([`ReasonKind::Canceled`]),
//!   excluded from the unhandled-error channel and from `done`'s rethrow

use crate::types::ErrorId;
use core::cell::Cell;
use core::fmt;
use std::borrow::Cow;
use std::rc::Rc;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ReasonKind {
    /// The operation was canceled. Suppressed by diagnostics and rethrow.
    Canceled,
    /// Any other failure.
    Failure,
}

/// Whether the failure originated as an explicit rejection or as an
/// uncaught throw. Diagnostic metadata only; propagation ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Origin {
    /// A producer or handler rejected with a value.
    Rejection,
    /// A failure escaped an initializer or handler.
    Exception,
}

struct ReasonInner {
    id: ErrorId,
    kind: ReasonKind,
    origin: Cell<Origin>,
    message: Cow<'static, str>,
    /// Set once the unhandled-error channel has seen this chain.
    reported: Cell<bool>,
    /// Set once an error handler was registered somewhere on the chain.
    observed: Cell<bool>,
}

/// A shared error value with causal identity.
#[derive(Clone)]
pub struct Reason {
    inner: Rc<ReasonInner>,
}

impl Reason {
    fn build(kind: ReasonKind, origin: Origin, message: Cow<'static, str>) -> Self {
        Self {
            inner: Rc::new(ReasonInner {
                id: ErrorId::next(),
                kind,
                origin: Cell::new(origin),
                message,
                reported: Cell::new(false),
                observed: Cell::new(false),
            }),
        }
    }

    /// Creates a plain failure (explicit rejection).
    #[must_use]
    pub fn failure(message: impl Into<Cow<'static, str>>) -> Self {
        Self::build(ReasonKind::Failure, Origin::Rejection, message.into())
    }

    /// Creates the cancellation sentinel.
    #[must_use]
    pub fn canceled() -> Self {
        Self::build(ReasonKind::Canceled, Origin::Rejection, Cow::Borrowed("canceled"))
    }

    /// Returns the causal chain id.
    #[must_use]
    pub fn id(&self) -> ErrorId {
        self.inner.id
    }

    /// Returns the failure classification.
    #[must_use]
    pub fn kind(&self) -> ReasonKind {
        self.inner.kind
    }

    /// Returns true for the cancellation sentinel.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.kind == ReasonKind::Canceled
    }

    /// Returns the recorded origin.
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.inner.origin.get()
    }

    /// Returns the human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// Returns true if both reasons belong to the same causal chain.
    #[must_use]
    pub fn same_chain(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }

    /// Reclassifies the origin as an uncaught throw.
    pub(crate) fn mark_exception(&self) {
        self.inner.origin.set(Origin::Exception);
    }

    /// Records that an error handler exists somewhere on this chain.
    pub(crate) fn mark_observed(&self) {
        self.inner.observed.set(true);
    }

    /// Returns true if some handler on the chain was registered to observe it.
    #[must_use]
    pub fn was_observed(&self) -> bool {
        self.inner.observed.get()
    }

    /// Returns true once the chain has been reported to diagnostics.
    pub(crate) fn already_reported(&self) -> bool {
        self.inner.reported.get()
    }

    /// Claims the once-per-chain diagnostics report.
    ///
    /// Returns true exactly once per causal chain, and never for the
    /// cancellation sentinel.
    pub(crate) fn claim_report(&self) -> bool {
        if self.is_canceled() || self.inner.reported.get() {
            return false;
        }
        self.inner.reported.set(true);
        true
    }
}

impl PartialEq for Reason {
    fn eq(&self, other: &Self) -> bool {
        self.same_chain(other)
    }
}

impl Eq for Reason {}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reason")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("origin", &self.inner.origin.get())
            .field("message", &self.inner.message)
            .finish()
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            ReasonKind::Canceled => write!(f, "canceled ({})", self.inner.id),
            ReasonKind::Failure => write!(f, "{} ({})", self.inner.message, self.inner.id),
        }
    }
}

impl std::error::Error for Reason {}
