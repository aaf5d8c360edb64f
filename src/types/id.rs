//! Identifier types for deferreds, errors, and jobs.
//!
//! The substrate is single-threaded by construction, so counters live in
//! thread-locals rather than atomics; every handle type in the crate is
//! `!Send` and the counters are only ever touched from the owning thread.

use core::cell::Cell;
use core::fmt;

thread_local! {
    static NEXT_DIAG: Cell<u64> = const { Cell::new(1) };
    static NEXT_ERROR: Cell<u64> = const { Cell::new(1) };
}

/// Diagnostic identity of a deferred instance.
///
/// Used as the `parent_context` of unhandled-error events so tooling can
/// attribute a failure to the deferred it originated in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiagId(u64);

impl DiagId {
    /// Allocates the next diagnostic id.
    #[must_use]
    pub fn next() -> Self {
        NEXT_DIAG.with(|c| {
            let id = c.get();
            c.set(id + 1);
            Self(id)
        })
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for DiagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiagId({})", self.0)
    }
}

impl fmt::Display for DiagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

/// Identity of an error's causal chain.
///
/// Assigned once when an error originates; propagating the error through a
/// chain of continuations preserves the id, so diagnostics can correlate
/// every observation of the same failure.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ErrorId(u64);

impl ErrorId {
    /// Allocates the next error id (monotonically increasing).
    #[must_use]
    pub fn next() -> Self {
        NEXT_ERROR.with(|c| {
            let id = c.get();
            c.set(id + 1);
            Self(id)
        })
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorId({})", self.0)
    }
}

impl fmt::Display for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// Public identity of a scheduled job.
///
/// Stable for the lifetime of the process (never reused), unlike the arena
/// index backing the job's queue node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct JobId(u32);

impl JobId {
    /// Wraps a raw job number (scheduler internal use).
    #[must_use]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "J{}", self.0)
    }
}
