//! Test utilities.
//!
//! Shared helpers for unit and integration tests:
//! - tracing-based logging initialization
//! - phase/section macros for readable test output
//! - probes for the unhandled-error channel and the rethrow hook
//! - a scheduler-over-manual-host constructor

use crate::deferred::diagnostics::{self, ErrorEvent, ErrorSubscription};
use crate::error::Reason;
use crate::host::ManualHost;
use crate::scheduler::Scheduler;
use core::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level. The first call wins.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Creates a scheduler driven by a deterministic manual host.
#[must_use]
pub fn manual_scheduler() -> (Scheduler, ManualHost) {
    let host = ManualHost::new();
    let scheduler = Scheduler::new(Rc::new(host.clone()));
    (scheduler, host)
}

/// Collects unhandled-error channel events for assertions.
#[derive(Debug)]
pub struct ErrorChannelProbe {
    events: Rc<RefCell<Vec<ErrorEvent>>>,
    _subscription: ErrorSubscription,
}

impl ErrorChannelProbe {
    /// Snapshot of the events seen so far.
    #[must_use]
    pub fn events(&self) -> Vec<ErrorEvent> {
        self.events.borrow().clone()
    }

    /// Number of events seen so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.events.borrow().len()
    }
}

/// Subscribes a collecting probe to the unhandled-error channel.
#[must_use]
pub fn watch_error_channel() -> ErrorChannelProbe {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    let subscription = diagnostics::subscribe_errors(move |event| {
        sink.borrow_mut().push(event.clone());
    });
    ErrorChannelProbe {
        events,
        _subscription: subscription,
    }
}

/// Captures `done` rethrows instead of panicking. Restores the default
/// (panicking) behavior on drop.
#[derive(Debug)]
pub struct RethrowProbe {
    reasons: Rc<RefCell<Vec<Reason>>>,
}

impl RethrowProbe {
    /// Reasons rethrown so far.
    #[must_use]
    pub fn reasons(&self) -> Vec<Reason> {
        self.reasons.borrow().clone()
    }

    /// Number of rethrows seen so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.reasons.borrow().len()
    }
}

impl Drop for RethrowProbe {
    fn drop(&mut self) {
        diagnostics::clear_rethrow_hook();
    }
}

/// Installs a collecting rethrow hook.
#[must_use]
pub fn capture_rethrows() -> RethrowProbe {
    let reasons = Rc::new(RefCell::new(Vec::new()));
    let sink = reasons.clone();
    diagnostics::set_rethrow_hook(move |reason| sink.borrow_mut().push(reason));
    RethrowProbe { reasons }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
