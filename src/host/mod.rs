//! The host integration boundary.
//!
//! The substrate asks exactly two things of the embedding platform: a way to
//! run a callback asynchronously at one of a small number of priority tiers,
//! and a monotonic clock. Everything else is built on top.
//!
//! The crate ships one implementation, [`ManualHost`]: a deterministic host
//! with a virtual clock and per-tier FIFO queues, driven explicitly by tests
//! (the same shape as a lab runtime with controlled time). Real embedders map
//! [`Tier`] onto whatever immediate/deferred/idle callback primitives their
//! platform offers.

use crate::types::{Priority, Time};
use core::cell::RefCell;
use core::fmt;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// Host callback tiers, coarser than job priorities.
///
/// The pump schedules itself at the tier matching the highest pending band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Idle-time callback (lowest urgency).
    Idle,
    /// Ordinary deferred callback.
    Normal,
    /// Immediate callback (runs before Normal work the host has queued).
    High,
}

impl Tier {
    /// Maps a job priority onto the host tier that should drive it.
    #[must_use]
    pub fn for_priority(priority: Priority) -> Self {
        if priority >= Priority::ABOVE_NORMAL {
            Self::High
        } else if priority >= Priority::BELOW_NORMAL {
            Self::Normal
        } else {
            Self::Idle
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Idle => 2,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => f.write_str("high"),
            Self::Normal => f.write_str("normal"),
            Self::Idle => f.write_str("idle"),
        }
    }
}

/// What the embedding platform must provide.
pub trait Host {
    /// Reads the monotonic clock.
    fn now(&self) -> Time;

    /// Queues `callback` to run asynchronously at `tier`.
    ///
    /// Callbacks at a higher tier run before callbacks at a lower tier;
    /// within one tier, FIFO.
    fn run_async(&self, tier: Tier, callback: Box<dyn FnOnce()>);
}

struct ManualHostInner {
    now: Time,
    auto_advance: Duration,
    queues: [VecDeque<Box<dyn FnOnce()>>; 3],
}

/// Deterministic host for tests: virtual clock, explicit stepping.
///
/// `step` runs the oldest callback of the highest populated tier, advancing
/// the virtual clock by the configured auto-advance first (zero by default).
#[derive(Clone)]
pub struct ManualHost {
    inner: Rc<RefCell<ManualHostInner>>,
}

impl ManualHost {
    /// Ceiling on `run_until_idle` steps; a scheduler bug that endlessly
    /// reschedules itself fails loudly instead of hanging the test.
    const MAX_STEPS: u64 = 1_000_000;

    /// Creates a host with the clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::with_auto_advance(Duration::ZERO)
    }

    /// Creates a host whose clock advances by `step` before each callback.
    #[must_use]
    pub fn with_auto_advance(step: Duration) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ManualHostInner {
                now: Time::ZERO,
                auto_advance: step,
                queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            })),
        }
    }

    /// Advances the virtual clock.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.borrow_mut();
        inner.now = inner.now + by;
    }

    /// Number of queued callbacks across all tiers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.borrow().queues.iter().map(VecDeque::len).sum()
    }

    /// Runs one callback (highest tier first). Returns false when idle.
    pub fn step(&self) -> bool {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            let auto = inner.auto_advance;
            inner.now = inner.now + auto;
            inner.queues.iter_mut().find_map(VecDeque::pop_front)
        };
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Steps until no callbacks remain; returns how many ran.
    ///
    /// # Panics
    /// Panics after an internal step ceiling, which indicates runaway
    /// rescheduling.
    pub fn run_until_idle(&self) -> u64 {
        let mut steps = 0;
        while self.step() {
            steps += 1;
            assert!(
                steps < Self::MAX_STEPS,
                "host did not go idle within {} steps",
                Self::MAX_STEPS
            );
        }
        steps
    }
}

impl Default for ManualHost {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ManualHost")
            .field("now", &inner.now)
            .field("pending", &inner.queues.iter().map(VecDeque::len).sum::<usize>())
            .finish()
    }
}

impl Host for ManualHost {
    fn now(&self) -> Time {
        self.inner.borrow().now
    }

    fn run_async(&self, tier: Tier, callback: Box<dyn FnOnce()>) {
        self.inner.borrow_mut().queues[tier.index()].push_back(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[test]
    fn tier_ordering_matches_urgency() {
        assert!(Tier::High > Tier::Normal);
        assert!(Tier::Normal > Tier::Idle);
    }

    #[test]
    fn tier_for_priority_bands() {
        assert_eq!(Tier::for_priority(Priority::MAX), Tier::High);
        assert_eq!(Tier::for_priority(Priority::ABOVE_NORMAL), Tier::High);
        assert_eq!(Tier::for_priority(Priority::NORMAL), Tier::Normal);
        assert_eq!(Tier::for_priority(Priority::BELOW_NORMAL), Tier::Normal);
        assert_eq!(Tier::for_priority(Priority::IDLE), Tier::Idle);
        assert_eq!(Tier::for_priority(Priority::MIN), Tier::Idle);
    }

    #[test]
    fn higher_tier_callbacks_run_first() {
        let host = ManualHost::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        host.run_async(Tier::Idle, Box::new(move || o.borrow_mut().push("idle")));
        let o = order.clone();
        host.run_async(Tier::High, Box::new(move || o.borrow_mut().push("high")));
        let o = order.clone();
        host.run_async(Tier::Normal, Box::new(move || o.borrow_mut().push("normal")));

        host.run_until_idle();
        assert_eq!(*order.borrow(), vec!["high", "normal", "idle"]);
    }

    #[test]
    fn auto_advance_moves_the_clock_per_step() {
        let host = ManualHost::with_auto_advance(Duration::from_millis(10));
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        host.run_async(Tier::Normal, Box::new(move || flag.set(true)));

        assert_eq!(host.now(), Time::ZERO);
        host.step();
        assert!(ran.get());
        assert_eq!(host.now(), Time::from_millis(10));
    }

    #[test]
    fn callbacks_may_requeue_during_a_step() {
        let host = ManualHost::new();
        let count = Rc::new(Cell::new(0));
        let h = host.clone();
        let c = count.clone();
        host.run_async(
            Tier::Normal,
            Box::new(move || {
                c.set(c.get() + 1);
                let c2 = c.clone();
                h.run_async(Tier::Normal, Box::new(move || c2.set(c2.get() + 1)));
            }),
        );
        host.run_until_idle();
        assert_eq!(count.get(), 2);
    }
}
