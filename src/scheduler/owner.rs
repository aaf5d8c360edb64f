//! Owner tokens: grouping handles for bulk job cancellation.

use super::{Scheduler, SchedulerCore};
use crate::util::ArenaIndex;
use core::cell::RefCell;
use std::rc::{Rc, Weak};

/// The job set behind one token. Jobs deregister themselves on completion,
/// cancellation, and owner reassignment, so the set only ever holds live
/// jobs.
#[derive(Debug, Default)]
pub(crate) struct OwnerSet {
    pub(crate) jobs: Vec<ArenaIndex>,
}

impl OwnerSet {
    pub(crate) fn remove(&mut self, idx: ArenaIndex) {
        self.jobs.retain(|&job| job != idx);
    }
}

/// A grouping handle: assign it to jobs, then cancel them all at once.
///
/// A job belongs to at most one token; assigning a new owner removes it from
/// the previous token's set. Jobs that already finished are simply absent
/// and unaffected by [`cancel_all`](OwnerToken::cancel_all).
pub struct OwnerToken {
    pub(crate) set: Rc<RefCell<OwnerSet>>,
    pub(crate) core: Weak<SchedulerCore>,
}

impl OwnerToken {
    pub(crate) fn new(core: Weak<SchedulerCore>) -> Self {
        Self {
            set: Rc::new(RefCell::new(OwnerSet::default())),
            core,
        }
    }

    /// Number of live jobs currently owned by this token.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.borrow().jobs.len()
    }

    /// Returns true if the token owns no live jobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.borrow().jobs.is_empty()
    }

    /// Cancels every job currently in the set, then clears it.
    pub fn cancel_all(&self) {
        let jobs: Vec<ArenaIndex> = self.set.borrow_mut().jobs.drain(..).collect();
        let Some(core) = self.core.upgrade() else {
            return;
        };
        tracing::debug!(count = jobs.len(), "owner token canceling jobs");
        let scheduler = Scheduler::from_core(core);
        for idx in jobs {
            scheduler.cancel_job(idx);
        }
    }
}

impl std::fmt::Debug for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OwnerToken({} jobs)", self.len())
    }
}
