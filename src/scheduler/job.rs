//! Per-job state machine and record.
//!
//! State graph (terminal states in brackets):
//!
//! ```text
//! Created → Scheduled → Running → [Complete]
//! Scheduled → {Paused, Canceled}      Paused → {Scheduled, Canceled}
//! Running → {CooperativeYield → Scheduled, Blocked → BlockedWaiting}
//! Running → {RunningPaused, RunningCanceled}   (applied after the body returns)
//! BlockedWaiting → {CooperativeYield, Complete, BlockedCanceled → [Canceled]}
//! ```
//!
//! Transitions are exhaustive matches over the state enum; an event/state
//! combination that was not written down fails to build, not at runtime.

use super::JobInfo;
use crate::deferred::Deferred;
use crate::types::{JobId, Priority};
use core::cell::RefCell;
use core::fmt;
use std::rc::Rc;

/// A job body. Runs once per execution; request continuation or blocking
/// through the [`JobInfo`] handle before returning.
pub type Work = Box<dyn FnOnce(&mut JobInfo)>;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobState {
    Created,
    Scheduled,
    Paused,
    Running,
    RunningPaused,
    RunningCanceled,
    CooperativeYield,
    Blocked,
    BlockedWaiting,
    BlockedCanceled,
    Complete,
    Canceled,
}

impl JobState {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Canceled)
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Scheduled => "scheduled",
            Self::Paused => "paused",
            Self::Running => "running",
            Self::RunningPaused => "running-paused",
            Self::RunningCanceled => "running-canceled",
            Self::CooperativeYield => "cooperative-yield",
            Self::Blocked => "blocked",
            Self::BlockedWaiting => "blocked-waiting",
            Self::BlockedCanceled => "blocked-canceled",
            Self::Complete => "complete",
            Self::Canceled => "canceled",
        }
    }
}

/// How a job body concluded its run.
pub(crate) enum AfterBody {
    /// Returned without requesting anything: the job is done.
    Finished,
    /// Supplied a continuation via `set_work`.
    Continuation,
    /// Handed over an awaitable via `set_awaitable`.
    Blocked,
}

/// Scheduler-side effect of concluding a run.
pub(crate) enum AfterRun {
    Complete,
    Canceled {
        /// The body handed over an awaitable after cancellation was
        /// requested; it must be canceled too.
        cancel_awaitable: bool,
    },
    Requeue {
        /// A pause was requested mid-run: keep the continuation but stay
        /// out of the queue.
        paused: bool,
    },
    Block,
}

/// The record behind one scheduled callback.
pub(crate) struct JobRecord {
    pub(crate) id: JobId,
    pub(crate) name: String,
    pub(crate) priority: Priority,
    pub(crate) state: JobState,
    pub(crate) work: Option<Work>,
    /// The awaitable a blocked job is waiting on, kept for cancellation.
    pub(crate) blocked_on: Option<Deferred<Option<WorkUnit>>>,
    /// Priority at the moment the job blocked; an unchanged priority
    /// re-queues at the band head on resumption.
    pub(crate) priority_at_block: Priority,
    /// Set owned by this job's owner token, if any.
    pub(crate) owner: Option<std::rc::Weak<RefCell<super::owner::OwnerSet>>>,
}

impl JobRecord {
    pub(crate) fn new(id: JobId, priority: Priority, name: String, work: Work) -> Self {
        Self {
            id,
            name,
            priority,
            state: JobState::Created,
            work: Some(work),
            blocked_on: None,
            priority_at_block: priority,
            owner: None,
        }
    }

    /// `Created → Scheduled`, on first enqueue.
    pub(crate) fn enter(&mut self) {
        debug_assert_eq!(self.state, JobState::Created);
        self.state = JobState::Scheduled;
    }

    /// `Scheduled → Running`, as the pump picks the job up.
    pub(crate) fn begin_run(&mut self) {
        debug_assert_eq!(self.state, JobState::Scheduled);
        self.state = JobState::Running;
    }

    /// Applies the body's conclusion to the state machine.
    pub(crate) fn conclude_run(&mut self, body: AfterBody) -> AfterRun {
        match (self.state, body) {
            (JobState::Running, AfterBody::Finished) => {
                self.state = JobState::Complete;
                AfterRun::Complete
            }
            (JobState::Running, AfterBody::Continuation) => {
                self.state = JobState::CooperativeYield;
                AfterRun::Requeue { paused: false }
            }
            (JobState::Running, AfterBody::Blocked) => {
                self.state = JobState::Blocked;
                self.priority_at_block = self.priority;
                AfterRun::Block
            }
            // Cancellation raised mid-run wins over whatever the body asked
            // for; an awaitable it handed over is canceled as well.
            (JobState::RunningCanceled, AfterBody::Finished | AfterBody::Continuation) => {
                self.state = JobState::Canceled;
                AfterRun::Canceled {
                    cancel_awaitable: false,
                }
            }
            (JobState::RunningCanceled, AfterBody::Blocked) => {
                self.state = JobState::Canceled;
                AfterRun::Canceled {
                    cancel_awaitable: true,
                }
            }
            (JobState::RunningPaused, AfterBody::Finished) => {
                self.state = JobState::Complete;
                AfterRun::Complete
            }
            (JobState::RunningPaused, AfterBody::Continuation) => {
                self.state = JobState::Paused;
                AfterRun::Requeue { paused: true }
            }
            // A pause cannot hold a job that is handing over an awaitable;
            // it proceeds to wait.
            (JobState::RunningPaused, AfterBody::Blocked) => {
                self.state = JobState::Blocked;
                self.priority_at_block = self.priority;
                AfterRun::Block
            }
            (
                JobState::Created
                | JobState::Scheduled
                | JobState::Paused
                | JobState::CooperativeYield
                | JobState::Blocked
                | JobState::BlockedWaiting
                | JobState::BlockedCanceled
                | JobState::Complete
                | JobState::Canceled,
                _,
            ) => unreachable!("conclude_run while {:?}", self.state),
        }
    }

    /// `CooperativeYield → Scheduled`, as the pump re-queues the job.
    pub(crate) fn requeued(&mut self) {
        debug_assert_eq!(self.state, JobState::CooperativeYield);
        self.state = JobState::Scheduled;
    }

    /// `Blocked → BlockedWaiting`, once the continuation is registered on
    /// the awaitable.
    pub(crate) fn block_registered(&mut self) {
        debug_assert_eq!(self.state, JobState::Blocked);
        self.state = JobState::BlockedWaiting;
    }

    /// Drops everything a dead job would otherwise retain.
    pub(crate) fn clear_refs(&mut self) {
        self.work = None;
        self.blocked_on = None;
        self.owner = None;
    }
}

impl fmt::Debug for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .finish()
    }
}

/// Clonable carrier for the next chunk of work a blocked job resumes with.
///
/// Deferred values hand the same outcome to every listener, so the work
/// closure itself (single-shot) travels inside a shared take-once cell.
pub struct WorkUnit {
    cell: Rc<RefCell<Option<Work>>>,
}

impl WorkUnit {
    /// Wraps a continuation for delivery through an awaitable.
    #[must_use]
    pub fn new(work: impl FnOnce(&mut JobInfo) + 'static) -> Self {
        Self {
            cell: Rc::new(RefCell::new(Some(Box::new(work)))),
        }
    }

    /// Takes the continuation; `None` if it was already claimed.
    pub(crate) fn take(&self) -> Option<Work> {
        self.cell.borrow_mut().take()
    }
}

impl Clone for WorkUnit {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let claimed = self.cell.borrow().is_none();
        write!(f, "WorkUnit(claimed: {claimed})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(
            JobId::from_raw(1),
            Priority::NORMAL,
            "test".into(),
            Box::new(|_| {}),
        )
    }

    #[test]
    fn plain_run_completes() {
        let mut rec = record();
        rec.enter();
        rec.begin_run();
        assert!(matches!(
            rec.conclude_run(AfterBody::Finished),
            AfterRun::Complete
        ));
        assert!(rec.state.is_terminal());
    }

    #[test]
    fn continuation_requeues() {
        let mut rec = record();
        rec.enter();
        rec.begin_run();
        assert!(matches!(
            rec.conclude_run(AfterBody::Continuation),
            AfterRun::Requeue { paused: false }
        ));
        rec.requeued();
        assert_eq!(rec.state, JobState::Scheduled);
    }

    #[test]
    fn cancel_during_run_wins_over_continuation() {
        let mut rec = record();
        rec.enter();
        rec.begin_run();
        rec.state = JobState::RunningCanceled;
        assert!(matches!(
            rec.conclude_run(AfterBody::Continuation),
            AfterRun::Canceled {
                cancel_awaitable: false
            }
        ));
        assert_eq!(rec.state, JobState::Canceled);
    }

    #[test]
    fn cancel_during_run_cancels_a_handed_awaitable() {
        let mut rec = record();
        rec.enter();
        rec.begin_run();
        rec.state = JobState::RunningCanceled;
        assert!(matches!(
            rec.conclude_run(AfterBody::Blocked),
            AfterRun::Canceled {
                cancel_awaitable: true
            }
        ));
    }

    #[test]
    fn pause_during_run_keeps_the_continuation() {
        let mut rec = record();
        rec.enter();
        rec.begin_run();
        rec.state = JobState::RunningPaused;
        assert!(matches!(
            rec.conclude_run(AfterBody::Continuation),
            AfterRun::Requeue { paused: true }
        ));
        assert_eq!(rec.state, JobState::Paused);
    }

    #[test]
    fn blocking_records_the_priority_snapshot() {
        let mut rec = record();
        rec.enter();
        rec.begin_run();
        rec.priority = Priority::HIGH;
        assert!(matches!(rec.conclude_run(AfterBody::Blocked), AfterRun::Block));
        assert_eq!(rec.priority_at_block, Priority::HIGH);
        rec.block_registered();
        assert_eq!(rec.state, JobState::BlockedWaiting);
    }

    #[test]
    fn work_unit_is_single_shot() {
        let unit = WorkUnit::new(|_| {});
        let twin = unit.clone();
        assert!(twin.take().is_some());
        assert!(unit.take().is_none());
    }
}
