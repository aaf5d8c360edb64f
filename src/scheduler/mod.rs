//! The cooperative priority scheduler.
//!
//! Jobs are callbacks queued under one of 31 fixed priority bands and run by
//! a pump that always takes the highest populated band. The pump shares one
//! logical thread with other host work: it executes jobs under a time-slice
//! budget and reschedules itself through the host's async-at-tier primitive
//! when it must yield. Exactly one job body executes at a time.
//!
//! A running body cooperates through [`JobInfo`]: poll
//! [`should_yield`](JobInfo::should_yield) at convenient checkpoints, hand
//! over a continuation with [`set_work`](JobInfo::set_work), or block on a
//! deferred with [`set_awaitable`](JobInfo::set_awaitable). Returning without
//! either completes the job.
//!
//! Scheduler instances are explicit objects built over an injected
//! [`Host`] — many independent instances can coexist, one per test if need
//! be. There is no ambient global scheduler.

pub(crate) mod drain;
pub(crate) mod job;
pub(crate) mod owner;
pub(crate) mod queue;
pub mod snapshot;

use crate::config::SchedulerConfig;
use crate::deferred::{diagnostics, Deferred, Resolution};
use crate::error::Reason;
use crate::host::{Host, Tier};
use crate::types::{JobId, Priority, Time};
use crate::util::ArenaIndex;
use core::cell::RefCell;
use drain::{DrainEntry, DrainQueue};
use job::{AfterBody, AfterRun, JobRecord, JobState};
use queue::BandQueue;
use snapshot::{BandSnapshot, DrainSnapshot, JobSnapshot, SchedulerSnapshot};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

pub use job::{Work, WorkUnit};
pub use owner::OwnerToken;

use crate::deferred::Signal;
use crate::types::BAND_COUNT;

struct Inner {
    queue: BandQueue,
    drains: DrainQueue,
    next_job: u32,
    pump_active: bool,
    scheduled_tier: Option<Tier>,
    pump_tier: Tier,
    slice_end: Time,
    current_priority: Option<Priority>,
    immediate_yield: bool,
}

pub(crate) struct SchedulerCore {
    host: Rc<dyn Host>,
    config: SchedulerConfig,
    inner: RefCell<Inner>,
}

/// Handle to a scheduler instance. Cloning shares the instance.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<SchedulerCore>,
}

impl Scheduler {
    /// Creates a scheduler over `host` with the default configuration.
    #[must_use]
    pub fn new(host: Rc<dyn Host>) -> Self {
        Self::with_config(host, SchedulerConfig::default())
    }

    /// Creates a scheduler over `host` with an explicit configuration.
    #[must_use]
    pub fn with_config(host: Rc<dyn Host>, config: SchedulerConfig) -> Self {
        Self {
            core: Rc::new(SchedulerCore {
                host,
                config,
                inner: RefCell::new(Inner {
                    queue: BandQueue::new(),
                    drains: DrainQueue::default(),
                    next_job: 1,
                    pump_active: false,
                    scheduled_tier: None,
                    pump_tier: Tier::Normal,
                    slice_end: Time::ZERO,
                    current_priority: None,
                    immediate_yield: false,
                }),
            }),
        }
    }

    pub(crate) fn from_core(core: Rc<SchedulerCore>) -> Self {
        Self { core }
    }

    /// Queues `work` at `priority` (clamped to `[-15, 15]`).
    pub fn schedule(
        &self,
        priority: impl Into<Priority>,
        name: impl Into<String>,
        work: impl FnOnce(&mut JobInfo) + 'static,
    ) -> JobHandle {
        let priority = priority.into();
        let name = name.into();
        let (idx, id) = {
            let mut inner = self.core.inner.borrow_mut();
            let id = JobId::from_raw(inner.next_job);
            inner.next_job += 1;
            let mut record = JobRecord::new(id, priority, name.clone(), Box::new(work));
            record.enter();
            let idx = inner.queue.insert_job(priority.band(), record);
            (idx, id)
        };
        tracing::debug!(job = %id, name = %name, priority = %priority, "job scheduled");
        SchedulerCore::ensure_pump(&self.core);
        JobHandle {
            core: Rc::downgrade(&self.core),
            idx,
            id,
        }
    }

    /// Requests that every job at or above `priority` — including jobs added
    /// while the drain is outstanding — run to completion.
    ///
    /// Returns a deferred that settles when the drain finishes; canceling it
    /// revokes the request. Requests are served FIFO.
    pub fn request_drain(&self, priority: impl Into<Priority>, name: impl Into<String>) -> Deferred<()> {
        let threshold = priority.into();
        let name = name.into();
        let deferred = {
            let mut inner = self.core.inner.borrow_mut();
            let id = inner.drains.next_id();
            let weak = Rc::downgrade(&self.core);
            let signal = Signal::with_cancel(move || {
                if let Some(core) = weak.upgrade() {
                    tracing::debug!(drain = id, "drain request revoked");
                    core.inner.borrow_mut().drains.remove(id);
                }
            });
            let deferred = signal.deferred();
            inner.drains.push(DrainEntry {
                id,
                threshold,
                name: name.clone(),
                signal,
            });
            if inner.drains.len() == 1 {
                // Only the current request raises the high-water-mark.
                inner.queue.raise_hwm_to_top();
            }
            deferred
        };
        tracing::debug!(name = %name, threshold = %threshold, "drain requested");
        SchedulerCore::ensure_pump(&self.core);
        deferred
    }

    /// Creates a grouping token for bulk cancellation.
    #[must_use]
    pub fn create_owner_token(&self) -> OwnerToken {
        OwnerToken::new(Rc::downgrade(&self.core))
    }

    /// Runs `f` immediately in a max-priority execution context, bypassing
    /// the queue entirely.
    pub fn exec_high<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = {
            let mut inner = self.core.inner.borrow_mut();
            inner.current_priority.replace(Priority::MAX)
        };
        struct Restore {
            core: Rc<SchedulerCore>,
            previous: Option<Priority>,
        }
        impl Drop for Restore {
            fn drop(&mut self) {
                self.core.inner.borrow_mut().current_priority = self.previous;
            }
        }
        let _restore = Restore {
            core: self.core.clone(),
            previous,
        };
        f()
    }

    /// Priority band of the caller's execution context, if the caller is
    /// running under this scheduler.
    #[must_use]
    pub fn current_priority(&self) -> Option<Priority> {
        self.core.inner.borrow().current_priority
    }

    /// Number of live jobs (queued, paused, or blocked).
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.core.inner.borrow().queue.job_count()
    }

    /// Routes unhandled `done` failures through this scheduler: each one is
    /// rethrown by a fresh normal-priority job whose sole act is to panic
    /// with it, surfacing the failure to the host's top-level error
    /// reporting.
    pub fn install_rethrow_hook(&self) {
        let weak = Rc::downgrade(&self.core);
        diagnostics::set_rethrow_hook(move |reason| {
            let Some(core) = weak.upgrade() else {
                panic!("unhandled deferred failure: {reason}");
            };
            Scheduler::from_core(core).schedule(
                Priority::NORMAL,
                "rethrow-unhandled-failure",
                move |_info| panic!("unhandled deferred failure: {reason}"),
            );
        });
    }

    /// Dumps pending jobs and drain requests for tooling.
    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let inner = self.core.inner.borrow();
        let mut bands = Vec::new();
        for band in 0..BAND_COUNT {
            let jobs: Vec<JobSnapshot> = inner
                .queue
                .band_jobs(band)
                .into_iter()
                .filter_map(|idx| inner.queue.job(idx).map(job_snapshot))
                .collect();
            if !jobs.is_empty() {
                bands.push(BandSnapshot {
                    priority: Priority::from_band(band),
                    jobs,
                });
            }
        }
        let detached = inner
            .queue
            .detached_jobs()
            .into_iter()
            .filter_map(|idx| inner.queue.job(idx).map(job_snapshot))
            .collect();
        let high_water = if inner.queue.hwm_band() < BAND_COUNT {
            Some(Priority::from_band(inner.queue.hwm_band()))
        } else {
            None
        };
        SchedulerSnapshot {
            current_priority: inner.current_priority,
            high_water,
            bands,
            detached,
            drains: inner
                .drains
                .entries()
                .map(|entry| DrainSnapshot {
                    threshold: entry.threshold,
                    name: entry.name.clone(),
                })
                .collect(),
        }
    }

    pub(crate) fn cancel_job(&self, idx: ArenaIndex) {
        let awaitable = {
            let mut inner = self.core.inner.borrow_mut();
            let Some(record) = inner.queue.job_mut(idx) else {
                return;
            };
            let id = record.id;
            match record.state {
                JobState::Created | JobState::Scheduled | JobState::Paused
                | JobState::CooperativeYield => {
                    record.state = JobState::Canceled;
                    tracing::debug!(job = %id, "job canceled");
                    cleanup_terminal(&mut inner, idx);
                    None
                }
                JobState::Running | JobState::RunningPaused => {
                    // Applied after the body returns; ask it to yield now.
                    record.state = JobState::RunningCanceled;
                    inner.immediate_yield = true;
                    tracing::debug!(job = %id, "cancel requested for running job");
                    None
                }
                JobState::Blocked | JobState::BlockedWaiting => {
                    record.state = JobState::BlockedCanceled;
                    tracing::debug!(job = %id, "cancel requested for blocked job");
                    record.blocked_on.take()
                }
                JobState::RunningCanceled
                | JobState::BlockedCanceled
                | JobState::Complete
                | JobState::Canceled => None,
            }
        };
        // Canceling a blocked job also cancels whatever it was blocked on;
        // the job finalizes when that settles.
        if let Some(awaitable) = awaitable {
            awaitable.cancel();
        }
    }

    fn pause_job(&self, idx: ArenaIndex) {
        let mut inner = self.core.inner.borrow_mut();
        let Some(record) = inner.queue.job_mut(idx) else {
            return;
        };
        match record.state {
            JobState::Scheduled => {
                record.state = JobState::Paused;
                inner.queue.unlink(idx);
            }
            JobState::Running => {
                record.state = JobState::RunningPaused;
                inner.immediate_yield = true;
            }
            JobState::Created
            | JobState::Paused
            | JobState::RunningPaused
            | JobState::RunningCanceled
            | JobState::CooperativeYield
            | JobState::Blocked
            | JobState::BlockedWaiting
            | JobState::BlockedCanceled
            | JobState::Complete
            | JobState::Canceled => {}
        }
    }

    fn resume_job(&self, idx: ArenaIndex) {
        let relinked = {
            let mut inner = self.core.inner.borrow_mut();
            let Some(record) = inner.queue.job_mut(idx) else {
                return;
            };
            match record.state {
                JobState::Paused => {
                    record.state = JobState::Scheduled;
                    let band = record.priority.band();
                    inner.queue.link_tail(idx, band);
                    true
                }
                JobState::RunningPaused => {
                    record.state = JobState::Running;
                    false
                }
                JobState::Created
                | JobState::Scheduled
                | JobState::Running
                | JobState::RunningCanceled
                | JobState::CooperativeYield
                | JobState::Blocked
                | JobState::BlockedWaiting
                | JobState::BlockedCanceled
                | JobState::Complete
                | JobState::Canceled => false,
            }
        };
        if relinked {
            SchedulerCore::ensure_pump(&self.core);
        }
    }

    fn set_job_priority(&self, idx: ArenaIndex, priority: Priority) {
        let relinked = {
            let mut inner = self.core.inner.borrow_mut();
            let Some(record) = inner.queue.job_mut(idx) else {
                return;
            };
            if record.priority == priority {
                return;
            }
            let state = record.state;
            record.priority = priority;
            match state {
                // Not yet running: move between bands now.
                JobState::Scheduled => {
                    inner.queue.unlink(idx);
                    inner.queue.link_tail(idx, priority.band());
                    true
                }
                // Takes effect at the next cooperative re-queue (running)
                // or on relink (paused / blocked).
                JobState::Created
                | JobState::Paused
                | JobState::Running
                | JobState::RunningPaused
                | JobState::RunningCanceled
                | JobState::CooperativeYield
                | JobState::Blocked
                | JobState::BlockedWaiting
                | JobState::BlockedCanceled => false,
                JobState::Complete | JobState::Canceled => false,
            }
        };
        if relinked {
            SchedulerCore::ensure_pump(&self.core);
        }
    }

    fn set_job_owner(&self, idx: ArenaIndex, token: &OwnerToken) {
        let mut inner = self.core.inner.borrow_mut();
        let Some(record) = inner.queue.job_mut(idx) else {
            return;
        };
        if record.state.is_terminal() {
            return;
        }
        if let Some(previous) = record.owner.take() {
            if let Some(set) = previous.upgrade() {
                set.borrow_mut().remove(idx);
            }
        }
        token.set.borrow_mut().jobs.push(idx);
        record.owner = Some(Rc::downgrade(&token.set));
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.core.inner.borrow();
        f.debug_struct("Scheduler")
            .field("jobs", &inner.queue.job_count())
            .field("drains", &inner.drains.len())
            .field("pump_active", &inner.pump_active)
            .finish()
    }
}

impl SchedulerCore {
    /// Makes sure a pump invocation is queued at a tier high enough for the
    /// highest pending band. No-op while the pump is running: the active
    /// loop re-reads the high-water-mark between jobs.
    fn ensure_pump(core: &Rc<Self>) {
        let tier = {
            let mut inner = core.inner.borrow_mut();
            if inner.pump_active {
                return;
            }
            let hwm = inner.queue.hwm_band();
            let tier = match inner.queue.highest_band_from(hwm) {
                Some(band) => {
                    inner.queue.set_hwm(band);
                    Tier::for_priority(Priority::from_band(band))
                }
                None if !inner.drains.is_empty() => Tier::High,
                None => return,
            };
            match inner.scheduled_tier {
                Some(existing) if existing >= tier => return,
                _ => {
                    inner.scheduled_tier = Some(tier);
                    tier
                }
            }
        };
        let weak = Rc::downgrade(core);
        core.host.run_async(
            tier,
            Box::new(move || {
                if let Some(core) = weak.upgrade() {
                    SchedulerCore::pump(&core, tier);
                }
            }),
        );
    }

    /// The run loop: executes jobs from the highest populated band downward
    /// until the queue empties, the time slice runs out, or the work calls
    /// for a higher host tier than this invocation was given. An active
    /// drain suppresses the time-slice yield.
    fn pump(core: &Rc<Self>, tier: Tier) {
        {
            let mut inner = core.inner.borrow_mut();
            if inner.pump_active {
                return;
            }
            inner.pump_active = true;
            inner.scheduled_tier = None;
            inner.pump_tier = tier;
            inner.slice_end = core.host.now() + core.config.time_slice;
        }
        tracing::trace!(tier = %tier, "pump start");

        // Restores pump bookkeeping and reschedules any remaining work even
        // when a job body panic is unwinding through this frame.
        struct PumpGuard {
            core: Rc<SchedulerCore>,
        }
        impl Drop for PumpGuard {
            fn drop(&mut self) {
                {
                    let mut inner = self.core.inner.borrow_mut();
                    inner.pump_active = false;
                    inner.current_priority = None;
                    inner.immediate_yield = false;
                }
                SchedulerCore::ensure_pump(&self.core);
            }
        }
        let _guard = PumpGuard { core: core.clone() };

        enum Step {
            CompleteDrain(DrainEntry),
            Run(usize),
            Idle,
            YieldSlice,
            YieldTier(Tier),
        }

        loop {
            let step = {
                let mut inner = core.inner.borrow_mut();
                if let Some(entry) = {
                    let Inner { drains, queue, .. } = &mut *inner;
                    drains.take_satisfied(queue)
                } {
                    if !inner.drains.is_empty() {
                        inner.queue.raise_hwm_to_top();
                    }
                    Step::CompleteDrain(entry)
                } else {
                    let hwm = inner.queue.hwm_band();
                    match inner.queue.highest_band_from(hwm) {
                        None => Step::Idle,
                        Some(band) => {
                            inner.queue.set_hwm(band);
                            let priority = Priority::from_band(band);
                            if inner.drains.covers(priority) {
                                Step::Run(band)
                            } else if core.host.now() >= inner.slice_end {
                                Step::YieldSlice
                            } else {
                                let needed = Tier::for_priority(priority);
                                if needed > inner.pump_tier {
                                    Step::YieldTier(needed)
                                } else {
                                    Step::Run(band)
                                }
                            }
                        }
                    }
                }
            };
            match step {
                Step::CompleteDrain(entry) => {
                    tracing::debug!(name = %entry.name, threshold = %entry.threshold, "drain complete");
                    entry.signal.complete(());
                }
                Step::Run(band) => Self::execute_one(core, band),
                Step::Idle => {
                    tracing::trace!("pump idle");
                    break;
                }
                Step::YieldSlice => {
                    tracing::trace!("pump yields: time slice exhausted");
                    break;
                }
                Step::YieldTier(needed) => {
                    tracing::trace!(needed = %needed, "pump yields: higher tier required");
                    break;
                }
            }
        }
    }

    fn execute_one(core: &Rc<Self>, band: usize) {
        let (idx, work, id, name, priority_before) = {
            let mut inner = core.inner.borrow_mut();
            let Some(idx) = inner.queue.first_job_in_band(band) else {
                return;
            };
            inner.queue.unlink(idx);
            let Some(record) = inner.queue.job_mut(idx) else {
                return;
            };
            record.begin_run();
            let work = record.work.take();
            let id = record.id;
            let name = record.name.clone();
            let priority = record.priority;
            inner.current_priority = Some(priority);
            inner.immediate_yield = false;
            (idx, work, id, name, priority)
        };

        let span = core
            .config
            .job_spans
            .then(|| tracing::debug_span!("job", id = %id, name = %name, priority = %priority_before));
        let entered = span.as_ref().map(tracing::Span::enter);

        let mut info = JobInfo {
            core: core.clone(),
            idx,
            next_work: None,
            awaitable: None,
        };
        let result = match work {
            Some(work) => catch_unwind(AssertUnwindSafe(|| work(&mut info))),
            None => Ok(()),
        };
        drop(entered);

        let JobInfo {
            next_work,
            awaitable,
            ..
        } = info;

        match result {
            Err(payload) => {
                {
                    let mut inner = core.inner.borrow_mut();
                    inner.current_priority = None;
                    inner.immediate_yield = false;
                    if let Some(record) = inner.queue.job_mut(idx) {
                        // A throwing body goes straight to Canceled.
                        record.state = JobState::Canceled;
                    }
                    cleanup_terminal(&mut inner, idx);
                }
                tracing::error!(job = %id, "job body panicked");
                // Pump bookkeeping is restored by the guard in pump() as
                // the panic continues past it.
                resume_unwind(payload);
            }
            Ok(()) => {
                let after = {
                    let mut inner = core.inner.borrow_mut();
                    inner.current_priority = None;
                    inner.immediate_yield = false;
                    let Some(record) = inner.queue.job_mut(idx) else {
                        return;
                    };
                    let body = if awaitable.is_some() {
                        AfterBody::Blocked
                    } else if next_work.is_some() {
                        AfterBody::Continuation
                    } else {
                        AfterBody::Finished
                    };
                    let after = record.conclude_run(body);
                    match &after {
                        AfterRun::Complete => {
                            tracing::debug!(job = %id, "job complete");
                            cleanup_terminal(&mut inner, idx);
                        }
                        AfterRun::Canceled { .. } => {
                            tracing::debug!(job = %id, "job canceled after run");
                            cleanup_terminal(&mut inner, idx);
                        }
                        AfterRun::Requeue { paused } => {
                            let record = inner
                                .queue
                                .job_mut(idx)
                                .expect("record outlives its run");
                            record.work = next_work;
                            if !*paused {
                                record.requeued();
                                let priority = record.priority;
                                if priority == priority_before {
                                    // Unchanged priority: head of the band,
                                    // so started work resumes promptly.
                                    inner.queue.link_head(idx, priority.band());
                                } else {
                                    inner.queue.link_tail(idx, priority.band());
                                }
                            }
                        }
                        AfterRun::Block => {
                            let record = inner
                                .queue
                                .job_mut(idx)
                                .expect("record outlives its run");
                            record.blocked_on = awaitable.clone();
                            // BlockedWaiting before registration: the
                            // awaitable may already be settled and fire the
                            // continuation synchronously.
                            record.block_registered();
                            tracing::debug!(job = %id, "job blocked on awaitable");
                        }
                    }
                    after
                };
                match after {
                    AfterRun::Block => {
                        if let Some(awaitable) = awaitable {
                            Self::register_block(core, idx, awaitable);
                        }
                    }
                    AfterRun::Canceled {
                        cancel_awaitable: true,
                    } => {
                        if let Some(awaitable) = awaitable {
                            awaitable.cancel();
                        }
                    }
                    AfterRun::Canceled { .. } | AfterRun::Complete | AfterRun::Requeue { .. } => {}
                }
            }
        }
    }

    fn register_block(core: &Rc<Self>, idx: ArenaIndex, awaitable: Deferred<Option<WorkUnit>>) {
        let on_next = {
            let weak = Rc::downgrade(core);
            move |next: Option<WorkUnit>| {
                if let Some(core) = weak.upgrade() {
                    Self::resume_blocked(&core, idx, Ok(next));
                }
                Ok(Resolution::Value(()))
            }
        };
        let on_failure = {
            let weak = Rc::downgrade(core);
            move |reason: Reason| {
                if let Some(core) = weak.upgrade() {
                    Self::resume_blocked(&core, idx, Err(reason));
                }
                Ok(Resolution::Value(()))
            }
        };
        awaitable.done(Some(Box::new(on_next)), Some(Box::new(on_failure)), None);
    }

    /// The awaitable a job blocked on settled.
    fn resume_blocked(
        core: &Rc<Self>,
        idx: ArenaIndex,
        outcome: Result<Option<WorkUnit>, Reason>,
    ) {
        let relinked = {
            let mut inner = core.inner.borrow_mut();
            let Some(record) = inner.queue.job_mut(idx) else {
                return;
            };
            let id = record.id;
            match record.state {
                JobState::BlockedWaiting => match outcome {
                    Ok(Some(unit)) => match unit.take() {
                        Some(work) => {
                            record.work = Some(work);
                            record.blocked_on = None;
                            record.state = JobState::CooperativeYield;
                            record.requeued();
                            let priority = record.priority;
                            let head = priority == record.priority_at_block;
                            tracing::debug!(job = %id, "blocked job resumes with more work");
                            if head {
                                inner.queue.link_head(idx, priority.band());
                            } else {
                                inner.queue.link_tail(idx, priority.band());
                            }
                            true
                        }
                        // The continuation was already claimed: nothing
                        // left to run.
                        None => {
                            record.state = JobState::Complete;
                            tracing::debug!(job = %id, "blocked job complete (work claimed)");
                            cleanup_terminal(&mut inner, idx);
                            false
                        }
                    },
                    Ok(None) => {
                        record.state = JobState::Complete;
                        tracing::debug!(job = %id, "blocked job complete");
                        cleanup_terminal(&mut inner, idx);
                        false
                    }
                    Err(_) => {
                        record.state = JobState::Canceled;
                        tracing::debug!(job = %id, "blocked job canceled: awaitable failed");
                        cleanup_terminal(&mut inner, idx);
                        false
                    }
                },
                JobState::BlockedCanceled => {
                    record.state = JobState::Canceled;
                    tracing::debug!(job = %id, "blocked job finalized canceled");
                    cleanup_terminal(&mut inner, idx);
                    false
                }
                JobState::Created
                | JobState::Scheduled
                | JobState::Paused
                | JobState::Running
                | JobState::RunningPaused
                | JobState::RunningCanceled
                | JobState::CooperativeYield
                | JobState::Blocked
                | JobState::Complete
                | JobState::Canceled => false,
            }
        };
        if relinked {
            SchedulerCore::ensure_pump(core);
        }
    }
}

fn cleanup_terminal(inner: &mut Inner, idx: ArenaIndex) {
    if inner.queue.is_linked(idx) {
        inner.queue.unlink(idx);
    }
    if let Some(record) = inner.queue.job_mut(idx) {
        if let Some(owner) = record.owner.take() {
            if let Some(set) = owner.upgrade() {
                set.borrow_mut().remove(idx);
            }
        }
        record.clear_refs();
    }
    inner.queue.remove_job(idx);
}

fn job_snapshot(record: &JobRecord) -> JobSnapshot {
    JobSnapshot {
        id: record.id.get(),
        name: record.name.clone(),
        state: record.state.name(),
        priority: record.priority,
    }
}

/// Cooperative handle given to a running job body.
///
/// The handle is only usable for the duration of the body's run; it is
/// reborrowed into the body, so holding on to it past return is a compile
/// error rather than a runtime one.
pub struct JobInfo {
    core: Rc<SchedulerCore>,
    idx: ArenaIndex,
    next_work: Option<Work>,
    awaitable: Option<Deferred<Option<WorkUnit>>>,
}

impl JobInfo {
    /// Should the body wrap up and yield?
    ///
    /// True when cancellation or pause was requested mid-run, when strictly
    /// higher-priority work arrived, or when the pump's time slice is
    /// exhausted (unless an active drain demands synchronous exhaustion).
    /// Sampled at the body's discretion; the scheduler never preempts.
    #[must_use]
    pub fn should_yield(&self) -> bool {
        let inner = self.core.inner.borrow();
        if inner.immediate_yield {
            return true;
        }
        let Some(current) = inner.current_priority else {
            return false;
        };
        if inner.queue.hwm_band() < current.band() {
            return true;
        }
        if inner.drains.covers(current) {
            return false;
        }
        self.core.host.now() >= inner.slice_end
    }

    /// Supplies the continuation to run on the job's next turn
    /// (cooperative yield).
    pub fn set_work(&mut self, work: impl FnOnce(&mut JobInfo) + 'static) {
        self.next_work = Some(Box::new(work));
        self.awaitable = None;
    }

    /// Hands the scheduler an awaitable whose resolution supplies the next
    /// chunk of work: `Some(unit)` to continue, `None` to complete. The job
    /// blocks until it settles; a failed or canceled awaitable cancels the
    /// job.
    pub fn set_awaitable(&mut self, awaitable: Deferred<Option<WorkUnit>>) {
        self.awaitable = Some(awaitable);
        self.next_work = None;
    }

    /// The running job's id.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.core
            .inner
            .borrow()
            .queue
            .job(self.idx)
            .map_or(JobId::from_raw(0), |record| record.id)
    }

    /// The running job's current priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.core
            .inner
            .borrow()
            .queue
            .job(self.idx)
            .map_or(Priority::NORMAL, |record| record.priority)
    }
}

impl std::fmt::Debug for JobInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobInfo({})", self.job_id())
    }
}

/// External handle to a scheduled job.
///
/// All operations are no-ops once the job has completed or been canceled
/// (its record is destroyed and the handle goes stale).
#[derive(Clone)]
pub struct JobHandle {
    core: Weak<SchedulerCore>,
    idx: ArenaIndex,
    id: JobId,
}

impl JobHandle {
    /// The job's public id.
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// The job's name, while it is alive.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        let core = self.core.upgrade()?;
        let inner = core.inner.borrow();
        inner.queue.job(self.idx).map(|record| record.name.clone())
    }

    /// The job's current priority, while it is alive.
    #[must_use]
    pub fn priority(&self) -> Option<Priority> {
        let core = self.core.upgrade()?;
        let inner = core.inner.borrow();
        inner.queue.job(self.idx).map(|record| record.priority)
    }

    /// True once the job has reached `Complete` or `Canceled`.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        let Some(core) = self.core.upgrade() else {
            return true;
        };
        let inner = core.inner.borrow();
        !inner.queue.contains_job(self.idx)
    }

    /// Requests cancellation. Terminal-state jobs are unaffected; a running
    /// job is asked to yield and finalizes once its body returns; a blocked
    /// job also cancels whatever it was blocked on.
    pub fn cancel(&self) {
        if let Some(core) = self.core.upgrade() {
            Scheduler::from_core(core).cancel_job(self.idx);
        }
    }

    /// Takes a queued job out of its band; a running job is asked to yield
    /// and holds its continuation until resumed.
    pub fn pause(&self) {
        if let Some(core) = self.core.upgrade() {
            Scheduler::from_core(core).pause_job(self.idx);
        }
    }

    /// Re-queues a paused job at the tail of its band.
    pub fn resume(&self) {
        if let Some(core) = self.core.upgrade() {
            Scheduler::from_core(core).resume_job(self.idx);
        }
    }

    /// Changes the job's priority (clamped). A queued job moves to the tail
    /// of its new band now; a running job moves at its next cooperative
    /// re-queue.
    pub fn set_priority(&self, priority: impl Into<Priority>) {
        if let Some(core) = self.core.upgrade() {
            Scheduler::from_core(core).set_job_priority(self.idx, priority.into());
        }
    }

    /// Assigns this job to `token`, removing it from any previous token.
    pub fn set_owner(&self, token: &OwnerToken) {
        if let Some(core) = self.core.upgrade() {
            Scheduler::from_core(core).set_job_owner(self.idx, token);
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobHandle({})", self.id)
    }
}
