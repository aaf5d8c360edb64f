//! The full state machine behind a pending deferred.
//!
//! Phase graph:
//!
//! ```text
//! Created → Working → {Waiting, SuccessNotify, ErrorNotify, Canceled}
//! Waiting → {SuccessNotify, ErrorNotify, WaitingCanceled}
//! WaitingCanceled → Canceling        Canceled → Canceling → ErrorNotify
//! SuccessNotify → Success            ErrorNotify → Error
//! ```
//!
//! Each external event is an exhaustive match over the phase enum, so an
//! unhandled phase/event combination fails to build instead of throwing at
//! runtime. No interior borrow is held across any user callback; listener
//! delivery runs through the iterative [`notify`] queue.

use super::diagnostics;
use super::notify;
use super::settled;
use super::{Deferred, DoneHandler, ErrorHandler, ProgressHandler, Resolution, StepResult};
use crate::error::Reason;
use crate::types::DiagId;
use core::cell::RefCell;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

/// Lifecycle phase of a [`CoreNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Created,
    Working,
    Waiting,
    WaitingCanceled,
    Canceled,
    Canceling,
    SuccessNotify,
    Success,
    ErrorNotify,
    Error,
}

/// A settled outcome, cloned once per listener at delivery.
pub(crate) enum Settled<T> {
    Value(T),
    Failed(Reason),
}

impl<T: Clone> Clone for Settled<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(v) => Self::Value(v.clone()),
            Self::Failed(r) => Self::Failed(r.clone()),
        }
    }
}

/// Cancel forwarding: a chained child holds a weak handle to its parent, a
/// waiting outer holds one to the inner it adopted.
pub(crate) trait CancelTarget {
    fn request_cancel(&self);
}

/// Progress forwarding down a chain, driven iteratively by the caller.
pub(crate) trait ProgressSink<P> {
    /// Invokes local progress callbacks and appends child sinks to `pending`.
    fn progress_step(&self, value: &P, pending: &mut VecDeque<Rc<dyn ProgressSink<P>>>);
}

/// One registered continuation, consumed exactly once at settlement.
pub(crate) struct Listener<T, P> {
    on_progress: Option<Rc<dyn Fn(&P)>>,
    forward: Option<Weak<dyn ProgressSink<P>>>,
    deliver: Box<dyn FnOnce(&Settled<T>)>,
}

struct Core<T, P> {
    phase: Phase,
    settled: Option<Settled<T>>,
    listeners: SmallVec<[Listener<T, P>; 1]>,
    cancel_action: Option<Box<dyn FnOnce()>>,
    waiting_on: Option<Weak<dyn CancelTarget>>,
}

/// A pending deferred value.
pub(crate) struct CoreNode<T, P> {
    diag: DiagId,
    me: Weak<CoreNode<T, P>>,
    cell: RefCell<Core<T, P>>,
}

impl<T, P> CoreNode<T, P> {
    pub(crate) fn diag(&self) -> DiagId {
        self.diag
    }
}

impl<T: Clone + 'static, P: Clone + 'static> CoreNode<T, P> {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            diag: DiagId::next(),
            me: me.clone(),
            cell: RefCell::new(Core {
                phase: Phase::Created,
                settled: None,
                listeners: SmallVec::new(),
                cancel_action: None,
                waiting_on: None,
            }),
        })
    }

    /// `Created → Working`; runs synchronously at construction.
    pub(crate) fn enter(&self) {
        let mut c = self.cell.borrow_mut();
        debug_assert_eq!(c.phase, Phase::Created, "enter() after construction only");
        c.phase = Phase::Working;
    }

    /// Installs the producer cancel action (or, for chained children, the
    /// forward-to-parent action).
    pub(crate) fn set_cancel_action(&self, action: Box<dyn FnOnce()>) {
        self.cell.borrow_mut().cancel_action = Some(action);
    }

    /// Producer completion. Ignored unless the node is still working.
    pub(crate) fn complete(&self, resolution: Resolution<T, P>) {
        {
            let c = self.cell.borrow();
            match c.phase {
                Phase::Created | Phase::Working => {}
                Phase::Waiting
                | Phase::WaitingCanceled
                | Phase::Canceled
                | Phase::Canceling
                | Phase::SuccessNotify
                | Phase::Success
                | Phase::ErrorNotify
                | Phase::Error => return,
            }
        }
        match resolution {
            Resolution::Value(value) => self.finish_value(value),
            Resolution::Chain(inner) => self.adopt(inner),
        }
    }

    /// Producer rejection. Ignored unless the node is still working.
    pub(crate) fn producer_error(&self, reason: Reason) {
        {
            let c = self.cell.borrow();
            match c.phase {
                Phase::Created | Phase::Working => {}
                Phase::Waiting
                | Phase::WaitingCanceled
                | Phase::Canceled
                | Phase::Canceling
                | Phase::SuccessNotify
                | Phase::Success
                | Phase::ErrorNotify
                | Phase::Error => return,
            }
        }
        self.finish_failure(reason);
    }

    /// A failure escaping an initializer: tagged as an exception.
    pub(crate) fn fail_from_init(&self, reason: Reason) {
        if !reason.already_reported() {
            reason.mark_exception();
        }
        self.producer_error(reason);
    }

    /// Settles successfully and queues listener delivery.
    pub(crate) fn finish_value(&self, value: T) {
        {
            let mut c = self.cell.borrow_mut();
            match c.phase {
                Phase::Created | Phase::Working | Phase::Waiting => {}
                Phase::WaitingCanceled
                | Phase::Canceled
                | Phase::Canceling
                | Phase::SuccessNotify
                | Phase::Success
                | Phase::ErrorNotify
                | Phase::Error => return,
            }
            c.phase = Phase::SuccessNotify;
            c.settled = Some(Settled::Value(value));
            c.cancel_action = None;
            c.waiting_on = None;
        }
        tracing::trace!(deferred = %self.diag, "deferred fulfilled");
        self.schedule_drain();
    }

    /// Settles with a failure, reports origination once per causal chain,
    /// and queues listener delivery.
    pub(crate) fn finish_failure(&self, reason: Reason) {
        {
            let mut c = self.cell.borrow_mut();
            match c.phase {
                Phase::Created
                | Phase::Working
                | Phase::Waiting
                | Phase::WaitingCanceled
                | Phase::Canceled
                | Phase::Canceling => {}
                Phase::SuccessNotify | Phase::Success | Phase::ErrorNotify | Phase::Error => {
                    return
                }
            }
            c.phase = Phase::ErrorNotify;
            c.settled = Some(Settled::Failed(reason.clone()));
            c.cancel_action = None;
            c.waiting_on = None;
        }
        tracing::trace!(deferred = %self.diag, reason = %reason, "deferred rejected");
        diagnostics::report(self.diag, &reason);
        self.schedule_drain();
    }

    /// Settles with a failure that escaped a handler.
    pub(crate) fn finish_thrown(&self, reason: Reason) {
        if !reason.already_reported() {
            reason.mark_exception();
        }
        self.finish_failure(reason);
    }

    fn schedule_drain(&self) {
        let Some(node) = self.me.upgrade() else {
            return;
        };
        notify::enqueue(Box::new(move || node.drain_listeners()));
    }

    fn drain_listeners(&self) {
        loop {
            let (settled, batch) = {
                let mut c = self.cell.borrow_mut();
                if c.listeners.is_empty() {
                    break;
                }
                let Some(settled) = c.settled.clone() else {
                    break;
                };
                (settled, core::mem::take(&mut c.listeners))
            };
            for listener in batch {
                (listener.deliver)(&settled);
            }
        }
        let mut c = self.cell.borrow_mut();
        c.phase = match c.phase {
            Phase::SuccessNotify => Phase::Success,
            Phase::ErrorNotify => Phase::Error,
            other => other,
        };
    }

    /// Returns the settled outcome once one exists (notify or terminal).
    pub(crate) fn peek_settled(&self) -> Option<Settled<T>> {
        self.cell.borrow().settled.clone()
    }

    /// Completion with a nested deferred: flatten by waiting on it.
    pub(crate) fn adopt(&self, inner: Deferred<T, P>) {
        match inner.repr() {
            super::Repr::Fulfilled(f) => self.finish_value(f.value.clone()),
            super::Repr::Rejected(r) | super::Repr::Thrown(r) => {
                self.finish_failure(r.reason.clone());
            }
            super::Repr::Core(node) => {
                if let Some(settled) = node.peek_settled() {
                    match settled {
                        Settled::Value(v) => self.finish_value(v),
                        Settled::Failed(r) => self.finish_failure(r),
                    }
                    return;
                }
                {
                    let mut c = self.cell.borrow_mut();
                    match c.phase {
                        Phase::Created | Phase::Working => {}
                        Phase::Waiting
                        | Phase::WaitingCanceled
                        | Phase::Canceled
                        | Phase::Canceling
                        | Phase::SuccessNotify
                        | Phase::Success
                        | Phase::ErrorNotify
                        | Phase::Error => return,
                    }
                    c.phase = Phase::Waiting;
                    let node_dyn: Rc<dyn CancelTarget> = node.clone();
                    let target: Weak<dyn CancelTarget> = Rc::downgrade(&node_dyn);
                    c.waiting_on = Some(target);
                }
                tracing::trace!(
                    outer = %self.diag,
                    inner = %node.diag,
                    "deferred waiting on nested deferred"
                );
                let Some(outer) = self.me.upgrade() else {
                    return;
                };
                node.push_adoption_listener(outer);
            }
        }
    }

    /// Registers the outer deferred of an adoption on this (inner) node.
    fn push_adoption_listener(&self, outer: Rc<CoreNode<T, P>>) {
        let outer_dyn: Rc<dyn ProgressSink<P>> = outer.clone();
        let forward: Weak<dyn ProgressSink<P>> = Rc::downgrade(&outer_dyn);
        let deliver = Box::new(move |settled: &Settled<T>| {
            outer.adopted_settled(settled.clone());
        });
        self.cell.borrow_mut().listeners.push(Listener {
            on_progress: None,
            forward: Some(forward),
            deliver,
        });
    }

    /// The adopted inner deferred settled.
    fn adopted_settled(&self, settled: Settled<T>) {
        enum Next {
            Deliver,
            CanceledWins,
            Stale,
        }
        let next = {
            let mut c = self.cell.borrow_mut();
            match c.phase {
                Phase::Waiting => Next::Deliver,
                Phase::WaitingCanceled => {
                    c.phase = Phase::Canceling;
                    Next::CanceledWins
                }
                Phase::Created
                | Phase::Working
                | Phase::Canceled
                | Phase::Canceling
                | Phase::SuccessNotify
                | Phase::Success
                | Phase::ErrorNotify
                | Phase::Error => Next::Stale,
            }
        };
        match next {
            Next::Deliver => match settled {
                Settled::Value(v) => self.finish_value(v),
                Settled::Failed(r) => self.finish_failure(r),
            },
            // A cancel arrived while waiting: the cancel wins regardless of
            // how the inner deferred settled. Reuse the inner cancellation
            // reason when there is one so the causal chain stays intact.
            Next::CanceledWins => {
                let reason = match settled {
                    Settled::Failed(r) if r.is_canceled() => r,
                    Settled::Value(_) | Settled::Failed(_) => Reason::canceled(),
                };
                self.finish_failure(reason);
            }
            Next::Stale => {}
        }
    }

    /// Cancel request. No-op once settled; idempotent while pending.
    pub(crate) fn cancel(&self) {
        enum Op {
            RunAction(Option<Box<dyn FnOnce()>>),
            Forward(Option<Weak<dyn CancelTarget>>),
            Ignore,
        }
        let op = {
            let mut c = self.cell.borrow_mut();
            match c.phase {
                Phase::Created | Phase::Working => {
                    c.phase = Phase::Canceled;
                    Op::RunAction(c.cancel_action.take())
                }
                Phase::Waiting => {
                    c.phase = Phase::WaitingCanceled;
                    Op::Forward(c.waiting_on.clone())
                }
                Phase::WaitingCanceled
                | Phase::Canceled
                | Phase::Canceling
                | Phase::SuccessNotify
                | Phase::Success
                | Phase::ErrorNotify
                | Phase::Error => Op::Ignore,
            }
        };
        match op {
            Op::RunAction(action) => {
                tracing::trace!(deferred = %self.diag, "deferred canceled");
                {
                    let mut c = self.cell.borrow_mut();
                    if c.phase == Phase::Canceled {
                        c.phase = Phase::Canceling;
                    }
                }
                if let Some(action) = action {
                    action();
                }
                // The action may already have settled this node (a chained
                // parent cascading its canceled failure back down); the
                // finish gate makes this a no-op in that case.
                self.finish_failure(Reason::canceled());
            }
            Op::Forward(target) => {
                tracing::trace!(deferred = %self.diag, "cancel forwarded to nested deferred");
                if let Some(target) = target.and_then(|weak| weak.upgrade()) {
                    target.request_cancel();
                }
            }
            Op::Ignore => {}
        }
    }

    /// Synchronous progress fan-out; not buffered.
    pub(crate) fn progress(&self, value: &P) {
        let mut pending: VecDeque<Rc<dyn ProgressSink<P>>> = VecDeque::new();
        self.progress_step(value, &mut pending);
        while let Some(sink) = pending.pop_front() {
            sink.progress_step(value, &mut pending);
        }
    }

    /// Chaining. Fast path when already settled, listener registration while
    /// pending.
    pub(crate) fn then<U: Clone + 'static>(
        &self,
        on_complete: Box<dyn FnOnce(T) -> StepResult<U, P>>,
        on_error: Option<ErrorHandler<U, P>>,
        on_progress: Option<ProgressHandler<P>>,
    ) -> Deferred<U, P> {
        if let Some(settled) = self.peek_settled() {
            return match settled {
                Settled::Value(v) => settled::sync_complete(v, self.diag, on_complete),
                Settled::Failed(r) => settled::sync_recover(r, self.diag, None, on_error),
            };
        }

        let child = CoreNode::<U, P>::new();
        child.enter();
        let parent: Weak<dyn CancelTarget> = self.me.clone();
        child.set_cancel_action(Box::new(move || {
            if let Some(parent) = parent.upgrade() {
                parent.request_cancel();
            }
        }));

        let deliver = {
            let child = child.clone();
            Box::new(move |settled: &Settled<T>| {
                deliver_chained(&child, settled, on_complete, on_error);
            })
        };
        let child_dyn: Rc<dyn ProgressSink<P>> = child.clone();
        let forward: Weak<dyn ProgressSink<P>> = Rc::downgrade(&child_dyn);
        self.cell.borrow_mut().listeners.push(Listener {
            on_progress: on_progress.map(Rc::from),
            forward: Some(forward),
            deliver,
        });
        Deferred::from_core(child)
    }

    /// Terminal composition: no child, unhandled failures rethrow.
    pub(crate) fn done(
        &self,
        on_complete: Option<DoneHandler<T, P>>,
        on_error: Option<ErrorHandler<(), P>>,
        on_progress: Option<ProgressHandler<P>>,
    ) {
        if let Some(settled) = self.peek_settled() {
            match settled {
                Settled::Value(v) => settled::sync_done_value(v, self.diag, on_complete),
                Settled::Failed(r) => settled::sync_done_failure(r, self.diag, on_error),
            }
            return;
        }
        let diag = self.diag;
        let deliver = Box::new(move |settled: &Settled<T>| match settled {
            Settled::Value(v) => settled::sync_done_value(v.clone(), diag, on_complete),
            Settled::Failed(r) => settled::sync_done_failure(r.clone(), diag, on_error),
        });
        self.cell.borrow_mut().listeners.push(Listener {
            on_progress: on_progress.map(Rc::from),
            forward: None,
            deliver,
        });
    }
}

impl<T: Clone + 'static, P: Clone + 'static> CancelTarget for CoreNode<T, P> {
    fn request_cancel(&self) {
        self.cancel();
    }
}

impl<T: Clone + 'static, P: Clone + 'static> ProgressSink<P> for CoreNode<T, P> {
    fn progress_step(&self, value: &P, pending: &mut VecDeque<Rc<dyn ProgressSink<P>>>) {
        let (callbacks, forwards) = {
            let c = self.cell.borrow();
            match c.phase {
                Phase::Created | Phase::Working | Phase::Waiting => {}
                Phase::WaitingCanceled
                | Phase::Canceled
                | Phase::Canceling
                | Phase::SuccessNotify
                | Phase::Success
                | Phase::ErrorNotify
                | Phase::Error => return,
            }
            let callbacks: Vec<_> = c
                .listeners
                .iter()
                .filter_map(|l| l.on_progress.clone())
                .collect();
            let forwards: Vec<_> = c
                .listeners
                .iter()
                .filter_map(|l| l.forward.as_ref().and_then(Weak::upgrade))
                .collect();
            (callbacks, forwards)
        };
        for callback in callbacks {
            callback(value);
        }
        pending.extend(forwards);
    }
}

/// Delivers a settled outcome into a chained child.
fn deliver_chained<T: Clone + 'static, U: Clone + 'static, P: Clone + 'static>(
    child: &Rc<CoreNode<U, P>>,
    settled: &Settled<T>,
    on_complete: Box<dyn FnOnce(T) -> StepResult<U, P>>,
    on_error: Option<ErrorHandler<U, P>>,
) {
    match settled {
        Settled::Value(v) => match on_complete(v.clone()) {
            Ok(Resolution::Value(u)) => child.finish_value(u),
            Ok(Resolution::Chain(d)) => child.adopt(d),
            Err(thrown) => child.finish_thrown(thrown),
        },
        Settled::Failed(reason) => match on_error {
            Some(handler) => {
                reason.mark_observed();
                match handler(reason.clone()) {
                    Ok(Resolution::Value(u)) => child.finish_value(u),
                    Ok(Resolution::Chain(d)) => child.adopt(d),
                    // Rethrowing the identical failure propagates the chain;
                    // a fresh failure originates a new one.
                    Err(thrown) if thrown.same_chain(reason) => child.finish_failure(thrown),
                    Err(thrown) => child.finish_thrown(thrown),
                }
            }
            None => child.finish_failure(reason.clone()),
        },
    }
}
