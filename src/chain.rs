//! Bookkeeping of a single chain of coroutines.
//!
//! A chain is the sequence of bodies connected by tail delegation. It owns one controlling future
//! and, at any time, at most one suspended coroutine context and one outstanding subscription to a
//! dependency.
//!
//! The state is split in two. The [`Control`] block is not generic; it is what the coroutine side
//! (the [`Suspend`](../struct.Suspend.html) handle and the delivery tasks) needs to park, resume
//! and stop the coroutine. The [`Chain`] adds the typed part: the outcome, its observers and the
//! waker of whoever polls the controlling future.

use std::cell::{Cell, RefCell};
use std::mem;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::thread;

use context::Context;
use futures::executor::LocalSpawner;
use futures::future::{self, AbortHandle, LocalBoxFuture};
use futures::task::LocalSpawnExt;
use tracing::{debug, trace, warn};

use crate::errors::{Failure, StopReason};
use crate::switch::Switch;

/// The observable state of a chain's driver.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DriverState {
    /// A body is executing right now (somewhere up the call stack).
    Running,
    /// Waiting for a dependency to settle.
    Suspended,
    /// Waiting for a dependency, and its outcome is held back even once it settles.
    Paused,
    /// The stop signal was delivered (or is going to be at the next suspension point), the body is
    /// unwinding.
    Cancelled,
    /// The controlling future settled. Nothing runs any more.
    Done,
}

/// What the driver does right now, ignoring pause and stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Phase {
    Running,
    Suspended,
    /// The last delegation went to a plain future; no body is left and the chain waits for that
    /// future directly.
    Following,
    Done,
}

pub(crate) struct Control {
    spawner: LocalSpawner,
    cached_stacks: usize,
    leak_on_panic: bool,
    phase: Cell<Phase>,
    paused: Cell<bool>,
    /// The dependency settled while paused and waits for `unpause`.
    buffered: Cell<bool>,
    stop: Cell<Option<StopReason>>,
    /// Identifies the outstanding subscription. Deliveries of older ones are ignored.
    generation: Cell<u64>,
    /// The coroutine's own context while it is suspended.
    parked: Cell<Option<Context>>,
    subscription: RefCell<Option<AbortHandle>>,
}

impl Control {
    pub(crate) fn new(spawner: LocalSpawner, cached_stacks: usize, leak_on_panic: bool) -> Self {
        Control {
            spawner,
            cached_stacks,
            leak_on_panic,
            phase: Cell::new(Phase::Running),
            paused: Cell::new(false),
            buffered: Cell::new(false),
            stop: Cell::new(None),
            generation: Cell::new(0),
            parked: Cell::new(None),
            subscription: RefCell::new(None),
        }
    }

    pub(crate) fn spawner(&self) -> &LocalSpawner {
        &self.spawner
    }

    pub(crate) fn cached_stacks(&self) -> usize {
        self.cached_stacks
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase.get()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        trace!(from = ?self.phase.get(), to = ?phase, "Driver phase change");
        self.phase.set(phase);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.get()
    }

    pub(crate) fn stop_reason(&self) -> Option<StopReason> {
        self.stop.get()
    }

    pub(crate) fn state(&self) -> DriverState {
        match (self.phase.get(), self.stop.get(), self.paused.get()) {
            (Phase::Done, _, _) => DriverState::Done,
            (_, Some(_), _) => DriverState::Cancelled,
            (Phase::Suspended, None, true) | (Phase::Following, None, true) => DriverState::Paused,
            (Phase::Suspended, None, false) | (Phase::Following, None, false) => {
                DriverState::Suspended
            },
            (Phase::Running, None, _) => DriverState::Running,
        }
    }

    /// Registers a new outstanding subscription, replacing the previous one.
    ///
    /// Returns the generation the delivery of the subscription has to present.
    pub(crate) fn subscribe(&self, abort: AbortHandle) -> u64 {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        if let Some(previous) = self.subscription.borrow_mut().replace(abort) {
            // Only one subscription may be outstanding. The old one can't deliver anyway.
            previous.abort();
        }
        trace!(generation, "Subscribed to a dependency");
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation.get()
    }

    /// Stores the context of a coroutine that just switched out of its stack.
    pub(crate) fn park(&self, context: Context) {
        let previous = self.parked.replace(Some(context));
        assert!(previous.is_none(), "Parking a coroutine that is already parked");
    }

    pub(crate) fn take_parked(&self) -> Option<Context> {
        self.parked.take()
    }

    /// Switches into the parked coroutine with the given instruction.
    fn resume(&self, instruction: Switch) {
        match self.take_parked() {
            Some(context) => {
                self.set_phase(Phase::Running);
                instruction.run_child(context, self);
            },
            None => warn!("No parked coroutine to resume"),
        }
    }

    /// The dependency of the given subscription settled, its output is ready for the coroutine.
    pub(crate) fn deliver(&self, generation: u64) {
        if !self.is_current(generation) || self.stop.get().is_some() {
            debug!(generation, "Ignoring a delivery of a stale subscription");
            return;
        }
        match self.phase.get() {
            Phase::Suspended if self.paused.get() => {
                debug!(generation, "Chain paused, buffering the dependency outcome");
                self.buffered.set(true);
            },
            Phase::Suspended => {
                self.subscription.borrow_mut().take();
                self.resume(Switch::Resume);
            },
            phase => warn!(generation, ?phase, "Dependency settled for a chain that isn't waiting"),
        }
    }

    /// The delivery of the given subscription is gone without settling.
    pub(crate) fn abandon(&self, generation: u64) {
        if !self.is_current(generation)
            || self.stop.get().is_some()
            || self.phase.get() != Phase::Suspended
        {
            return;
        }
        if self.leak_on_panic && thread::panicking() {
            warn!(generation, "Dependency dropped during a panic, leaking the coroutine");
            return;
        }
        warn!(generation, "Dependency dropped before settling, stopping the chain");
        self.stop(StopReason::Lost);
    }

    pub(crate) fn pause(&self) {
        if self.phase.get() != Phase::Done && !self.paused.replace(true) {
            debug!("Chain paused");
        }
    }

    /// Clears the pause flag and delivers whatever was held back.
    ///
    /// Returns true if a followed outcome was buffered; delivering that one is up to the typed
    /// chain.
    pub(crate) fn unpause(&self) -> bool {
        if !self.paused.replace(false) {
            return false;
        }
        debug!("Chain unpaused");
        if !self.buffered.replace(false) {
            return false;
        }
        match self.phase.get() {
            Phase::Suspended => {
                self.subscription.borrow_mut().take();
                self.resume(Switch::Resume);
                false
            },
            Phase::Following => true,
            _ => false,
        }
    }

    /// Requests the chain to stop for the given reason.
    ///
    /// A suspended coroutine gets the stop signal right away, a running one at its next
    /// suspension point. Returns true if there's no coroutine to deliver it to (the chain follows
    /// a plain future), in which case the typed chain has to settle right away.
    pub(crate) fn stop(&self, reason: StopReason) -> bool {
        if self.phase.get() == Phase::Done || self.stop.get().is_some() {
            return false;
        }
        debug!(?reason, phase = ?self.phase.get(), "Stopping the chain");
        self.stop.set(Some(reason));
        self.buffered.set(false);
        if let Some(subscription) = self.subscription.borrow_mut().take() {
            subscription.abort();
        }
        match self.phase.get() {
            Phase::Suspended => {
                self.resume(Switch::Stop);
                false
            },
            Phase::Following => true,
            Phase::Running | Phase::Done => false,
        }
    }
}

/// Observer of the chain's outcome.
type Observer<T, E> = Box<dyn FnOnce(&Result<T, Failure<E>>)>;

pub(crate) struct Chain<T, E> {
    control: Rc<Control>,
    outcome: RefCell<Option<Result<T, Failure<E>>>>,
    /// The outcome of a followed future, held back by a pause.
    held: RefCell<Option<Result<T, Failure<E>>>>,
    observers: RefCell<Vec<Observer<T, E>>>,
    waker: RefCell<Option<Waker>>,
    consumed: Cell<bool>,
}

impl<T, E> Chain<T, E> {
    pub(crate) fn new(control: Control) -> Self {
        Chain {
            control: Rc::new(control),
            outcome: RefCell::new(None),
            held: RefCell::new(None),
            observers: RefCell::new(Vec::new()),
            waker: RefCell::new(None),
            consumed: Cell::new(false),
        }
    }

    pub(crate) fn control(&self) -> &Rc<Control> {
        &self.control
    }

    /// Settles the controlling future.
    ///
    /// Only the first call has any effect, any later outcome is dropped. Returns if this call
    /// settled it.
    pub(crate) fn settle(&self, outcome: Result<T, Failure<E>>) -> bool {
        if self.control.phase() == Phase::Done {
            debug!("Chain already settled, discarding another outcome");
            return false;
        }
        self.control.set_phase(Phase::Done);
        match &outcome {
            Ok(_) => debug!("Chain settled with a value"),
            Err(failure) => debug!(kind = failure_kind(failure), "Chain settled with a failure"),
        }
        self.notify(outcome);
        true
    }

    /// Runs the pending observers, then hands the outcome over to `poll`.
    ///
    /// The outcome is out of the cell while the observers run. They may poll the chain or
    /// register more observers, and those run in the same go.
    fn notify(&self, outcome: Result<T, Failure<E>>) {
        let store = Store {
            chain: self,
            outcome: Some(outcome),
        };
        loop {
            let observers = mem::take(&mut *self.observers.borrow_mut());
            if observers.is_empty() {
                break;
            }
            if let Some(outcome) = store.outcome.as_ref() {
                for observer in observers {
                    observer(outcome);
                }
            }
        }
    }

    /// Registers an observer of the outcome.
    ///
    /// # Panics
    ///
    /// If the outcome was already taken by `poll`.
    pub(crate) fn on_settle(&self, observer: Observer<T, E>) {
        let stored = self.outcome.borrow_mut().take();
        match stored {
            Some(outcome) => {
                self.observers.borrow_mut().push(observer);
                self.notify(outcome);
            },
            None if self.control.phase() == Phase::Done && self.consumed.get() => {
                panic!("Observing a CoroutineResult already polled to completion")
            },
            // Not settled yet, or the observers run right now.
            None => self.observers.borrow_mut().push(observer),
        }
    }

    pub(crate) fn poll(&self, cx: &mut TaskContext<'_>) -> Poll<Result<T, Failure<E>>> {
        if let Some(outcome) = self.outcome.borrow_mut().take() {
            self.consumed.set(true);
            return Poll::Ready(outcome);
        }
        assert!(!self.consumed.get(), "CoroutineResult polled after completion");
        *self.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }

    pub(crate) fn stop(&self, reason: StopReason) {
        if self.control.stop(reason) {
            self.held.borrow_mut().take();
            self.settle(Err(Failure::stopped(reason)));
        }
    }

    /// The controlling future went away. Nobody is interested in the chain any more.
    pub(crate) fn release(&self) {
        if self.control.phase() == Phase::Done || self.control.stop_reason().is_some() {
            return;
        }
        if self.control.leak_on_panic && thread::panicking() {
            warn!("Controlling future dropped during a panic, leaking the chain");
            return;
        }
        debug!("Controlling future dropped, cancelling the chain");
        self.stop(StopReason::Cancelled);
    }
}

impl<T: 'static, E: 'static> Chain<T, E> {
    /// Makes the chain wait for a plain future directly, without any body.
    ///
    /// This is the terminal case of a delegation. The coroutine stack is no longer needed.
    pub(crate) fn follow(self: &Rc<Self>, fut: LocalBoxFuture<'static, Result<T, Failure<E>>>) {
        let (fut, abort) = future::abortable(fut);
        let generation = self.control.subscribe(abort);
        self.control.set_phase(Phase::Following);
        let mut guard = FollowGuard {
            chain: Rc::clone(self),
            generation,
            armed: true,
        };
        let task = async move {
            if let Ok(outcome) = fut.await {
                guard.armed = false;
                guard.chain.deliver_followed(guard.generation, outcome);
            }
        };
        if let Err(err) = self.control.spawner().spawn_local(task) {
            // The task (and the guard in it) is dropped by now, settling the chain.
            warn!(%err, "Can't spawn the follow task");
        }
    }

    fn deliver_followed(&self, generation: u64, outcome: Result<T, Failure<E>>) {
        if !self.control.is_current(generation) || self.control.phase() != Phase::Following {
            debug!(generation, "Ignoring a stale followed outcome");
            return;
        }
        if self.control.is_paused() {
            debug!(generation, "Chain paused, holding the followed outcome back");
            *self.held.borrow_mut() = Some(outcome);
            self.control.buffered.set(true);
        } else {
            self.control.subscription.borrow_mut().take();
            self.settle(outcome);
        }
    }

    pub(crate) fn unpause(&self) {
        if self.control.unpause() {
            let held = self.held.borrow_mut().take();
            if let Some(outcome) = held {
                self.control.subscription.borrow_mut().take();
                self.settle(outcome);
            }
        }
    }

}

/// Puts the outcome where `poll` finds it and wakes the poller, even if an observer panics.
struct Store<'a, T, E> {
    chain: &'a Chain<T, E>,
    outcome: Option<Result<T, Failure<E>>>,
}

impl<T, E> Drop for Store<'_, T, E> {
    fn drop(&mut self) {
        *self.chain.outcome.borrow_mut() = self.outcome.take();
        let waker = self.chain.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

fn failure_kind<E>(failure: &Failure<E>) -> &'static str {
    match failure {
        Failure::Failed(_) => "failed",
        Failure::Cancelled => "cancelled",
        Failure::Lost => "lost",
        Failure::Panicked(_) => "panicked",
    }
}

/// Settles the chain as lost if the follow task is dropped before it gets the outcome.
struct FollowGuard<T: 'static, E: 'static> {
    chain: Rc<Chain<T, E>>,
    generation: u64,
    armed: bool,
}

impl<T: 'static, E: 'static> Drop for FollowGuard<T, E> {
    fn drop(&mut self) {
        let control = self.chain.control();
        if !self.armed
            || !control.is_current(self.generation)
            || control.phase() != Phase::Following
        {
            return;
        }
        if control.leak_on_panic && thread::panicking() {
            return;
        }
        warn!(generation = self.generation, "Followed future dropped before settling");
        self.chain.stop(StopReason::Lost);
    }
}
