//! The handle a coroutine body waits through.

use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::future::Future;
use std::panic;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll};

use context::Context;
use futures::executor::LocalSpawner;
use futures::future;
use futures::task::{noop_waker_ref, LocalSpawnExt};
use futures::Stream;
use tracing::{trace, warn};

use crate::chain::{Control, Phase};
use crate::errors::{StopReason, Stopped};
use crate::switch::Switch;
use crate::wrappers::{CleanupIterator, OkIterator, ResultIterator};

/// Access to the suspension points of the running coroutine.
///
/// Every body gets a reference to this. Waiting on a future through it suspends the whole
/// coroutine stack (no matter how deep in helper functions the wait happens) and lets the
/// executor run other things until the future resolves.
///
/// The handle belongs to the chain, not to a single body. A body delegating to another one passes
/// it on implicitly, the next body gets the same handle.
pub struct Suspend {
    control: Rc<Control>,
    /// Whoever switched into the coroutine last. That's where a suspension goes.
    parent: Cell<Option<Context>>,
}

impl Suspend {
    pub(crate) fn new(control: Rc<Control>, parent: Context) -> Self {
        Suspend {
            control,
            parent: Cell::new(Some(parent)),
        }
    }

    pub(crate) fn into_parent(self) -> Context {
        self.parent
            .into_inner()
            .expect("Coroutine finishing while switched out")
    }

    /// The spawner of the executor the coroutine runs on.
    ///
    /// Useful for spawning futures or nested coroutines from within the body.
    pub fn spawner(&self) -> &LocalSpawner {
        self.control.spawner()
    }

    /// Has the chain received the stop signal?
    ///
    /// Once this is true, every further wait returns (or unwinds with) [`Stopped`] right away.
    pub fn is_stopped(&self) -> bool {
        self.control.stop_reason().is_some()
    }

    /// Waits for a future, returning the stop signal if it arrives instead.
    ///
    /// The coroutine is suspended until the future resolves. If the future is already resolved,
    /// the output is returned without suspending (unless the chain is paused, in which case the
    /// coroutine waits for `unpause`).
    ///
    /// # Errors
    ///
    /// `Err(Stopped)` means the chain got cancelled, or the executor was dropped with the future
    /// still pending. The body should clean up and return, whatever it returns is ignored.
    pub fn wait_cleanup<F>(&self, fut: F) -> Result<F::Output, Stopped>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        if self.is_stopped() {
            return Err(Stopped);
        }
        let mut fut = Box::pin(fut);
        if !self.control.is_paused() {
            let mut cx = TaskContext::from_waker(noop_waker_ref());
            if let Poll::Ready(output) = fut.as_mut().poll(&mut cx) {
                trace!("Dependency ready, not suspending");
                return Ok(output);
            }
        }
        let slot = Rc::new(RefCell::new(None));
        self.subscribe(fut, Rc::clone(&slot))?;
        match self.suspend() {
            Switch::Resume => slot.borrow_mut().take().ok_or(Stopped),
            Switch::Stop => Err(Stopped),
            _ => unreachable!("Invalid switch instruction on wakeup"),
        }
    }

    /// Waits for a future.
    ///
    /// Like [`wait_cleanup`](#method.wait_cleanup), but the stop signal unwinds the coroutine's
    /// stack (with [`Stopped`] as the panic payload) instead of being returned. Destructors of
    /// everything on the stack do the cleanup.
    pub fn wait<F>(&self, fut: F) -> F::Output
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.wait_cleanup(fut)
            .unwrap_or_else(|stopped| panic::resume_unwind(Box::new(stopped)))
    }

    /// Iterates through a stream, waiting for each item.
    pub fn stream<S>(&self, stream: S) -> CleanupIterator<'_, S>
    where
        S: Stream + Unpin + 'static,
        S::Item: 'static,
    {
        CleanupIterator::new(self, stream)
    }

    /// Iterates through the successful items of a stream of results.
    ///
    /// The iteration ends with the first error. A stop signal unwinds.
    pub fn stream_ok<S, I, E>(&self, stream: S) -> OkIterator<CleanupIterator<'_, S>>
    where
        S: Stream<Item = Result<I, E>> + Unpin + 'static,
        I: 'static,
        E: 'static,
    {
        OkIterator::new(self.stream(stream))
    }

    /// Iterates through a stream of results, including the errors.
    ///
    /// A stop signal unwinds.
    pub fn stream_result<S, I, E>(&self, stream: S) -> ResultIterator<CleanupIterator<'_, S>>
    where
        S: Stream<Item = Result<I, E>> + Unpin + 'static,
        I: 'static,
        E: 'static,
    {
        ResultIterator::new(self.stream(stream))
    }

    /// Spawns the task delivering the future's output into the slot.
    fn subscribe<F>(
        &self,
        fut: Pin<Box<F>>,
        slot: Rc<RefCell<Option<F::Output>>>,
    ) -> Result<(), Stopped>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let (fut, abort) = future::abortable(fut);
        let generation = self.control.subscribe(abort);
        let mut delivery = Delivery {
            control: Rc::clone(&self.control),
            generation,
            armed: true,
        };
        let task = async move {
            if let Ok(output) = fut.await {
                *slot.borrow_mut() = Some(output);
                delivery.armed = false;
                delivery.control.deliver(delivery.generation);
            }
        };
        match self.control.spawner().spawn_local(task) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%err, "Can't spawn the delivery task, the executor is gone");
                self.control.stop(StopReason::Lost);
                Err(Stopped)
            },
        }
    }

    /// Switches out of the coroutine until someone resumes it.
    fn suspend(&self) -> Switch {
        self.control.set_phase(Phase::Suspended);
        let parent = self
            .parent
            .take()
            .expect("Suspending a coroutine that is switched out");
        let (reply, parent) = Switch::Suspended.exchange(parent);
        self.parent.set(Some(parent));
        reply
    }
}

impl Debug for Suspend {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("Suspend")
            .field("state", &self.control.state())
            .finish()
    }
}

/// Notifies the chain if the delivery task goes away without delivering.
///
/// That happens either because the subscription got aborted (then the chain knows already) or
/// because the executor dropped the task.
struct Delivery {
    control: Rc<Control>,
    generation: u64,
    armed: bool,
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.armed {
            self.control.abandon(self.generation);
        }
    }
}
