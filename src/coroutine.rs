use std::any::Any;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll};

use context::stack::Stack;
use context::Context;
use futures::executor::LocalSpawner;
use futures::future::LocalBoxFuture;
use tracing::{debug, trace};

use crate::chain::{Chain, Control, DriverState};
use crate::errors::{Failure, StackError, StopReason};
use crate::invocation::{BodyResult, BoxedBody, Flow, Invocation, Kind};
use crate::stack_cache;
use crate::suspend::Suspend;
use crate::switch::{BoxedTask, Switch};

/// A `Future` representing the completion of a coroutine chain.
///
/// This is the one handle to a chain, no matter how many times its bodies delegate to each other.
/// Besides being awaited, it allows pausing, resuming and cancelling the chain.
///
/// Dropping it before the chain settles cancels the chain, just like [`cancel`](#method.cancel).
/// That's how cancellation reaches chains other chains wait for or follow. Use
/// [`detach`](#method.detach) to let the chain run on its own.
pub struct CoroutineResult<T, E> {
    chain: Rc<Chain<T, E>>,
    detached: bool,
}

impl<T: 'static, E: 'static> CoroutineResult<T, E> {
    /// Holds the outcomes of dependencies back.
    ///
    /// A dependency that settles while paused isn't delivered to the body until
    /// [`unpause`](#method.unpause). A body that is running right now finishes its current step
    /// and suspends at its next wait, even if the awaited future is already resolved. Pausing
    /// twice is the same as pausing once.
    pub fn pause(&self) {
        self.chain.control().pause();
    }

    /// Releases a pause.
    ///
    /// If a dependency settled in the meantime, the chain advances with its outcome right away,
    /// before this returns.
    pub fn unpause(&self) {
        self.chain.unpause();
    }

    /// Cancels the chain.
    ///
    /// A suspended body (paused or not) gets the stop signal right away and unwinds before this
    /// returns. A body running right now (this is called from within the chain) gets it at its
    /// next suspension point. Whatever the body produces afterwards is discarded and the outcome
    /// is [`Failure::Cancelled`].
    ///
    /// Does nothing if the chain already settled or got stopped.
    pub fn cancel(&self) {
        self.chain.stop(StopReason::Cancelled);
    }

    /// Lets the chain run to its end without anybody waiting for it.
    ///
    /// The outcome is still reported to the observers registered with
    /// [`on_settle`](#method.on_settle).
    pub fn detach(mut self) {
        trace!("Detaching a chain");
        self.detached = true;
    }

    /// The current state of the chain.
    pub fn state(&self) -> DriverState {
        self.chain.control().state()
    }

    /// Has the chain produced its outcome already?
    pub fn is_settled(&self) -> bool {
        self.state() == DriverState::Done
    }

    /// Registers a callback to be called with the outcome once the chain settles.
    ///
    /// If the chain settled already, the callback is called right away.
    ///
    /// # Panics
    ///
    /// If the result was already polled to completion. The outcome is gone by then.
    pub fn on_settle<O>(&self, observer: O)
    where
        O: FnOnce(&Result<T, Failure<E>>) + 'static,
    {
        self.chain.on_settle(Box::new(observer));
    }
}

impl<T: 'static, E: 'static> Future for CoroutineResult<T, E> {
    type Output = Result<T, Failure<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.chain.poll(cx)
    }
}

impl<T, E> Drop for CoroutineResult<T, E> {
    fn drop(&mut self) {
        if !self.detached {
            self.chain.release();
        }
    }
}

impl<T: 'static, E: 'static> Debug for CoroutineResult<T, E> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("CoroutineResult")
            .field("state", &self.state())
            .finish()
    }
}

/// A builder of coroutines.
///
/// This struct is the main entry point and a way to start coroutines of various kinds. It allows
/// both starting them with default parameters and configuring them with the builder pattern.
///
/// The builder is cheap to clone, so a body can carry one around and spawn further coroutines.
#[derive(Clone, Debug)]
pub struct Coroutine {
    spawner: LocalSpawner,
    stack_size: usize,
    leak_on_panic: bool,
    cached_stacks: usize,
}

impl Coroutine {
    /// Starts building a coroutine.
    ///
    /// # Parameters
    ///
    /// * `spawner`: The coroutines need an executor to wait for their dependencies on. This is
    ///   the spawner of the `LocalPool` to be used.
    ///
    /// # Examples
    ///
    /// ```
    /// use coroutail::prelude::*;
    /// use futures::executor::LocalPool;
    ///
    /// let mut pool = LocalPool::new();
    /// let builder = Coroutine::new(pool.spawner());
    ///
    /// let coroutine = builder.spawn(|_: &Suspend| -> BodyResult<u32, ()> { done(42) }).unwrap();
    /// assert_eq!(42, pool.run_until(coroutine).unwrap());
    /// ```
    pub fn new(spawner: LocalSpawner) -> Self {
        Coroutine {
            spawner,
            stack_size: Stack::default_size(),
            leak_on_panic: false,
            cached_stacks: 16,
        }
    }

    /// Spawns a coroutine directly.
    ///
    /// This spawns a coroutine with default parameters without the inconvenience of handling a
    /// builder. Unlike [`spawn`](#method.spawn), this one doesn't return an error, since the
    /// default stack is expected to always work.
    ///
    /// # Panics
    ///
    /// If the default stack can't be allocated.
    pub fn with_defaults<T, E, B>(spawner: LocalSpawner, body: B) -> CoroutineResult<T, E>
    where
        T: 'static,
        E: 'static,
        B: FnOnce(&Suspend) -> BodyResult<T, E> + 'static,
    {
        Coroutine::new(spawner)
            .spawn(body)
            .expect("Can't allocate a stack of the default size")
    }

    /// Configures the stack size used for coroutines.
    ///
    /// Coroutines spawned from this builder will get stack of this size. The default is
    /// something small, so if you use recursion, you might want to use this.
    ///
    /// The stack size might be rounded up to a whole number of pages.
    ///
    /// Tail delegation doesn't need a larger stack, the delegated bodies run at the same depth.
    pub fn stack_size(&mut self, size: usize) -> &mut Self {
        self.stack_size = size;
        self
    }

    /// What to do with a suspended coroutine if its executor gets dropped during a panic.
    ///
    /// Normally, such a coroutine gets the stop signal and unwinds. Unwinding while the thread
    /// already panics could abort the whole program, so this allows leaking the coroutine (with
    /// everything on its stack) instead.
    pub fn leak_on_panic(&mut self, leak: bool) -> &mut Self {
        self.leak_on_panic = leak;
        self
    }

    /// How many finished stacks of a given size may be kept for reuse by this thread.
    pub fn cached_stacks(&mut self, limit: usize) -> &mut Self {
        self.cached_stacks = limit;
        self
    }

    /// Spawns a coroutine with the configuration in this builder.
    ///
    /// The body starts running right away and keeps running until it waits for something that
    /// isn't ready yet or until the chain finishes. Then the call returns.
    ///
    /// # Errors
    ///
    /// If the stack for the coroutine can't be allocated.
    pub fn spawn<T, E, B>(&self, body: B) -> Result<CoroutineResult<T, E>, StackError>
    where
        T: 'static,
        E: 'static,
        B: FnOnce(&Suspend) -> BodyResult<T, E> + 'static,
    {
        self.invoke(Invocation::body(body))
    }

    /// Starts a chain with the given invocation.
    ///
    /// Only suspendable bodies get a coroutine of their own. A plain computation is simply
    /// performed (or its future followed) and the result reflects its outcome.
    pub fn invoke<T, E>(
        &self,
        invocation: Invocation<T, E>,
    ) -> Result<CoroutineResult<T, E>, StackError>
    where
        T: 'static,
        E: 'static,
    {
        let control = Control::new(self.spawner.clone(), self.cached_stacks, self.leak_on_panic);
        let chain = Rc::new(Chain::new(control));
        debug!(?invocation, stack_size = self.stack_size, "Starting a chain");
        match invocation.into_kind() {
            Kind::Body(body) => {
                let stack = stack_cache::get(self.stack_size)?;
                let chain_cp = Rc::clone(&chain);
                let task: BoxedTask = Box::new(move |parent| drive(chain_cp, body, parent));
                Switch::run_new_coroutine(stack, self.stack_size, task, chain.control());
            },
            Kind::Call(call) => {
                chain.settle(call_outcome(call));
            },
            Kind::Async(start) => match panic::catch_unwind(AssertUnwindSafe(start)) {
                Ok(fut) => chain.follow(fut),
                Err(panic) => {
                    chain.settle(Err(Failure::Panicked(panic)));
                },
            },
        }
        Ok(CoroutineResult {
            chain,
            detached: false,
        })
    }

    /// Turns a function into one that runs as a coroutine.
    ///
    /// Each call of the returned function spawns a new chain with the wrapped function as its
    /// first body.
    ///
    /// ```
    /// use coroutail::prelude::*;
    /// use futures::executor::LocalPool;
    ///
    /// let mut pool = LocalPool::new();
    /// let double = Coroutine::new(pool.spawner())
    ///     .wrap(|_: &Suspend, x: u32| -> BodyResult<u32, ()> { done(2 * x) });
    /// assert_eq!(42, pool.run_until(double(21).unwrap()).unwrap());
    /// ```
    pub fn wrap<A, T, E, F>(
        &self,
        f: F,
    ) -> impl Fn(A) -> Result<CoroutineResult<T, E>, StackError>
    where
        A: 'static,
        T: 'static,
        E: 'static,
        F: Fn(&Suspend, A) -> BodyResult<T, E> + 'static,
    {
        let builder = self.clone();
        let f = Rc::new(f);
        move |arg| {
            let f = Rc::clone(&f);
            builder.spawn(move |suspend: &Suspend| f(suspend, arg))
        }
    }
}

/// How the drive loop finished.
enum Finish<T, E> {
    Settle(Result<T, Failure<E>>),
    Follow(LocalBoxFuture<'static, Result<T, Failure<E>>>),
}

fn call_outcome<T, E>(call: Box<dyn FnOnce() -> Result<T, E>>) -> Result<T, Failure<E>> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Failure::Failed(err)),
        Err(panic) => Err(Failure::Panicked(panic)),
    }
}

/// The task of a chain's coroutine.
///
/// Runs the bodies one after another from this single loop, so a delegation replaces the current
/// body instead of nesting a new one in it.
fn drive<T: 'static, E: 'static>(
    chain: Rc<Chain<T, E>>,
    body: BoxedBody<T, E>,
    parent: Context,
) -> (Context, Option<Box<dyn Any + Send>>) {
    let control = Rc::clone(chain.control());
    let suspend = Suspend::new(Rc::clone(&control), parent);
    let mut next = Kind::Body(body);
    let mut delegations: u64 = 0;
    let finish = loop {
        if let Some(reason) = control.stop_reason() {
            // A delegation asked for after the stop is never started.
            break Finish::Settle(Err(Failure::stopped(reason)));
        }
        match next {
            Kind::Body(body) => match panic::catch_unwind(AssertUnwindSafe(|| body(&suspend))) {
                Ok(Ok(Flow::Delegate(invocation))) => {
                    delegations += 1;
                    trace!(delegations, ?invocation, "Tail delegation");
                    next = invocation.into_kind();
                },
                Ok(Ok(Flow::Return(value))) => break Finish::Settle(Ok(value)),
                Ok(Err(err)) => break Finish::Settle(Err(Failure::Failed(err))),
                Err(panic) => break Finish::Settle(Err(Failure::Panicked(panic))),
            },
            Kind::Call(call) => break Finish::Settle(call_outcome(call)),
            Kind::Async(start) => match panic::catch_unwind(AssertUnwindSafe(start)) {
                Ok(fut) => break Finish::Follow(fut),
                Err(panic) => break Finish::Settle(Err(Failure::Panicked(panic))),
            },
        }
    };
    let finish = match control.stop_reason() {
        Some(reason) => {
            debug!(?reason, delegations, "Chain stopped, discarding what the body produced");
            Finish::Settle(Err(Failure::stopped(reason)))
        },
        None => finish,
    };
    let parent = suspend.into_parent();
    // Observers and the waker run here, on the coroutine stack. A panic in them belongs to
    // whoever resumed us.
    let panic = panic::catch_unwind(AssertUnwindSafe(|| match finish {
        Finish::Settle(outcome) => {
            chain.settle(outcome);
        },
        Finish::Follow(fut) => chain.follow(fut),
    }))
    .err();
    (parent, panic)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use futures::channel::oneshot;
    use futures::executor::LocalPool;
    use futures::future;

    use super::*;
    use crate::invocation::{done, tail};

    /// Test spawning and execution of nested coroutines.
    #[test]
    fn spawn_some() {
        let mut pool = LocalPool::new();
        let s1 = Rc::new(Cell::new(false));
        let s2 = Rc::new(Cell::new(false));
        let s1c = Rc::clone(&s1);
        let s2c = Rc::clone(&s2);

        let builder = Coroutine::new(pool.spawner());
        let builder_inner = builder.clone();

        let result = builder
            .spawn(move |suspend: &Suspend| -> BodyResult<u32, ()> {
                let inner = builder_inner
                    .spawn(move |_: &Suspend| -> BodyResult<u32, ()> {
                        s2c.set(true);
                        done(42)
                    })
                    .unwrap();
                s1c.set(true);
                done(suspend.wait(inner).unwrap())
            })
            .unwrap();

        // Both coroutines run to finish
        assert!(s1.get(), "The outer closure didn't run");
        assert!(s2.get(), "The inner closure didn't run");
        assert_eq!(DriverState::Done, result.state());
        assert_eq!(42, pool.run_until(result).unwrap());
    }

    /// Wait for a future to complete.
    #[test]
    fn future_wait() {
        let mut pool = LocalPool::new();
        let (sender, receiver) = oneshot::channel();
        let all_done = Coroutine::with_defaults(pool.spawner(), move |suspend| {
            done::<_, ()>(suspend.wait(receiver).unwrap())
        });
        assert_eq!(DriverState::Suspended, all_done.state());
        Coroutine::with_defaults(pool.spawner(), move |suspend| {
            suspend.wait(future::ready(()));
            sender.send(42).unwrap();
            done::<_, ()>(())
        });
        assert_eq!(42, pool.run_until(all_done).unwrap());
    }

    /// The panic doesn't kill the main thread, but is reported.
    #[test]
    fn panics() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let panicking = Coroutine::with_defaults(spawner.clone(), |_| -> BodyResult<u32, ()> {
            panic!("Test")
        });
        match pool.run_until(panicking) {
            Err(Failure::Panicked(payload)) => {
                assert_eq!("Test", *payload.downcast::<&str>().unwrap());
            },
            _ => panic!("Panic not reported properly"),
        }
        let fine = Coroutine::with_defaults(spawner, |_| done::<_, ()>(42));
        assert_eq!(42, pool.run_until(fine).unwrap());
    }

    /// Plain invocations don't need a coroutine.
    #[test]
    fn plain_invocations() {
        let mut pool = LocalPool::new();
        let builder = Coroutine::new(pool.spawner());
        let direct = builder.invoke(Invocation::<_, ()>::call(|| Ok(1))).unwrap();
        assert!(direct.is_settled());
        assert_eq!(1, pool.run_until(direct).unwrap());
        let failed = builder.invoke(Invocation::<u32, _>::call(|| Err("nope"))).unwrap();
        assert!(matches!(pool.run_until(failed), Err(Failure::Failed("nope"))));
        let fut = builder
            .invoke(Invocation::<_, ()>::call_async(|| future::ok(2)))
            .unwrap();
        assert_eq!(DriverState::Suspended, fut.state());
        assert_eq!(2, pool.run_until(fut).unwrap());
    }

    /// The stack goes back to the cache once the chain finishes.
    #[test]
    fn stack_reused() {
        const SIZE: usize = 5 * 40_960 + 3;
        let mut pool = LocalPool::new();
        let mut builder = Coroutine::new(pool.spawner());
        builder.stack_size(SIZE).cached_stacks(2);
        let (sender, receiver) = oneshot::channel::<()>();
        let result = builder
            .spawn(move |suspend: &Suspend| {
                suspend.wait(receiver).unwrap();
                tail(|_: &Suspend| done::<_, ()>(()))
            })
            .unwrap();
        let before = stack_cache::cached(SIZE);
        sender.send(()).unwrap();
        pool.run_until(result).unwrap();
        assert_eq!(before + 1, stack_cache::cached(SIZE));
    }

    #[test]
    fn wrapped() {
        let mut pool = LocalPool::new();
        let add = Coroutine::new(pool.spawner()).wrap(|suspend: &Suspend, (a, b): (u32, u32)| {
            done::<_, ()>(suspend.wait(future::ready(a + b)))
        });
        let first = add((1, 2)).unwrap();
        let second = add((20, 22)).unwrap();
        assert_eq!(3, pool.run_until(first).unwrap());
        assert_eq!(42, pool.run_until(second).unwrap());
    }

    /// The outcome is gone once polled out, observing it afterwards is a bug.
    #[test]
    #[should_panic(expected = "polled to completion")]
    fn observer_after_completion() {
        let mut pool = LocalPool::new();
        let mut result = Coroutine::with_defaults(pool.spawner(), |_| done::<u32, ()>(1));
        assert_eq!(1, pool.run_until(&mut result).unwrap());
        result.on_settle(|_| ());
    }

    #[test]
    fn observers() {
        let mut pool = LocalPool::new();
        let (sender, receiver) = oneshot::channel();
        let result = Coroutine::with_defaults(pool.spawner(), move |suspend| {
            done::<u32, ()>(suspend.wait(receiver).unwrap())
        });
        let seen = Rc::new(Cell::new(None));
        let seen_cp = Rc::clone(&seen);
        result.on_settle(move |outcome| seen_cp.set(outcome.as_ref().ok().copied()));
        sender.send(12).unwrap();
        pool.run_until_stalled();
        assert_eq!(Some(12), seen.get());
        let late = Rc::new(Cell::new(false));
        let late_cp = Rc::clone(&late);
        result.on_settle(move |_| late_cp.set(true));
        assert!(late.get());
        assert_eq!(12, pool.run_until(result).unwrap());
    }
}
