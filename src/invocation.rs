//! What a coroutine body returns: a final value or a tail delegation.
//!
//! A body never calls its successor. It returns [`Flow::Delegate`] with the next
//! [`Invocation`] and the driver runs that one in place of the body, on the same stack and for the
//! same controlling future. As the delegation is a return value, there's no way for the retired
//! body to run any further code after asking for it.

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::future::Future;

use futures::future::{FutureExt, LocalBoxFuture};

use crate::errors::Failure;
use crate::suspend::Suspend;

/// The result of running a coroutine body.
///
/// The error is the body's own failure. It fails the whole chain.
pub type BodyResult<T, E> = Result<Flow<T, E>, E>;

pub(crate) type BoxedBody<T, E> = Box<dyn FnOnce(&Suspend) -> BodyResult<T, E>>;

/// How a coroutine body finished.
pub enum Flow<T, E> {
    /// The final value of the whole chain.
    Return(T),
    /// Continue the chain with another invocation, in constant space.
    Delegate(Invocation<T, E>),
}

impl<T, E> Debug for Flow<T, E> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            Flow::Return(_) => write!(f, "Flow::Return(..)"),
            Flow::Delegate(invocation) => write!(f, "Flow::Delegate({:?})", invocation),
        }
    }
}

pub(crate) enum Kind<T, E> {
    Body(BoxedBody<T, E>),
    Call(Box<dyn FnOnce() -> Result<T, E>>),
    Async(Box<dyn FnOnce() -> LocalBoxFuture<'static, Result<T, Failure<E>>>>),
}

/// The next piece of work of a chain.
///
/// Either a suspendable body (it runs as a coroutine and can wait for dependencies) or a plain
/// computation. A plain computation runs synchronously; if it produces a future, the chain waits
/// for that future directly and no further body is involved.
pub struct Invocation<T, E>(Kind<T, E>);

impl<T: 'static, E: 'static> Invocation<T, E> {
    /// A suspendable body.
    pub fn body<B>(body: B) -> Self
    where
        B: FnOnce(&Suspend) -> BodyResult<T, E> + 'static,
    {
        Invocation(Kind::Body(Box::new(body)))
    }

    /// A plain computation producing the value directly.
    pub fn call<C>(call: C) -> Self
    where
        C: FnOnce() -> Result<T, E> + 'static,
    {
        Invocation(Kind::Call(Box::new(call)))
    }

    /// A plain computation producing a future with the value.
    pub fn call_async<C, F>(call: C) -> Self
    where
        C: FnOnce() -> F + 'static,
        F: Future<Output = Result<T, E>> + 'static,
    {
        Invocation(Kind::Async(Box::new(move || {
            call().map(|result| result.map_err(Failure::Failed)).boxed_local()
        })))
    }

    /// Wait for a future that already carries a chain outcome.
    ///
    /// This is the way to delegate to another coroutine that already runs: its
    /// [`CoroutineResult`](struct.CoroutineResult.html) is such a future, and its outcome
    /// (including cancellation) becomes the outcome of this chain.
    pub fn follow<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, Failure<E>>> + 'static,
    {
        Invocation(Kind::Async(Box::new(move || fut.boxed_local())))
    }
}

impl<T, E> Invocation<T, E> {
    /// Is this a body that can suspend (as opposed to a plain computation)?
    pub fn is_suspendable(&self) -> bool {
        matches!(self.0, Kind::Body(_))
    }

    pub(crate) fn into_kind(self) -> Kind<T, E> {
        self.0
    }
}

impl<T, E> Debug for Invocation<T, E> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let kind = match self.0 {
            Kind::Body(_) => "body",
            Kind::Call(_) => "call",
            Kind::Async(_) => "async",
        };
        write!(f, "Invocation({})", kind)
    }
}

/// Finishes the chain with a value.
///
/// ```
/// # use coroutail::prelude::*;
/// # fn body(_: &Suspend) -> BodyResult<u32, ()> {
/// done(42)
/// # }
/// ```
pub fn done<T, E>(value: T) -> BodyResult<T, E> {
    Ok(Flow::Return(value))
}

/// Continues the chain with another body.
///
/// The current body must return this right away, which the types enforce.
pub fn tail<T, E, B>(body: B) -> BodyResult<T, E>
where
    T: 'static,
    E: 'static,
    B: FnOnce(&Suspend) -> BodyResult<T, E> + 'static,
{
    Ok(Flow::Delegate(Invocation::body(body)))
}

/// Continues the chain with a plain computation.
pub fn tail_call<T, E, C>(call: C) -> BodyResult<T, E>
where
    T: 'static,
    E: 'static,
    C: FnOnce() -> Result<T, E> + 'static,
{
    Ok(Flow::Delegate(Invocation::call(call)))
}

/// Finishes the chain with the outcome of the given future, without keeping the body around.
pub fn follow<T, E, F>(fut: F) -> BodyResult<T, E>
where
    T: 'static,
    E: 'static,
    F: Future<Output = Result<T, Failure<E>>> + 'static,
{
    Ok(Flow::Delegate(Invocation::follow(fut)))
}

#[cfg(test)]
mod tests {
    use futures::future;

    use super::*;

    #[test]
    fn kinds() {
        let body = Invocation::<u32, ()>::body(|_| done(1));
        assert!(body.is_suspendable());
        assert_eq!("Invocation(body)", format!("{:?}", body));
        let call = Invocation::<u32, ()>::call(|| Ok(1));
        assert!(!call.is_suspendable());
        let fut = Invocation::<u32, ()>::call_async(|| future::ok(1));
        assert!(!fut.is_suspendable());
        assert_eq!("Invocation(async)", format!("{:?}", fut));
    }

    #[test]
    fn call_async_maps_errors() {
        let invocation = Invocation::<u32, &str>::call_async(|| future::err("boom"));
        let fut = match invocation.into_kind() {
            Kind::Async(start) => start(),
            _ => panic!("Not an async invocation"),
        };
        match futures::executor::block_on(fut) {
            Err(Failure::Failed("boom")) => (),
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[test]
    fn primitives() {
        assert!(matches!(done::<_, ()>(5), Ok(Flow::Return(5))));
        match tail_call::<u32, (), _>(|| Ok(5)) {
            Ok(Flow::Delegate(invocation)) => assert!(!invocation.is_suspendable()),
            other => panic!("Unexpected {:?}", other),
        }
    }
}
