//! A module for wildcard import.
//!
//! This contains the things commonly used when writing coroutine bodies: the builder, the
//! suspension handle, the primitives for finishing or delegating a body and extension traits
//! for waiting on futures and iterating streams.

use std::future::Future;

use futures::Stream;

pub use crate::chain::DriverState;
pub use crate::coroutine::{Coroutine, CoroutineResult};
pub use crate::errors::{Failure, Stopped};
pub use crate::invocation::{done, follow, tail, tail_call, BodyResult, Flow, Invocation};
pub use crate::suspend::Suspend;
use crate::wrappers::{CleanupIterator, OkIterator, ResultIterator};

/// Waiting on a future from within a coroutine, in the method-call style.
pub trait CoroutineFuture: Future + Sized + 'static
where
    Self::Output: 'static,
{
    /// Same as [`Suspend::wait_cleanup`](../struct.Suspend.html#method.wait_cleanup).
    fn coro_wait_cleanup(self, suspend: &Suspend) -> Result<Self::Output, Stopped> {
        suspend.wait_cleanup(self)
    }

    /// Same as [`Suspend::wait`](../struct.Suspend.html#method.wait).
    fn coro_wait(self, suspend: &Suspend) -> Self::Output {
        suspend.wait(self)
    }
}

impl<F> CoroutineFuture for F
where
    F: Future + 'static,
    F::Output: 'static,
{
}

/// Iterating a stream from within a coroutine.
pub trait CoroutineStream: Stream + Unpin + Sized + 'static
where
    Self::Item: 'static,
{
    /// Iterates through the items, returning the stop signal as an item.
    fn iter_cleanup(self, suspend: &Suspend) -> CleanupIterator<'_, Self> {
        suspend.stream(self)
    }

    /// Iterates through the successful items, up to the first error.
    fn iter_ok<T, E>(self, suspend: &Suspend) -> OkIterator<CleanupIterator<'_, Self>>
    where
        Self: Stream<Item = Result<T, E>>,
        T: 'static,
        E: 'static,
    {
        suspend.stream_ok(self)
    }

    /// Iterates through the results.
    fn iter_result<T, E>(self, suspend: &Suspend) -> ResultIterator<CleanupIterator<'_, Self>>
    where
        Self: Stream<Item = Result<T, E>>,
        T: 'static,
        E: 'static,
    {
        suspend.stream_result(self)
    }
}

impl<S> CoroutineStream for S
where
    S: Stream + Unpin + 'static,
    S::Item: 'static,
{
}
