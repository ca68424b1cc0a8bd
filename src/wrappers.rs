//! Iterators over streams, for use inside a coroutine.
//!
//! The types here are not expected to be created directly. They are returned from
//! [`Suspend::stream`](../struct.Suspend.html#method.stream) and its siblings (or the
//! [`CoroutineStream`](../prelude/trait.CoroutineStream.html) extension trait).

use std::panic;

use futures::{Stream, StreamExt};

use crate::errors::Stopped;
use crate::suspend::Suspend;

/// An iterator waiting for the items of a stream.
///
/// Each `next` suspends the coroutine until the stream yields. The stop signal is returned as an
/// item, after which the stream is gone and the iterator keeps returning the signal.
pub struct CleanupIterator<'a, S> {
    suspend: &'a Suspend,
    stream: Option<S>,
}

impl<'a, S> CleanupIterator<'a, S> {
    /// A constructor.
    pub fn new(suspend: &'a Suspend, stream: S) -> Self {
        CleanupIterator {
            suspend,
            stream: Some(stream),
        }
    }

    /// Extracts the stream inside.
    ///
    /// # Errors
    ///
    /// `Err(Stopped)` if the stream got dropped because the coroutine received the stop signal
    /// while waiting for an item.
    pub fn into_inner(self) -> Result<S, Stopped> {
        self.stream.ok_or(Stopped)
    }
}

impl<'a, S> Iterator for CleanupIterator<'a, S>
where
    S: Stream + Unpin + 'static,
    S::Item: 'static,
{
    type Item = Result<S::Item, Stopped>;

    fn next(&mut self) -> Option<Result<S::Item, Stopped>> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            // Lost in a previous attempt. Still dead.
            None => return Some(Err(Stopped)),
        };
        match self.suspend.wait_cleanup(stream.into_future()) {
            Ok((item, stream)) => {
                self.stream = Some(stream);
                item.map(Ok)
            },
            Err(Stopped) => Some(Err(Stopped)),
        }
    }
}

fn unwind_stopped<T>(r: Result<T, Stopped>) -> T {
    r.unwrap_or_else(|stopped| panic::resume_unwind(Box::new(stopped)))
}

/// An iterator through the successful items of a stream of results.
///
/// It ends at the first error. The stop signal unwinds the coroutine.
pub struct OkIterator<I>(I);

impl<I> OkIterator<I> {
    /// A constructor.
    pub fn new(inner: I) -> Self {
        OkIterator(inner)
    }

    /// Extracts the `CleanupIterator` inside.
    pub fn into_inner(self) -> I {
        self.0
    }
}

impl<'a, T, E, S> Iterator for OkIterator<CleanupIterator<'a, S>>
where
    S: Stream<Item = Result<T, E>> + Unpin + 'static,
    T: 'static,
    E: 'static,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.0.next().map(unwind_stopped).and_then(Result::ok)
    }
}

/// An iterator through the results of a stream.
///
/// The stop signal unwinds the coroutine.
pub struct ResultIterator<I>(I);

impl<I> ResultIterator<I> {
    /// A constructor.
    pub fn new(inner: I) -> Self {
        ResultIterator(inner)
    }

    /// Extracts the `CleanupIterator` inside.
    pub fn into_inner(self) -> I {
        self.0
    }
}

impl<'a, T, E, S> Iterator for ResultIterator<CleanupIterator<'a, S>>
where
    S: Stream<Item = Result<T, E>> + Unpin + 'static,
    T: 'static,
    E: 'static,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Result<T, E>> {
        self.0.next().map(unwind_stopped)
    }
}
