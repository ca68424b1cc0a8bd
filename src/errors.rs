//! Errors and outcomes of coroutines.

use std::any::Any;
use std::io;

use thiserror::Error;

/// The stop signal delivered into a suspended coroutine.
///
/// A coroutine waiting on a dependency gets this instead of the dependency's output when the
/// chain is cancelled (or when the executor that was supposed to resolve the dependency went
/// away). The body is expected to clean up and terminate. Whatever it produces afterwards is
/// discarded, the controlling future already knows the outcome.
///
/// Methods that don't return the signal explicitly (like [`Suspend::wait`]) unwind the
/// coroutine's stack with this as the panic payload, so destructors act as the cleanup.
///
/// [`Suspend::wait`]: ../struct.Suspend.html#method.wait
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Error)]
#[error("the coroutine was stopped at its suspension point")]
pub struct Stopped;

/// Why a chain received the stop signal.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum StopReason {
    /// The controlling future got cancelled.
    Cancelled,
    /// The dependency (or the executor driving it) got dropped without settling.
    Lost,
}

/// The ways a coroutine chain can fail.
///
/// This is the error side of the controlling future. Exactly one outcome is ever reported for a
/// chain, so the caller can branch on "was cancelled" vs "failed" without races.
#[derive(Debug, Error)]
pub enum Failure<E> {
    /// The body returned an error.
    #[error("the coroutine failed: {0}")]
    Failed(E),
    /// The controlling future got cancelled and the body finished unwinding.
    #[error("the coroutine was cancelled")]
    Cancelled,
    /// The executor dropped a dependency of the coroutine before it settled.
    #[error("a dependency of the coroutine was dropped before settling")]
    Lost,
    /// The body panicked. The payload is the one from the panic.
    #[error("the coroutine panicked")]
    Panicked(Box<dyn Any + Send + 'static>),
}

impl<E> Failure<E> {
    /// Was the chain cancelled (as opposed to failing on its own)?
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Failure::Cancelled)
    }

    /// Extracts the error the body returned, if that's what happened.
    pub fn into_failed(self) -> Option<E> {
        match self {
            Failure::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Converts the error the body returned.
    pub fn map_failed<F, M: FnOnce(E) -> F>(self, map: M) -> Failure<F> {
        match self {
            Failure::Failed(e) => Failure::Failed(map(e)),
            Failure::Cancelled => Failure::Cancelled,
            Failure::Lost => Failure::Lost,
            Failure::Panicked(payload) => Failure::Panicked(payload),
        }
    }

    pub(crate) fn stopped(reason: StopReason) -> Self {
        match reason {
            StopReason::Cancelled => Failure::Cancelled,
            StopReason::Lost => Failure::Lost,
        }
    }
}

/// Allocating a stack for a new coroutine failed.
#[derive(Debug, Error)]
pub enum StackError {
    /// The requested size is larger than the platform allows.
    #[error("requested stack size {0} exceeds the maximum stack size")]
    ExceedsMaximumSize(usize),
    /// Mapping the stack memory failed.
    #[error("failed to map the coroutine stack")]
    Io(#[source] io::Error),
}

impl From<context::stack::StackError> for StackError {
    fn from(err: context::stack::StackError) -> Self {
        match err {
            context::stack::StackError::ExceedsMaximumSize(size) => {
                StackError::ExceedsMaximumSize(size)
            },
            context::stack::StackError::IoError(err) => StackError::Io(err),
        }
    }
}
