#![doc(html_root_url = "https://docs.rs/coroutail/0.1.0/coroutail/")]

//! Coroutines driven by futures, with pause, cancellation and tail-call elimination.
//!
//! A coroutine here is a plain Rust closure running on a stack of its own. It can wait for a
//! future to complete anywhere in its code (even deep inside helper functions), which suspends it
//! without blocking the thread. The executor (a `futures` `LocalPool`) goes on with other tasks and
//! the coroutine continues once the future resolves.
//!
//! A spawned coroutine is represented by a [`CoroutineResult`], a future of its outcome. Other
//! coroutines can wait for it, or it can be composed with other futures in the usual way. On top
//! of that, it can be paused (settled dependencies are held back until it is unpaused) and
//! cancelled (the body gets a stop signal at its suspension point and unwinds, running its
//! cleanup).
//!
//! # Tail delegation
//!
//! A body finishes by returning a [`Flow`]. Either with the final value, or with another
//! [`Invocation`] the chain should continue with. The driver replaces the finished body with the
//! next one on the same stack and the same controlling future, so a chain of any length runs in
//! constant space: no growing stack, no growing number of pending futures.
//!
//! # The cost
//!
//! * Each chain needs a stack. The stack can't be allocated through the usual allocator, but is
//!   mapped directly by the OS. Finished stacks are cached per thread and reused, but creating
//!   them still has a cost.
//! * Each wait for a future that isn't ready yet spawns a task on the executor.
//!
//! # Known problems
//!
//! * Many places have `'static` bounds on the types, even though these shouldn't be needed in
//!   theory.
//! * No support for threads. A stack can't move between threads.
//! * Cleaning up of stacks (and things on them) when the coroutine is cancelled while using
//!   [`Suspend::wait`] is done through unwinding. Use [`Suspend::wait_cleanup`] to handle the stop
//!   signal explicitly.
//!
//! # Examples
//!
//! ```
//! use coroutail::prelude::*;
//! use futures::channel::oneshot;
//! use futures::executor::LocalPool;
//!
//! fn count_down(n: u64, acc: u64) -> BodyResult<u64, ()> {
//!     if n == 0 {
//!         done(acc)
//!     } else {
//!         tail(move |_: &Suspend| count_down(n - 1, acc + n))
//!     }
//! }
//!
//! let mut pool = LocalPool::new();
//! let (sender, receiver) = oneshot::channel();
//! let coroutine = Coroutine::new(pool.spawner())
//!     .spawn(move |suspend: &Suspend| {
//!         let start = suspend.wait(receiver).map_err(|_| ())?;
//!         tail(move |_: &Suspend| count_down(start, 0))
//!     })
//!     .unwrap();
//! assert_eq!(DriverState::Suspended, coroutine.state());
//! sender.send(10_000).unwrap();
//! assert_eq!(50_005_000, pool.run_until(coroutine).unwrap());
//! ```

pub mod errors;
pub mod prelude;
pub mod wrappers;

mod chain;
mod coroutine;
mod invocation;
mod stack_cache;
mod suspend;
mod switch;

pub use crate::chain::DriverState;
pub use crate::coroutine::{Coroutine, CoroutineResult};
pub use crate::errors::{Failure, StackError, Stopped};
pub use crate::invocation::{done, follow, tail, tail_call, BodyResult, Flow, Invocation};
pub use crate::suspend::Suspend;
