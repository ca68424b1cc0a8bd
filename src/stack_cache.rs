//! A thread-local cache of coroutine stacks.
//!
//! Mapping a stack is a syscall (and unmapping flushes the TLB), so a finished chain hands its
//! stack back here and the next chain of the same size reuses it.

use std::cell::RefCell;
use std::collections::HashMap;

use context::stack::ProtectedFixedSizeStack;
use tracing::trace;

use crate::errors::StackError;

thread_local! {
    static CACHE: RefCell<HashMap<usize, Vec<ProtectedFixedSizeStack>>> =
        RefCell::new(HashMap::new());
}

/// Get a stack of the given size.
///
/// Retrieve it from the cache or create a new one, if none is available. The size is the one
/// requested by the user, the stack itself may be slightly larger (rounded to pages).
pub(crate) fn get(size: usize) -> Result<ProtectedFixedSizeStack, StackError> {
    let cached = CACHE.with(|c| c.borrow_mut().get_mut(&size).and_then(Vec::pop));
    match cached {
        Some(stack) => {
            trace!(size, "Reusing a cached stack");
            Ok(stack)
        },
        None => {
            trace!(size, "Mapping a new stack");
            Ok(ProtectedFixedSizeStack::new(size)?)
        },
    }
}

/// Put a stack into the cache, for future reuse.
///
/// The stack is filed under the size it was requested with. If there are already `limit` stacks
/// of that size, the stack is unmapped instead.
pub(crate) fn put(size: usize, stack: ProtectedFixedSizeStack, limit: usize) {
    CACHE.with(|c| {
        let mut cache = c.borrow_mut();
        let stacks = cache.entry(size).or_insert_with(Vec::new);
        if stacks.len() < limit {
            stacks.push(stack);
        } else {
            trace!(size, limit, "Stack cache full, unmapping the stack");
        }
    });
}

#[cfg(test)]
pub(crate) fn cached(size: usize) -> usize {
    CACHE.with(|c| c.borrow().get(&size).map_or(0, Vec::len))
}
