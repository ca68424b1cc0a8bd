//! This uses multiple pools at once on the same thread.
//!
//! It checks there's no mixup in the thread-local state (the stack cache) and that switching
//! between coroutines of different pools nests properly.

use std::future::Future;
use std::sync::OnceLock;
use std::task::Poll;

use coroutail::prelude::*;
use futures::executor::LocalPool;
use futures::future;

fn init_tracing() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

/// A future that isn't ready on the first poll, so the coroutine really suspends.
fn yield_now() -> impl Future<Output = ()> {
    let mut yielded = false;
    future::poll_fn(move |cx| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    })
}

fn recurse(depth: u8) -> u32 {
    if depth == 0 {
        return 1;
    }
    let mut pool = LocalPool::new();
    let mut builder = Coroutine::new(pool.spawner());
    builder.stack_size(4096 * 20);
    let coros = (0..4)
        .map(|_| {
            let d = depth - 1;
            builder
                .spawn(move |suspend: &Suspend| -> BodyResult<u32, ()> {
                    let leaves = recurse(d);
                    suspend.wait(yield_now());
                    done(leaves)
                })
                .unwrap()
        })
        .collect::<Vec<_>>();
    pool.run_until(future::try_join_all(coros))
        .unwrap()
        .into_iter()
        .sum()
}

#[test]
fn recursive() {
    init_tracing();
    assert_eq!(256, recurse(4));
}
