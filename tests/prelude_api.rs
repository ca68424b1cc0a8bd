use std::sync::OnceLock;

use coroutail::prelude::*;
use futures::channel::oneshot;
use futures::executor::LocalPool;
use futures::{future, stream, FutureExt};

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

type Coro = fn(&Suspend) -> BodyResult<u32, ()>;

fn coros() -> Vec<Coro> {
    let mut coros: Vec<Coro> = Vec::new();
    // One future to wait on
    coros.push(|suspend| done(future::ok::<_, ()>(42).coro_wait(suspend)?));
    // A stream with single Ok element
    coros.push(|suspend| done(stream::iter(vec![Ok::<_, ()>(42)]).iter_ok(suspend).sum()));
    // Stream with multiple elements, some errors. This one terminates at the first error.
    coros.push(|suspend| done(stream::iter(vec![Ok(42), Err(()), Ok(100)]).iter_ok(suspend).sum()));
    // A stream with multiple elements, some errors. This one *skips* errors.
    coros.push(|suspend| {
        let sum = stream::iter(vec![Ok(12), Err(()), Ok(30)])
            .iter_result(suspend)
            .filter_map(Result::ok)
            .sum();
        done(sum)
    });
    // The value comes from a delegated plain computation.
    coros.push(|_| tail_call(|| Ok(42)));
    // Two delegations, the second one to a future.
    coros.push(|_| tail(|_: &Suspend| follow(future::ok(42))));
    // Waiting deep inside a helper function.
    coros.push(|suspend| {
        fn helper(suspend: &Suspend, depth: u32) -> u32 {
            if depth == 0 {
                suspend.wait(future::ready(42))
            } else {
                helper(suspend, depth - 1)
            }
        }
        done(helper(suspend, 10))
    });
    coros
}

/// Runs a coroutine that likely waits on something.
///
/// It checks the output is 42. Runs with different coroutines, see the list.
#[test]
fn forty_two() {
    init_tracing();
    for coro in coros() {
        let mut pool = LocalPool::new();
        let all_done = Coroutine::with_defaults(pool.spawner(), coro);
        assert_eq!(42, pool.run_until(all_done).unwrap());
    }
}

/// A wrapped function spawns a coroutine per call.
#[test]
fn wrapped_calls() {
    init_tracing();
    let mut pool = LocalPool::new();
    let (sender, receiver) = oneshot::channel::<u32>();
    let base = receiver.shared();
    let add = Coroutine::new(pool.spawner()).wrap(
        move |suspend: &Suspend, x: u32| -> BodyResult<u32, ()> {
            let base = suspend.wait(base.clone()).map_err(drop)?;
            done(base + x)
        },
    );
    let results = (0..3).map(|i| add(i).unwrap()).collect::<Vec<_>>();
    assert!(results.iter().all(|r| r.state() == DriverState::Suspended));
    sender.send(40).unwrap();
    let sums = pool.run_until(future::try_join_all(results)).unwrap();
    assert_eq!(vec![40, 41, 42], sums);
}

/// Delegating to another running coroutine takes over its outcome.
#[test]
fn follow_other() {
    init_tracing();
    let mut pool = LocalPool::new();
    let (sender, receiver) = oneshot::channel::<u32>();
    let builder = Coroutine::new(pool.spawner());
    let other = builder
        .spawn(move |suspend: &Suspend| -> BodyResult<u32, ()> {
            done(suspend.wait(receiver).map_err(drop)?)
        })
        .unwrap();
    let chain = builder.spawn(move |_: &Suspend| follow(other)).unwrap();
    assert_eq!(DriverState::Suspended, chain.state());
    sender.send(42).unwrap();
    assert_eq!(42, pool.run_until(chain).unwrap());
}

/// The failure of a followed coroutine becomes the failure of the follower.
#[test]
fn follow_failed() {
    init_tracing();
    let mut pool = LocalPool::new();
    let (sender, receiver) = oneshot::channel::<u32>();
    let builder = Coroutine::new(pool.spawner());
    let other = builder
        .spawn(move |suspend: &Suspend| -> BodyResult<u32, &'static str> {
            let value = suspend.wait(receiver).map_err(|_| "canceled")?;
            if value > 10 {
                Err("too large")
            } else {
                done(value)
            }
        })
        .unwrap();
    let chain = builder.spawn(move |_: &Suspend| follow(other)).unwrap();
    sender.send(42).unwrap();
    match pool.run_until(chain) {
        Err(Failure::Failed("too large")) => (),
        other => panic!("Unexpected outcome {:?}", other),
    }
}
