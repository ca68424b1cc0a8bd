//! Module for the low-level switching of coroutines

use std::any::Any;
use std::panic;

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};
use tracing::trace;

use crate::chain::Control;
use crate::stack_cache;

/// The work a fresh coroutine stack performs.
///
/// It gets the context that started it and returns the context to switch to once it is done
/// (these differ, the coroutine gets resumed from different places over its life). A panic that
/// escaped the work is returned too, to be propagated on the other side.
pub(crate) type BoxedTask = Box<dyn FnOnce(Context) -> (Context, Option<Box<dyn Any + Send>>)>;

/// Execution of a coroutine.
///
/// This holds the extracted logic, so once we leave the coroutine, all locals that may possibly
/// have any kind of destructor are gone.
fn coroutine_internal(transfer: Transfer) -> (Switch, Context) {
    match Switch::extract(transfer.data) {
        Switch::Start { stack, size, task } => {
            let (context, panic) = task(transfer.context);
            (Switch::Destroy { stack, size, panic }, context)
        },
        _ => panic!("Invalid switch instruction on coroutine entry"),
    }
}

/// Wrapper for the execution of a coroutine.
///
/// This is just a minimal wrapper that runs the `coroutine_internal` and then switches back to the
/// parent context. This contains very minimal amount of local variables and only the ones from the
/// `context` crate, so we don't have anything with destructor here. The problem is, this function
/// never finishes and therefore such destructors wouldn't be run.
extern "C" fn coroutine(transfer: Transfer) -> ! {
    let (result, context) = coroutine_internal(transfer);
    result.exchange(context);
    unreachable!("Woken up after termination!");
}

/// An instruction carried across the coroutine boundary.
///
/// This describes what the receiving side should do next (and contains parameters for that).
/// Instructions flowing into the coroutine are `Start`, `Resume` and `Stop`, the ones flowing out
/// are `Suspended` and `Destroy`.
pub(crate) enum Switch {
    /// Run the task on the fresh stack.
    Start {
        stack: ProtectedFixedSizeStack,
        size: usize,
        task: BoxedTask,
    },
    /// The coroutine waits for a dependency. The context we got is the one to resume it with.
    Suspended,
    /// Continue operation, the dependency's outcome is waiting for the coroutine.
    Resume,
    /// Deliver the stop signal at the suspension point.
    Stop,
    /// Get rid of the sending coroutine, it terminated.
    Destroy {
        stack: ProtectedFixedSizeStack,
        size: usize,
        /// A panic that escaped the coroutine's task and should continue on this side.
        panic: Option<Box<dyn Any + Send>>,
    },
}

impl Switch {
    fn name(&self) -> &'static str {
        match self {
            Switch::Start { .. } => "start",
            Switch::Suspended => "suspended",
            Switch::Resume => "resume",
            Switch::Stop => "stop",
            Switch::Destroy { .. } => "destroy",
        }
    }

    /// Extracts the instruction passed through the coroutine transfer data.
    fn extract(transfer_data: usize) -> Switch {
        let ptr = transfer_data as *mut Option<Self>;
        // SAFETY: The extract is called only in two cases. When switching into a newly born
        // coroutine and during the exchange of two coroutines. In both cases, the caller is in this
        // module, it places data onto its stack and passes the pointer as the usize parameter. The
        // stack is still alive at the time we are called and it hasn't moved (since our stack got
        // the control), so the pointer is not dangling. We just extract the data from there right
        // away and leave None on the stack, which doesn't need any special handling during
        // destruction.
        let optref = unsafe { ptr.as_mut() }
            .expect("NULL pointer passed through a coroutine switch");
        optref.take().expect("Switch instruction already extracted")
    }

    /// Switches to a coroutine and back.
    ///
    /// Switches to the given context and sends it the current instruction. Returns the context
    /// that resumed us (after we are resumed) and the instruction it sent us.
    ///
    /// # Internals
    ///
    /// To pass the instruction, we abuse the usize `data` field of the underlying library for
    /// switching stacks. We place the instruction into an `Option<Switch>` on the current stack
    /// and pass a pointer to it. The receiving side takes the instruction out of the `Option`,
    /// stealing it from the originating stack, which doesn't change until we get back here.
    ///
    /// As the exchange leaves just an empty `Option` behind, destroying the stack (once it asks
    /// for so through the instruction) is safe, we don't need to run any destructor on that.
    pub(crate) fn exchange(self, context: Context) -> (Self, Context) {
        trace!(instruction = self.name(), "Switching context");
        let mut sw = Some(self);
        let swp: *mut Option<Self> = &mut sw;
        // SAFETY: The instruction lives on the current stack and gets extracted by the other side
        // as the first thing it does, while this frame is still active. Each coroutine owns its
        // own stack (it gets it through `Start` and gives it up only through `Destroy`), so the
        // stack we switch to can't be destroyed prematurely.
        let transfer = unsafe { context.resume(swp as usize) };
        (Self::extract(transfer.data), transfer.context)
    }

    /// Runs a coroutine until it switches back and handles the instruction it sends.
    ///
    /// A suspending coroutine gets parked in the control block of its chain, a terminated one
    /// has its stack returned to the cache.
    pub(crate) fn run_child(self, context: Context, control: &Control) {
        let (reply, context) = self.exchange(context);
        match reply {
            Switch::Destroy { stack, size, panic } => {
                drop(context);
                stack_cache::put(size, stack, control.cached_stacks());
                if let Some(panic) = panic {
                    panic::resume_unwind(panic);
                }
            },
            Switch::Suspended => control.park(context),
            _ => unreachable!("Invalid switch instruction when switching out"),
        }
    }

    /// Creates a new coroutine on the given stack and runs it until it suspends or terminates.
    pub(crate) fn run_new_coroutine(
        stack: ProtectedFixedSizeStack,
        size: usize,
        task: BoxedTask,
        control: &Control,
    ) {
        // SAFETY: The `Context::new` is unsafe only because we have to promise not to delete the
        // stack prematurely, while the coroutine is still alive. We ensure that by giving the
        // ownership of the stack to the coroutine and it gives it up only once it is ready to
        // terminate.
        let context = unsafe { Context::new(&stack, coroutine) };
        Switch::Start { stack, size, task }.run_child(context, control);
    }
}
