//! Per-task execution context: one stackful coroutine per task (§4.9,
//! §4.12).
//!
//! `corosensei` stands in for the register-context primitive the
//! specification's Design Notes describe (`alloc`/`make`/`swap`/
//! `append_call`/`get_ip`): `Coroutine::with_stack` is `make`, `resume` is
//! `swap`, and the coroutine's own stack guard page covers `alloc`'s
//! overflow protection. `append_call` — splicing a synthetic call frame onto
//! an arbitrary, possibly-suspended register context so the next resume
//! re-enters the scheduler first — has no safe equivalent over an opaque
//! coroutine stack in hosted Rust. It's modeled instead as a one-shot flag
//! consulted by the worker immediately after every resume, which gets the
//! same observable effect (the task's next visible action is a
//! re-schedule) without unsafe frame surgery. See `DESIGN.md` for this
//! Open Question resolution.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

use abi::ResultCode;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

/// Marker yielded back to the worker at every task suspension point. There's
/// no payload to carry — the *reason* a task suspended lives in its
/// `StateToken`, which the worker reads after `resume` returns, not in this
/// value.
pub struct Yield;

thread_local! {
    /// The yielder for whichever task's coroutine is presently executing on
    /// this OS thread, valid only for the duration of one `resume` call.
    /// Thread-local rather than task-local because `yield_now` is called
    /// from deep inside arbitrary task code with no explicit context thread-
    /// ed through; the worker driving a resume is always the one OS thread
    /// whose thread-local this task's coroutine body is running on.
    static CURRENT_YIELDER: Cell<Option<*const Yielder<(), Yield>>> = const { Cell::new(None) };
}

/// What `TaskContext::resume` produced.
pub enum TaskOutcome {
    /// The task called `yield_now` (directly, or via `sleep`/`msg_recv*`/
    /// `sem_wait*`/any other suspension point built on it).
    Yielded,
    /// The entry function returned; `status` is the task's exit code (§6
    /// `exit`).
    Exited(i32),
}

/// One task's coroutine, plus the §4.12 re-entry flag.
pub struct TaskContext {
    coroutine: Coroutine<(), Yield, i32>,
    reenter_prologue: AtomicBool,
}

impl TaskContext {
    /// Allocates a guarded stack of `stack_size` bytes and builds a
    /// coroutine that calls `entry` once resumed. `entry` is expected to
    /// call (or transitively call, through `yield_now`) this module's
    /// suspension point at its own blocking operations, and to return the
    /// task's exit status when it returns normally.
    pub fn new(stack_size: usize, entry: impl FnOnce() -> i32 + Send + 'static) -> Result<Self, ResultCode> {
        let stack = DefaultStack::new(stack_size).map_err(|_| ResultCode::OutOfMemory)?;
        let coroutine = Coroutine::with_stack(stack, move |yielder, ()| {
            let ptr = yielder as *const Yielder<(), Yield>;
            CURRENT_YIELDER.with(|cell| cell.set(Some(ptr)));
            let status = entry();
            CURRENT_YIELDER.with(|cell| cell.set(None));
            status
        });
        Ok(Self { coroutine, reenter_prologue: AtomicBool::new(false) })
    }

    /// §4.12 `append_call`: requests that the next `resume` runs the
    /// scheduler prologue before returning control to the task's own code.
    /// Idempotent — a worker can call this any number of times before the
    /// task is actually resumed.
    pub fn request_reentry(&self) {
        self.reenter_prologue.store(true, Ordering::Release);
    }

    /// Clears and returns whether a re-entry was requested. The worker loop
    /// calls this right after every `resume` returns `Yielded`, in place of
    /// the register-context rewrite the original design describes.
    pub fn take_reentry_request(&self) -> bool {
        self.reenter_prologue.swap(false, Ordering::AcqRel)
    }

    /// Resumes the task's coroutine (§4.12 `swap`). Must only be called
    /// from the worker thread bound to this task.
    pub fn resume(&mut self) -> TaskOutcome {
        match self.coroutine.resume(()) {
            CoroutineResult::Yield(Yield) => TaskOutcome::Yielded,
            CoroutineResult::Return(status) => TaskOutcome::Exited(status),
        }
    }

    #[must_use]
    pub fn started(&self) -> bool {
        self.coroutine.started()
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.coroutine.done()
    }
}

/// Suspends the currently running task, returning control to the worker
/// that resumed it. Calling this from outside a task's own coroutine (e.g.
/// from a unit test's main thread) is a harmless no-op rather than a panic,
/// since nothing here can tell "called outside a task" apart from "called
/// from a worker's own bookkeeping code" with certainty.
pub fn yield_now() {
    CURRENT_YIELDER.with(|cell| {
        if let Some(ptr) = cell.get() {
            // Safety: `ptr` is only ever set for the duration of the
            // enclosing `resume` call, by the trampoline in `TaskContext::
            // new`, and `yield_now` only runs on that same coroutine's own
            // stack during that same call.
            let yielder = unsafe { &*ptr };
            yielder.suspend(Yield);
        }
    });
}
