//! External Interfaces: the free-function surface a hosted task calls into
//! (§6).
//!
//! Every function here resolves "the current task" and "the current
//! runtime" from a thread-local set once per worker OS thread by
//! `Runtime::start_workers`, rather than threading either explicitly through
//! every task entry point — matching the teacher's convention of a
//! per-thread ambient context for code that doesn't carry its own handle.
//! Calling any of these from a thread that was never set up as a worker
//! (a test's own main thread, say) returns [`PrsError::InvalidConfig`]
//! rather than panicking.

use std::alloc::Layout;
use std::cell::RefCell;
use std::fmt::Arguments;
use std::sync::Arc;

use abi::{ExceptionKind, LogLevel, MessageId, ObjectId, Priority};

use crate::exception::HandlerAction;
use crate::message::{Filter, Message};
use crate::runtime::{Runtime, TaskSpawn};
use crate::worker::Worker;
use crate::{PrsError, Result};

struct CurrentWorker {
    runtime: Arc<Runtime>,
    worker: Arc<Worker>,
    worker_id: ObjectId,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentWorker>> = const { RefCell::new(None) };
}

/// Installs the ambient per-thread context. Called exactly once, at the top
/// of each worker's thread body.
pub(crate) fn set_current_worker(runtime: Arc<Runtime>, worker: Arc<Worker>, worker_id: ObjectId) {
    CURRENT.with(|cell| *cell.borrow_mut() = Some(CurrentWorker { runtime, worker, worker_id }));
}

fn with_current<R>(f: impl FnOnce(&Arc<Runtime>, &Arc<Worker>, ObjectId) -> R) -> Result<R> {
    CURRENT.with(|cell| match &*cell.borrow() {
        Some(cur) => Ok(f(&cur.runtime, &cur.worker, cur.worker_id)),
        None => Err(PrsError::InvalidConfig("called from outside a worker thread".into())),
    })
}

/// `task_get_current` (§6), usable without a `Result` wrapper since "no
/// current task" only ever happens between a worker's own scheduling
/// decisions, never while a task's own entry function is running.
#[must_use]
pub fn current_task() -> Option<ObjectId> {
    with_current(|_, worker, _| worker.current_task()).ok().flatten()
}

/// `sched_get_current` (§6): the scheduler bound to the worker this task
/// happens to be running on.
pub fn sched_get_current() -> Result<ObjectId> {
    with_current(|_, _, worker_id| worker_id)
}

pub fn sched_find(name: &str) -> Result<Option<ObjectId>> {
    with_current(|rt, _, _| rt.sched_find(name))
}

/// `int_disable` (§4.11, §6).
pub fn int_disable() -> Result<bool> {
    with_current(|_, worker, _| worker.int_disable())
}

/// `int_enable` (§4.11, §6). Runs the re-entry prologue (re-checking the
/// scheduler for anything that arrived while disabled) before re-enabling.
pub fn int_enable() -> Result<()> {
    with_current(|_, worker, _| worker.int_enable(crate::context::yield_now))
}

/// `ticks_get` (§6): the runtime-wide tick counter, advanced externally by
/// whatever drives `Runtime::tick_once` (§1 Non-goals: no PIT driver here).
pub fn ticks_get() -> Result<u64> {
    with_current(|rt, _, _| rt.ticks())
}

#[must_use]
pub fn ticks_per_second() -> Result<u32> {
    with_current(|rt, _, _| rt.ticks_per_second())
}

/// `sleep_ticks` (§6): blocks the calling task for at least `ticks` ticks.
/// Modeled as a private, unnamed semaphore wait with a timeout that always
/// expires — the same primitive `sem_wait_timeout` already provides, rather
/// than a bespoke sleep queue.
pub fn sleep_ticks(ticks: u64) -> Result<()> {
    with_current(|rt, worker, _| -> Result<()> {
        let me = worker.current_task().ok_or_else(|| PrsError::InvalidConfig("sleep_ticks called outside a task".into()))?;
        let sem = rt.sem_create(0, None)?;
        let _ = rt.sem_wait_timeout(sem, me, ticks, crate::context::yield_now)?;
        rt.sem_destroy(sem, None)
    })?
}

/// `sleep_ms`/`sleep_us` (§6): convenience wrappers converting to ticks at
/// the runtime's configured `ticks_per_second`, rounding up so a caller
/// never sleeps for less than asked.
pub fn sleep_ms(ms: u64) -> Result<()> {
    let hz = u64::from(ticks_per_second()?);
    sleep_ticks((ms * hz).div_ceil(1000))
}

pub fn sleep_us(us: u64) -> Result<()> {
    let hz = u64::from(ticks_per_second()?);
    sleep_ticks((us * hz).div_ceil(1_000_000))
}

/// `malloc`/`free` (§6): thin wrappers over the system allocator. This
/// crate doesn't implement its own heap (§1 Non-goals: no custom
/// allocator) — `malloc_global` is the identical operation under a
/// different name for a process-wide rather than per-task arena, since
/// this translation has no separate per-task heap to distinguish it from.
///
/// # Safety
/// `free`/`free_global` must be called with exactly the `(ptr, size)` pair
/// a prior `malloc`/`malloc_global` returned.
pub unsafe fn malloc(size: usize) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }
    let layout = Layout::from_size_align(size, std::mem::align_of::<usize>()).expect("size too large to allocate");
    std::alloc::alloc(layout)
}

/// # Safety
/// See [`malloc`].
pub unsafe fn free(ptr: *mut u8, size: usize) {
    if ptr.is_null() || size == 0 {
        return;
    }
    let layout = Layout::from_size_align(size, std::mem::align_of::<usize>()).expect("size too large to allocate");
    std::alloc::dealloc(ptr, layout);
}

/// # Safety
/// See [`malloc`].
pub unsafe fn malloc_global(size: usize) -> *mut u8 {
    malloc(size)
}

/// # Safety
/// See [`malloc`].
pub unsafe fn free_global(ptr: *mut u8, size: usize) {
    free(ptr, size)
}

/// `log(fmt, ...)` (§6, §4.14). Prefer [`crate::prs_log!`] at call sites
/// that want their own `module_path!()` recorded; this is the raw entry
/// point it expands to, stamped with the runtime's own tick.
pub fn log(level: LogLevel, module: &'static str, args: Arguments<'_>) -> Result<()> {
    with_current(|rt, _, _| crate::log::log(rt.ticks(), level, module, args))
}

/// `task_create` (§6 "Task creation parameters"). Spawns onto the calling
/// task's own scheduler — this translation gives every worker exactly one
/// bound scheduler (§9 Open Question, see `DESIGN.md`), so "which scheduler"
/// is never an ambiguous choice for a task spawning a child.
pub fn task_create(name: &str, priority: Priority, stack_size: usize, entry: Box<dyn FnOnce() -> i32 + Send + 'static>) -> Result<ObjectId> {
    with_current(|rt, _, worker_id| {
        rt.task_create(TaskSpawn { name: name.to_string(), priority, stack_size, sched_id: worker_id, entry })
    })?
}

pub fn task_find(name: &str) -> Result<Option<ObjectId>> {
    with_current(|rt, _, _| rt.task_find(name))
}

pub fn task_get_prio(task_id: ObjectId) -> Result<Priority> {
    with_current(|rt, _, _| rt.task_get_prio(task_id))?
}

pub fn task_set_prio(task_id: ObjectId, priority: Priority) -> Result<()> {
    with_current(|rt, _, _| rt.task_set_prio(task_id, priority))?
}

pub fn task_get_stack_size(task_id: ObjectId) -> Result<usize> {
    with_current(|rt, _, _| rt.task_get_stack_size(task_id))?
}

/// `msg_send` (§6). `msg_alloc`/`msg_free` have no counterpart here —
/// a message's payload is an ordinary `Vec<u8>` whose allocation is Rust's
/// own, so there's nothing left for an explicit alloc/free pair to do.
pub fn msg_send(receiver: ObjectId, id: MessageId, payload: Vec<u8>) -> Result<()> {
    with_current(|rt, worker, _| -> Result<()> {
        let sender = worker.current_task().unwrap_or(ObjectId::INVALID);
        rt.msg_send(receiver, Message { sender, id, payload })
    })?
}

#[must_use]
pub fn msg_get_sender(msg: &Message) -> ObjectId {
    msg.sender
}

fn recv(filter: Filter, timeout_ticks: Option<u64>) -> Result<Option<Message>> {
    with_current(|rt, worker, _| -> Result<Option<Message>> {
        let me = worker.current_task().ok_or_else(|| PrsError::InvalidConfig("msg_recv called outside a task".into()))?;
        rt.msg_recv(me, filter, timeout_ticks, crate::context::yield_now, crate::context::yield_now)
    })?
}

pub fn msg_recv() -> Result<Option<Message>> {
    recv(Filter::any(), None)
}

pub fn msg_recv_filter(ids: &[u32]) -> Result<Option<Message>> {
    recv(Filter::matching(ids), None)
}

pub fn msg_recv_timeout(timeout_ticks: u64) -> Result<Option<Message>> {
    recv(Filter::any(), Some(timeout_ticks))
}

pub fn msg_recv_filter_timeout(ids: &[u32], timeout_ticks: u64) -> Result<Option<Message>> {
    recv(Filter::matching(ids), Some(timeout_ticks))
}

pub fn sem_create(initial: i64, name: Option<&str>) -> Result<ObjectId> {
    with_current(|rt, _, _| rt.sem_create(initial, name))?
}

pub fn sem_destroy(id: ObjectId, name: Option<&str>) -> Result<()> {
    with_current(|rt, _, _| rt.sem_destroy(id, name))?
}

pub fn sem_wait(id: ObjectId) -> Result<()> {
    with_current(|rt, worker, _| -> Result<()> {
        let me = worker.current_task().ok_or_else(|| PrsError::InvalidConfig("sem_wait called outside a task".into()))?;
        rt.sem_wait(id, me, crate::context::yield_now)
    })?
}

pub fn sem_wait_timeout(id: ObjectId, timeout_ticks: u64) -> Result<bool> {
    with_current(|rt, worker, _| -> Result<bool> {
        let me = worker.current_task().ok_or_else(|| PrsError::InvalidConfig("sem_wait_timeout called outside a task".into()))?;
        rt.sem_wait_timeout(id, me, timeout_ticks, crate::context::yield_now)
    })?
}

pub fn sem_signal(id: ObjectId) -> Result<()> {
    with_current(|rt, _, _| rt.sem_signal(id))?
}

/// `yield` (§6): transitions the current task back to Ready and re-enqueues
/// it on its own scheduler before suspending — a plain `yield_now()` alone
/// would leave the task's token at `Running`, and `Cooperative::get_next`'s
/// "resume whoever is already Running" fast path would just hand control
/// straight back to it instead of giving another ready task a turn.
pub fn yield_task() -> Result<()> {
    with_current(|rt, worker, _| -> Result<()> {
        if let Some(me) = worker.current_task() {
            rt.yield_task(me)?;
        }
        crate::context::yield_now();
        Ok(())
    })?
}

/// `stop` (§6): blocks the calling task indefinitely. There is no wait
/// primitive to register against forever, so this parks on a semaphore
/// nobody will ever signal.
pub fn stop() -> Result<()> {
    with_current(|rt, worker, _| -> Result<()> {
        let me = worker.current_task().ok_or_else(|| PrsError::InvalidConfig("stop called outside a task".into()))?;
        let sem = rt.sem_create(0, None)?;
        rt.sem_wait(sem, me, crate::context::yield_now)
    })?
}

/// `error(type, expr, file, line)` (§7): logs the fault, classifies it
/// through [`crate::exception::default_severity`], and runs it through the
/// installed handler chain, applying whatever the winning handler decided
/// before returning. `Continue` is the only variant that actually returns
/// control to the caller — `KillTask` removes the current task from its
/// scheduler and parks it forever (the worker tears its context down on the
/// next `get_next`), `Exit` runs graceful shutdown and ends the process.
pub fn error(kind: ExceptionKind, expr: &str, file: &str, line: u32) -> Result<HandlerAction> {
    with_current(|rt, worker, _| -> Result<HandlerAction> {
        let task = worker.current_task().unwrap_or(ObjectId::INVALID);
        crate::prs_log!(
            rt.ticks(),
            severity_to_log_level(crate::exception::default_severity(kind)),
            "{kind:?} at {file}:{line}: {expr}"
        );
        let action = rt.exceptions().lock().dispatch(kind, task, true);
        match action {
            HandlerAction::Continue | HandlerAction::Forward => {}
            HandlerAction::KillTask => {
                rt.kill_task(task);
                crate::prs_log!(rt.ticks(), LogLevel::Warn, "task {task:?} killed by the exception handler chain");
                // `kill_task` only marks the task for teardown at the next
                // scheduling decision; parking here hands control back to
                // the worker, which tears this coroutine's context down
                // instead of ever resuming it again.
                loop {
                    crate::context::yield_now();
                }
            }
            HandlerAction::Exit(status) => {
                let _ = rt.shutdown();
                std::process::exit(status);
            }
        }
        Ok(action)
    })?
}

fn severity_to_log_level(severity: abi::ErrorSeverity) -> LogLevel {
    match severity {
        abi::ErrorSeverity::Continue => LogLevel::Info,
        abi::ErrorSeverity::KillTask => LogLevel::Warn,
        abi::ErrorSeverity::Fatal => LogLevel::Error,
    }
}

/// `exit(status)` (§6): runs registered `atexit` handlers, stops every
/// worker, and ends the process with `status` (§6 "Exit codes").
pub fn exit(status: i32) -> ! {
    let _ = with_current(|rt, _, _| {
        let _ = rt.shutdown();
    });
    std::process::exit(status)
}

/// `atexit(fn)` (§6): registers a handler `exit`/`shutdown` runs before the
/// process actually ends.
pub fn atexit(handler: impl FnMut() + Send + 'static) -> Result<()> {
    with_current(|rt, _, _| rt.atexit(Box::new(handler)))
}

/// `system_exit(status)` (§6): the forced variant — ends the process
/// immediately without running `atexit` handlers or the graceful worker
/// shutdown sequence, for a fatal path that doesn't trust the rest of the
/// runtime to still be in a shutdown-able state (mirrors libc's `exit`
/// versus `_exit`; see `DESIGN.md`).
pub fn system_exit(status: i32) -> ! {
    std::process::exit(status)
}
