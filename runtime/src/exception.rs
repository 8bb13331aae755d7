//! Exception taxonomy and the default fault handler (§7).
//!
//! Runtime-detected faults arrive here as an [`abi::ExceptionKind`] plus the
//! task that was running when the fault was raised. Handlers form a LIFO
//! chain (§7 "each may continue, forward, kill task, or exit"); the default
//! handler installed by [`crate::Runtime`] implements the exact dispatch
//! table from §7 and is always the bottom of the chain, so a forwarded
//! exception that nobody above it claims still resolves to a decision.
//!
//! Stack-overflow recovery (S6: "grows the stack by one page... after 16
//! growths... the task is killed") has no real guard-page-remapping
//! equivalent to reach for here — `corosensei`'s stack is allocated once at
//! `task_create` and isn't grown in place. [`StackDepthGuard`] models the
//! same observable contract (recursion up to a bounded depth succeeds,
//! beyond it the task is killed) by counting nested guard scopes instead of
//! trapping a real fault at the guard page. This is an Open Question
//! resolution; see `DESIGN.md`.

use abi::{ErrorSeverity, ExceptionKind, ObjectId};

/// What a handler decided to do with a raised exception.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum HandlerAction {
    /// Log and keep running the faulting task from where it left off.
    Continue,
    /// Pass the exception to the next handler down the chain.
    Forward,
    /// Destroy the faulting task; the worker resumes its exit context.
    KillTask,
    /// Run graceful teardown and end the process.
    Exit(i32),
}

/// One link in the exception handler chain. Handlers are consulted LIFO —
/// the most recently pushed handler sees the exception first.
pub trait ExceptionHandler: Send + Sync {
    fn handle(&self, kind: ExceptionKind, task: ObjectId, fault_ip_in_user_image: bool) -> HandlerAction;
}

/// The default handler (§7's dispatch table), always the bottom of the
/// chain. `fault_ip_in_user_image` stands in for "the faulting instruction
/// pointer lies inside a loaded user process image" — since this crate
/// doesn't implement a loader (§1 Non-goals), callers outside of a loaded
/// user image pass `false`, which routes seg/ill/int/fp/bus straight to
/// Fatal per the spec's "otherwise fatal" clause.
pub struct DefaultHandler;

impl ExceptionHandler for DefaultHandler {
    fn handle(&self, kind: ExceptionKind, _task: ObjectId, fault_ip_in_user_image: bool) -> HandlerAction {
        match kind {
            ExceptionKind::StackOverflow => HandlerAction::KillTask,
            ExceptionKind::SegmentationFault
            | ExceptionKind::IllegalInstruction
            | ExceptionKind::Integer
            | ExceptionKind::FloatingPoint
            | ExceptionKind::Bus => {
                if fault_ip_in_user_image {
                    HandlerAction::KillTask
                } else {
                    HandlerAction::Exit(-1)
                }
            }
            ExceptionKind::UserInterrupt => HandlerAction::Exit(-1),
            ExceptionKind::Assert => HandlerAction::Exit(-1),
            ExceptionKind::Unknown | ExceptionKind::User | ExceptionKind::Pr | ExceptionKind::Os => {
                HandlerAction::Exit(-1)
            }
        }
    }
}

/// Maps an [`ExceptionKind`] to the three user-visible severities from §7,
/// independent of any handler's actual decision — used for logging and for
/// `error(type, ...)`'s own classification before the handler chain runs.
#[must_use]
pub fn default_severity(kind: ExceptionKind) -> ErrorSeverity {
    match kind {
        ExceptionKind::Assert | ExceptionKind::UserInterrupt => ErrorSeverity::Fatal,
        ExceptionKind::StackOverflow => ErrorSeverity::KillTask,
        _ => ErrorSeverity::Fatal,
    }
}

/// A LIFO stack of handlers, consulted top-down; the bottom entry is always
/// [`DefaultHandler`] so `dispatch` always terminates in a decision.
pub struct ExceptionChain {
    handlers: Vec<Box<dyn ExceptionHandler>>,
}

impl ExceptionChain {
    #[must_use]
    pub fn new() -> Self {
        Self { handlers: vec![Box::new(DefaultHandler)] }
    }

    /// Pushes a handler above the default, to be consulted first.
    pub fn push(&mut self, handler: Box<dyn ExceptionHandler>) {
        self.handlers.push(handler);
    }

    pub fn pop(&mut self) {
        if self.handlers.len() > 1 {
            self.handlers.pop();
        }
    }

    /// Walks the chain top-down, stopping at the first handler that doesn't
    /// return `Forward`.
    #[must_use]
    pub fn dispatch(&self, kind: ExceptionKind, task: ObjectId, fault_ip_in_user_image: bool) -> HandlerAction {
        for handler in self.handlers.iter().rev() {
            match handler.handle(kind, task, fault_ip_in_user_image) {
                HandlerAction::Forward => continue,
                decision => return decision,
            }
        }
        unreachable!("the default handler at the bottom of the chain never forwards")
    }
}

impl Default for ExceptionChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task recursion depth bound standing in for stack-overflow recovery
/// (S6): a task that wants the "grow the stack, retry, give up after N
/// growths" contract wraps its recursive calls in nested
/// [`StackDepthGuard::enter`] scopes instead of relying on a trapped guard-
/// page fault. Exceeding `max_growths` reports `Err` the same way a real
/// handler would report `KillTask` back up through the call stack, since
/// there is no fault to resume from at this abstraction level.
pub struct StackDepthGuard {
    depth: std::cell::Cell<u32>,
    max_growths: u32,
}

impl StackDepthGuard {
    /// `max_growths` matches S6's "after 16 growths it exceeds the limit".
    #[must_use]
    pub fn new(max_growths: u32) -> Self {
        Self { depth: std::cell::Cell::new(0), max_growths }
    }

    /// Enters one more nesting level. `Err` once `max_growths` is exceeded,
    /// mirroring the point at which the default handler would stop growing
    /// the stack and kill the task instead.
    pub fn enter(&self) -> Result<DepthScope<'_>, ()> {
        let depth = self.depth.get();
        if depth >= self.max_growths {
            return Err(());
        }
        self.depth.set(depth + 1);
        Ok(DepthScope { guard: self })
    }
}

pub struct DepthScope<'a> {
    guard: &'a StackDepthGuard,
}

impl<'a> Drop for DepthScope<'a> {
    fn drop(&mut self) {
        self.guard.depth.set(self.guard.depth.get() - 1);
    }
}
