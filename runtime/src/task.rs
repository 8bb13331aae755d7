//! Task identity and state token (§3 "Task", "State token"; §4.9).
//!
//! A `Task` is the cross-worker-visible half of a task: name, priority,
//! owning scheduler, message queue, and the state token every block/unblock
//! goes through. It deliberately does not own the task's coroutine — that
//! stack and saved register context is `!Send` by construction (see
//! `crate::context`) and is owned by the one worker bound to the task's
//! scheduler, never shared. The GOD only ever needs the `Send` half.

use std::sync::atomic::{AtomicU32, Ordering};

use abi::{ObjectId, Priority, TaskLifecycle, UnblockCause, MAX_TASK_NAME};

use crate::error::{PrsError, Result};
use crate::message::MessageQueue;

/// Packed `{state: 4 bits | cause: 8 bits | version: 20 bits}` atomic word
/// (§3 "State token"). Every `block` hands the caller a snapshot; every
/// `unblock` must present that exact snapshot back, so a stale unblock
/// racing a newer block/unblock cycle fails its CAS harmlessly.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct StateToken(u32);

impl StateToken {
    const STATE_BITS: u32 = 4;
    const CAUSE_BITS: u32 = 8;
    const STATE_SHIFT: u32 = 0;
    const CAUSE_SHIFT: u32 = Self::STATE_BITS;
    const VERSION_SHIFT: u32 = Self::STATE_BITS + Self::CAUSE_BITS;
    const STATE_MASK: u32 = (1 << Self::STATE_BITS) - 1;
    const CAUSE_MASK: u32 = (1 << Self::CAUSE_BITS) - 1;

    #[must_use]
    pub fn state(self) -> TaskLifecycle {
        TaskLifecycle::from_u8(((self.0 >> Self::STATE_SHIFT) & Self::STATE_MASK) as u8)
    }

    #[must_use]
    pub fn cause(self) -> UnblockCause {
        UnblockCause::from_u8(((self.0 >> Self::CAUSE_SHIFT) & Self::CAUSE_MASK) as u8)
    }

    #[must_use]
    pub fn version(self) -> u32 {
        self.0 >> Self::VERSION_SHIFT
    }

    fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    fn to_bits(self) -> u32 {
        self.0
    }

    /// Advances to `new_state`/`new_cause` with the version incremented,
    /// wrapping harmlessly on overflow (2^20 block/unblock cycles between
    /// two observations of the same token is not a realistic race).
    fn bump(self, new_state: TaskLifecycle, new_cause: UnblockCause) -> Self {
        let version = self.version().wrapping_add(1);
        Self(
            (new_state as u32 & Self::STATE_MASK) << Self::STATE_SHIFT
                | (new_cause as u32 & Self::CAUSE_MASK) << Self::CAUSE_SHIFT
                | version << Self::VERSION_SHIFT,
        )
    }
}

/// Parameters accepted by `task_create` (§6 "Task creation parameters").
/// `entry` and `userdata` are consumed by the worker that builds the task's
/// coroutine context; `Task` itself never sees them.
pub struct TaskParams {
    pub name: String,
    pub priority: Priority,
    pub stack_size: usize,
    pub sched_id: ObjectId,
}

pub struct Task {
    name: String,
    priority: AtomicU32,
    sched_id: ObjectId,
    owning_process_id: ObjectId,
    stack_size: usize,
    token: AtomicU32,
    queue: MessageQueue,
}

impl Task {
    pub fn new(params: TaskParams, owning_process_id: ObjectId, queue_capacity: usize) -> Result<Self> {
        if params.name.len() > MAX_TASK_NAME {
            return Err(PrsError::InvalidConfig(format!(
                "task name {:?} exceeds {MAX_TASK_NAME} bytes",
                params.name
            )));
        }
        Ok(Self {
            name: params.name,
            priority: AtomicU32::new(u32::from(params.priority.0)),
            sched_id: params.sched_id,
            owning_process_id,
            stack_size: params.stack_size,
            token: AtomicU32::new(StateToken(TaskLifecycle::Stopped as u32).0),
            queue: MessageQueue::new(queue_capacity),
        })
    }

    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        Priority(self.priority.load(Ordering::Acquire) as u8)
    }

    /// `task_set_prio` (§6): only ever called by a task on itself, but the
    /// directory only ever hands out a shared reference, so this takes `&self`
    /// and stores through an atomic rather than requiring `&mut Task`.
    pub fn set_priority(&self, priority: Priority) {
        self.priority.store(u32::from(priority.0), Ordering::Release);
    }

    #[must_use]
    pub fn sched_id(&self) -> ObjectId {
        self.sched_id
    }

    #[must_use]
    pub fn owning_process_id(&self) -> ObjectId {
        self.owning_process_id
    }

    #[must_use]
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    #[must_use]
    pub fn current_token(&self) -> StateToken {
        StateToken::from_bits(self.token.load(Ordering::Acquire))
    }

    /// Asserts `expected` still holds and CAS-bumps to `new_state`,
    /// preserving `expected`'s cause. Returns the post-token on success.
    pub fn change_state(&self, expected: StateToken, new_state: TaskLifecycle) -> Option<StateToken> {
        let next = expected.bump(new_state, expected.cause());
        self.token
            .compare_exchange(expected.to_bits(), next.to_bits(), Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| next)
    }

    /// Snapshots the current token and CAS-transitions to Blocked, for the
    /// caller to hand to whatever it's about to wait on (an `Event`, a
    /// filter record, a timer entry). Retries until it wins — only the task
    /// itself calls this, from its own coroutine, so there is no contention
    /// beyond spurious CAS failures.
    #[must_use]
    pub fn block(&self) -> StateToken {
        loop {
            let bits = self.token.load(Ordering::Acquire);
            let current = StateToken::from_bits(bits);
            let next = current.bump(TaskLifecycle::Blocked, current.cause());
            if self.token.compare_exchange_weak(bits, next.to_bits(), Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                return next;
            }
        }
    }

    /// CAS from the exact token a `block` returned to Ready (or Running, for
    /// the self-unblock fast path used by e.g. the semaphore's immediate
    /// grant). Returns `true` only if this call won the race — any unblock
    /// racing a newer block/unblock cycle on the same task fails harmlessly.
    pub fn unblock(&self, expected: StateToken, cause: UnblockCause, self_unblock: bool) -> bool {
        let new_state = if self_unblock { TaskLifecycle::Running } else { TaskLifecycle::Ready };
        let next = expected.bump(new_state, cause);
        self.token.compare_exchange(expected.to_bits(), next.to_bits(), Ordering::AcqRel, Ordering::Relaxed).is_ok()
    }
}
