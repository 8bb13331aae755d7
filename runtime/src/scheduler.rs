//! Scheduler policies: cooperative single-queue and 32-level priority
//! (§4.10).
//!
//! Both variants share the same shape: a ready set built from
//! [`Mpsciq`]`<ObjectId>` queues, a small side table mapping a queued task to
//! its queue-node id (so `remove` can pull it out in O(1) instead of
//! scanning), and a `pending_remove` queue that lets `get_next` notice when
//! the *currently running* task was destroyed out from under it. Per the
//! open question on multi-worker-per-scheduler (resolved in `DESIGN.md`), a
//! scheduler here drives at most one bound worker; `ready`/`get_next` return
//! that worker's id rather than reaching into a `Worker` directly, which
//! would otherwise create a dependency cycle between this module and
//! `worker`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use abi::{ObjectId, Priority, ResultCode, TaskLifecycle};
use parking_lot::Mutex;

use crate::directory::Directory;
use crate::mpsciq::Mpsciq;
use crate::task::Task;

/// Outcome of [`Scheduler::get_next`] (§4.10: "`get_next` returns `(true,
/// task)` when a final scheduling decision is made, `(false, null)` when the
/// current register context cannot be reused").
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Decision {
    /// Resume this task. If it's the task that was already running, the
    /// worker reuses the current register context; otherwise it swaps in.
    Resume(ObjectId),
    /// Nothing is runnable; the worker should enter idle mode.
    Idle,
    /// The previously running task no longer exists. The worker must switch
    /// to its saved exit-context stack rather than try to resume it.
    SwitchToExit,
}

/// The `{init, uninit, add, remove, get_next, ready}` capability set a
/// scheduler exposes (§4.10, §6 "Scheduler creation parameters"). `init` and
/// `uninit` are `new`/`Drop` in this translation; there's nothing left to
/// stand in for them explicitly.
pub trait Scheduler: Send + Sync {
    /// Records which worker this scheduler drives. Only ever called once,
    /// at construction time, by the runtime that owns both.
    fn bind_worker(&self, worker: ObjectId);

    fn add(&self, task: ObjectId, priority: Priority) -> Result<(), ResultCode>;

    /// Removes `task` from the ready set (if present) and, if it happens to
    /// be the worker's current task, marks it so the next `get_next` call
    /// returns [`Decision::SwitchToExit`] instead of trying to resume it.
    fn remove(&self, task: ObjectId);

    /// Marks `task` Ready. `current` is the task (and its priority)
    /// presently Running on the bound worker, supplied by the caller since
    /// this trait doesn't know about `Worker`. Returns the bound worker id
    /// if it needs interrupting/waking as a result.
    fn ready(&self, task: ObjectId, priority: Priority, current: Option<(ObjectId, Priority)>) -> Option<ObjectId>;

    /// Picks the next task to run. `current` is the task the worker was
    /// running before this call, if any.
    fn get_next(&self, tasks: &Directory<Task>, current: Option<ObjectId>) -> Decision;

    fn bound_worker(&self) -> Option<ObjectId>;
}

fn drain_pending_remove(pending: &Mpsciq<ObjectId>, current: Option<ObjectId>) -> bool {
    let mut current_removed = false;
    while let Some((_, removed)) = pending.pop_front() {
        if Some(removed) == current {
            current_removed = true;
        }
    }
    current_removed
}

fn transition_to_running(tasks: &Directory<Task>, task: ObjectId) -> Decision {
    let Some(guard) = tasks.lock(task) else { return Decision::Idle };
    let token = guard.current_token();
    if guard.change_state(token, TaskLifecycle::Running).is_some() {
        Decision::Resume(task)
    } else {
        // Lost a race (e.g. the task was concurrently killed); nothing else
        // to do but report idle, the next tick will pick someone else.
        Decision::Idle
    }
}

/// Single MPSC ready queue (§4.10 "Cooperative"). Never preempts by
/// priority — only a block/unblock cycle ever changes who's running.
pub struct Cooperative {
    ready: Mpsciq<ObjectId>,
    nodes: Mutex<HashMap<u32, ObjectId>>,
    pending_remove: Mpsciq<ObjectId>,
    bound_worker: AtomicU32,
}

impl Cooperative {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            ready: Mpsciq::new(capacity),
            nodes: Mutex::new(HashMap::new()),
            pending_remove: Mpsciq::new(capacity),
            bound_worker: AtomicU32::new(ObjectId::INVALID.0),
        }
    }
}

impl Scheduler for Cooperative {
    fn bind_worker(&self, worker: ObjectId) {
        self.bound_worker.store(worker.0, Ordering::Release);
    }

    fn bound_worker(&self) -> Option<ObjectId> {
        let id = ObjectId(self.bound_worker.load(Ordering::Acquire));
        id.is_valid().then_some(id)
    }

    fn add(&self, task: ObjectId, _priority: Priority) -> Result<(), ResultCode> {
        let node = self.ready.push(task)?;
        self.nodes.lock().insert(task.0, node);
        Ok(())
    }

    fn remove(&self, task: ObjectId) {
        if let Some(node) = self.nodes.lock().remove(&task.0) {
            self.ready.remove(node);
        }
        let _ = self.pending_remove.push(task);
    }

    fn ready(&self, task: ObjectId, _priority: Priority, _current: Option<(ObjectId, Priority)>) -> Option<ObjectId> {
        if let Ok(node) = self.ready.push(task) {
            self.nodes.lock().insert(task.0, node);
        }
        self.bound_worker()
    }

    fn get_next(&self, tasks: &Directory<Task>, current: Option<ObjectId>) -> Decision {
        if drain_pending_remove(&self.pending_remove, current) {
            return Decision::SwitchToExit;
        }
        if let Some(cur) = current {
            if tasks.lock(cur).map(|g| g.current_token().state()) == Some(TaskLifecycle::Running) {
                return Decision::Resume(cur);
            }
        }
        match self.ready.pop_front() {
            Some((_, task)) => {
                self.nodes.lock().remove(&task.0);
                transition_to_running(tasks, task)
            }
            None => Decision::Idle,
        }
    }
}

const PRIORITY_LEVELS: usize = 32;

/// One ready queue per priority level plus a bitmask of non-empty levels
/// (§4.10 "Priority"). Priority 0 is most important; the level-to-queue
/// mapping never changes after construction, so indexing is a plain array
/// access guarded only by the per-queue `Mpsciq`'s own synchronization.
pub struct PriorityScheduler {
    levels: Vec<Mpsciq<ObjectId>>,
    non_empty: AtomicU32,
    nodes: Mutex<HashMap<u32, (usize, ObjectId)>>,
    pending_remove: Mpsciq<ObjectId>,
    bound_worker: AtomicU32,
}

impl PriorityScheduler {
    #[must_use]
    pub fn new(capacity_per_level: usize) -> Self {
        Self {
            levels: (0..PRIORITY_LEVELS).map(|_| Mpsciq::new(capacity_per_level)).collect(),
            non_empty: AtomicU32::new(0),
            nodes: Mutex::new(HashMap::new()),
            pending_remove: Mpsciq::new(capacity_per_level * PRIORITY_LEVELS),
            bound_worker: AtomicU32::new(ObjectId::INVALID.0),
        }
    }

    fn level_of(priority: Priority) -> usize {
        (priority.0 as usize).min(PRIORITY_LEVELS - 1)
    }

    fn push(&self, task: ObjectId, priority: Priority) -> Result<(), ResultCode> {
        let level = Self::level_of(priority);
        let node = self.levels[level].push(task)?;
        self.nodes.lock().insert(task.0, (level, node));
        self.non_empty.fetch_or(1 << level, Ordering::AcqRel);
        Ok(())
    }

    /// Lowest-numbered (most important) non-empty level, if any.
    fn highest_ready(&self) -> Option<usize> {
        let mask = self.non_empty.load(Ordering::Acquire);
        (mask != 0).then(|| mask.trailing_zeros() as usize)
    }

    fn mark_empty_if_so(&self, level: usize) {
        if self.levels[level].is_empty() {
            self.non_empty.fetch_and(!(1 << level), Ordering::AcqRel);
        }
    }
}

impl Scheduler for PriorityScheduler {
    fn bind_worker(&self, worker: ObjectId) {
        self.bound_worker.store(worker.0, Ordering::Release);
    }

    fn bound_worker(&self) -> Option<ObjectId> {
        let id = ObjectId(self.bound_worker.load(Ordering::Acquire));
        id.is_valid().then_some(id)
    }

    fn add(&self, task: ObjectId, priority: Priority) -> Result<(), ResultCode> {
        self.push(task, priority)
    }

    fn remove(&self, task: ObjectId) {
        if let Some((level, node)) = self.nodes.lock().remove(&task.0) {
            self.levels[level].remove(node);
            self.mark_empty_if_so(level);
        }
        let _ = self.pending_remove.push(task);
    }

    fn ready(&self, task: ObjectId, priority: Priority, current: Option<(ObjectId, Priority)>) -> Option<ObjectId> {
        if self.push(task, priority).is_err() {
            return None;
        }
        // §4.10: "if the new task outranks any currently-running task on
        // any of this scheduler's workers, interrupts that worker."
        match current {
            Some((_, running_priority)) if priority.is_more_important_than(running_priority) => self.bound_worker(),
            None => self.bound_worker(),
            _ => None,
        }
    }

    fn get_next(&self, tasks: &Directory<Task>, current: Option<ObjectId>) -> Decision {
        if drain_pending_remove(&self.pending_remove, current) {
            return Decision::SwitchToExit;
        }

        let current_running = current.and_then(|cur| {
            let guard = tasks.lock(cur)?;
            (guard.current_token().state() == TaskLifecycle::Running).then_some(guard.priority())
        });

        let Some(top) = self.highest_ready() else {
            return match current_running {
                Some(_) => Decision::Resume(current.unwrap()),
                None => Decision::Idle,
            };
        };

        if let (Some(cur), Some(cur_prio)) = (current, current_running) {
            let top_priority = Priority(top as u8);
            if !top_priority.is_more_important_than(cur_prio) {
                return Decision::Resume(cur);
            }
            // §4.10: demote the running task to the tail of its own queue,
            // then hand the worker the higher-priority task.
            let cur_level = Self::level_of(cur_prio);
            if let Some(guard) = tasks.lock(cur) {
                let token = guard.current_token();
                if guard.change_state(token, TaskLifecycle::Ready).is_some() {
                    drop(guard);
                    let _ = self.push(cur, cur_prio);
                }
            }
            let _ = cur_level;
        }

        match self.levels[top].pop_front() {
            Some((_, task)) => {
                self.nodes.lock().remove(&task.0);
                self.mark_empty_if_so(top);
                transition_to_running(tasks, task)
            }
            None => Decision::Idle,
        }
    }
}
