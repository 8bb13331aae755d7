//! `Runtime`: the top-level aggregate wiring every subsystem together and
//! owning the worker OS threads (§6 "Runtime", §4.16).
//!
//! Every other module in this crate is a self-contained primitive that knows
//! nothing about the others — `Events` doesn't know about `Semaphore`,
//! `Worker` doesn't know about `Directory<Task>` teardown. `Runtime` is where
//! those seams get tied: it owns one `Directory` per table the specification
//! names, one `SchedulerSlot` per worker (scheduler and worker share an id,
//! see `DESIGN.md`'s resolution of the multi-worker-per-scheduler Open
//! Question), and the handful of cross-cutting helpers — `wake_task`,
//! `tick_once`, the worker thread bodies — that a primitive on its own has no
//! way to express.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use abi::{LogLevel, ObjectId, Priority, ResultCode, SchedulerKind, TaskLifecycle};
use parking_lot::Mutex;

use crate::directory::Directory;
use crate::error::{PrsError, Result};
use crate::event::Events;
use crate::exception::ExceptionChain;
use crate::message::{Filter, Message};
use crate::name_resolver::NameResolver;
use crate::scheduler::{Cooperative, PriorityScheduler, Scheduler};
use crate::semaphore::Semaphore;
use crate::task::{Task, TaskParams};
use crate::timer_wheel::TimerWheel;
use crate::worker::{LoopEvent, Worker};

const TASK_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 512;
const TIMER_CAPACITY: usize = 256;
const SEMAPHORE_CAPACITY: usize = 64;
const MAILBOX_CAPACITY: usize = 32;
const WAITER_CAPACITY: usize = 64;
const NAME_BUCKETS: usize = 64;
const NAME_NODE_CAPACITY: usize = 256;

/// Parameters accepted by `Runtime::task_create` (§6 "Task creation
/// parameters"). `sched_id` names one of the scheduler slots `start_workers`
/// allocated — also that slot's worker id, per `SchedulerSlot`.
pub struct TaskSpawn {
    pub name: String,
    pub priority: Priority,
    pub stack_size: usize,
    pub sched_id: ObjectId,
    pub entry: Box<dyn FnOnce() -> i32 + Send + 'static>,
}

/// One worker's scheduler and the `Worker` bound to it, addressed by a
/// single `ObjectId` shared by both roles (§9 Open Question: "one worker
/// binds per scheduler" — see `DESIGN.md`). `Scheduler::ready`'s returned
/// "worker to interrupt" id is looked up here to reach the actual `Worker`.
struct SchedulerSlot {
    scheduler: Arc<dyn Scheduler>,
    worker: Arc<Worker>,
}

/// The aggregate runtime: every table an External Interface call (§6) needs,
/// plus the worker OS threads driving them. Always held behind an `Arc` —
/// the worker thread bodies and `api`'s thread-local context both need to
/// keep it alive independent of whoever called `RuntimeBuilder::build`.
pub struct Runtime {
    config: crate::config::PrsConfig,
    tasks: Directory<Task>,
    events: Events,
    timers: TimerWheel,
    semaphores: Directory<Semaphore>,
    names: NameResolver,
    schedulers: Directory<SchedulerSlot>,
    worker_ids: Mutex<Vec<ObjectId>>,
    tick: AtomicU64,
    exceptions: Mutex<ExceptionChain>,
    atexit_handlers: Mutex<Vec<Box<dyn FnMut() + Send>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Builds a `Runtime` from a validated `PrsConfig`, starting one OS thread
/// per configured worker before handing the result back (§6 "Runtime::
/// builder() -> RuntimeBuilder / RuntimeBuilder::build(config) -> Runtime").
#[derive(Default)]
pub struct RuntimeBuilder {
    _private: (),
}

impl RuntimeBuilder {
    pub fn build(self, config: crate::config::PrsConfig) -> Result<Arc<Runtime>> {
        let rt = Arc::new(Runtime {
            schedulers: Directory::new(config.worker_count),
            tasks: Directory::new(TASK_CAPACITY),
            events: Events::new(EVENT_CAPACITY),
            timers: TimerWheel::new(TIMER_CAPACITY),
            semaphores: Directory::new(SEMAPHORE_CAPACITY),
            names: NameResolver::new(NAME_BUCKETS, NAME_NODE_CAPACITY),
            worker_ids: Mutex::new(Vec::with_capacity(config.worker_count)),
            tick: AtomicU64::new(0),
            exceptions: Mutex::new(ExceptionChain::new()),
            atexit_handlers: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            config,
        });
        rt.start_workers()?;
        Ok(rt)
    }
}

impl Runtime {
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    fn start_workers(self: &Arc<Self>) -> Result<()> {
        for i in 0..self.config.worker_count {
            let scheduler: Arc<dyn Scheduler> = match self.config.scheduler_kind {
                SchedulerKind::Cooperative => Arc::new(Cooperative::new(TASK_CAPACITY)),
                SchedulerKind::Priority => Arc::new(PriorityScheduler::new(TASK_CAPACITY)),
            };
            let worker = Worker::new(scheduler.clone());
            let slot_id = self
                .schedulers
                .alloc_and_lock(SchedulerSlot { scheduler: scheduler.clone(), worker: worker.clone() })
                .map_err(|c| PrsError::code("start_workers", c))?;
            scheduler.bind_worker(slot_id);
            // Left locked deliberately: this is the slot's one persistent
            // reference, not a transient borrow — it lives as long as the
            // runtime does, there is no `sched_destroy` in this design.

            let name = format!("scheduler-{i}");
            let _ = self.names.alloc(&name, slot_id);
            self.worker_ids.lock().push(slot_id);

            let rt = self.clone();
            let worker_for_thread = worker.clone();
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    crate::api::set_current_worker(rt.clone(), worker_for_thread.clone(), slot_id);
                    worker_for_thread.run(&rt.tasks, |event| {
                        let LoopEvent::Exited { task, status } = event;
                        rt.on_task_exit(task, status);
                    });
                })
                .map_err(|e| PrsError::Platform { operation: "start_workers", source: e })?;
            self.threads.lock().push(handle);
        }
        Ok(())
    }

    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn ticks_per_second(&self) -> u32 {
        self.config.ticks_per_second
    }

    /// Advances the runtime's clock by one tick, expiring any timer wheel
    /// entries due at the new tick (§4.13, §6 `ticks_get`). The clock/PIT
    /// driver that calls this on a real cadence is out of scope (§1
    /// Non-goals); tests drive it directly for determinism.
    pub fn tick_once(&self) -> u64 {
        let now = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
        self.timers.tick(now, |event, cause| {
            let Some(target) = self.events.target_task(event) else { return };
            match self.tasks.lock(target) {
                Some(task) => {
                    let outcome = self.events.signal(event, cause, &task);
                    drop(task);
                    if outcome.contains(crate::event::SignalOutcome::SIGNALED) {
                        self.wake_task(target);
                    }
                }
                None => {
                    self.events.unref(event);
                }
            }
        });
        now
    }

    /// Re-enqueues `task_id` onto its scheduler's ready set and interrupts
    /// the bound worker if the scheduler says it needs to. Re-checks that
    /// the task is actually `Ready` first — `scheduler.ready()` enqueues
    /// unconditionally, and calling it on a task that's still `Blocked`
    /// (e.g. one of an event's several signalers losing the unblock race)
    /// would corrupt the ready set with a task nobody should be running yet.
    pub(crate) fn wake_task(&self, task_id: ObjectId) {
        let Some(task) = self.tasks.lock(task_id) else { return };
        if task.current_token().state() != TaskLifecycle::Ready {
            return;
        }
        let priority = task.priority();
        let sched_id = task.sched_id();
        drop(task);

        let Some(slot) = self.schedulers.lock(sched_id) else { return };
        let scheduler = slot.scheduler.clone();
        drop(slot);

        let current = scheduler
            .bound_worker()
            .and_then(|w| self.schedulers.lock(w))
            .and_then(|s| s.worker.current_task())
            .and_then(|cur| self.tasks.lock(cur).map(|g| (cur, g.priority())));

        match scheduler.ready(task_id, priority, current) {
            Some(worker_id) => {
                if let Some(slot) = self.schedulers.lock(worker_id) {
                    slot.worker.interrupt();
                }
            }
            None => {
                if let Some(worker_id) = scheduler.bound_worker() {
                    if let Some(slot) = self.schedulers.lock(worker_id) {
                        slot.worker.signal();
                    }
                }
            }
        }
    }

    /// Worker's own execution loop reported a task exit; tears down the
    /// directory and name-resolver entries `Worker` itself never touches
    /// (§4.11's "Worker only owns execution, not lifecycle").
    fn on_task_exit(&self, task: ObjectId, status: i32) {
        if let Some(guard) = self.tasks.lock(task) {
            let name = guard.name().to_string();
            drop(guard);
            if !name.is_empty() {
                self.names.free(&name, task);
            }
        }
        self.tasks.unlock(task);
        crate::prs_log!(self.ticks(), LogLevel::Info, "task {task:?} exited with status {status}");
    }

    /// `task_create` (§6). Allocates the task, registers its name if given
    /// one, installs its coroutine on the bound worker, and enqueues it —
    /// via `Scheduler::ready` rather than `add`, so a newly created
    /// higher-priority task gets the same preemption check a waking task
    /// does (S3: "starts executing within ≤1 tick of creation").
    pub fn task_create(&self, spawn: TaskSpawn) -> Result<ObjectId> {
        let TaskSpawn { name, priority, stack_size, sched_id, entry } = spawn;
        let slot = self.schedulers.lock(sched_id).ok_or(PrsError::NotFound { id: sched_id })?;
        let scheduler = slot.scheduler.clone();
        let worker = slot.worker.clone();
        drop(slot);

        let task = Task::new(TaskParams { name: name.clone(), priority, stack_size, sched_id }, ObjectId::INVALID, MAILBOX_CAPACITY)?;
        let task_id = self.tasks.alloc_and_lock(task).map_err(|c| PrsError::code("task_create", c))?;

        if !name.is_empty() {
            if let Err(code) = self.names.alloc(&name, task_id) {
                self.tasks.unlock(task_id);
                return Err(PrsError::code("task_create", code));
            }
        }

        if let Some(guard) = self.tasks.lock(task_id) {
            let token = guard.current_token();
            guard.change_state(token, TaskLifecycle::Ready);
        }

        if let Err(code) = worker.install_context(task_id, stack_size, entry) {
            self.tasks.unlock(task_id);
            return Err(PrsError::code("task_create", code));
        }

        let current = worker.current_task().and_then(|cur| self.tasks.lock(cur).map(|g| (cur, g.priority())));
        match scheduler.ready(task_id, priority, current) {
            Some(worker_id) => {
                if let Some(slot) = self.schedulers.lock(worker_id) {
                    slot.worker.interrupt();
                }
            }
            None => worker.signal(),
        }
        Ok(task_id)
    }

    #[must_use]
    pub fn task_find(&self, name: &str) -> Option<ObjectId> {
        self.names.find(name, |id| self.tasks.lock(id).is_some())
    }

    #[must_use]
    pub fn sched_find(&self, name: &str) -> Option<ObjectId> {
        self.names.find(name, |id| self.schedulers.lock(id).is_some())
    }

    pub fn task_get_prio(&self, task_id: ObjectId) -> Result<Priority> {
        let task = self.tasks.lock(task_id).ok_or(PrsError::NotFound { id: task_id })?;
        Ok(task.priority())
    }

    pub fn task_set_prio(&self, task_id: ObjectId, priority: Priority) -> Result<()> {
        let task = self.tasks.lock(task_id).ok_or(PrsError::NotFound { id: task_id })?;
        task.set_priority(priority);
        Ok(())
    }

    pub fn task_get_stack_size(&self, task_id: ObjectId) -> Result<usize> {
        let task = self.tasks.lock(task_id).ok_or(PrsError::NotFound { id: task_id })?;
        Ok(task.stack_size())
    }

    /// `msg_send` (§6). Wakes the receiver if the send unblocked it.
    pub fn msg_send(&self, receiver_id: ObjectId, msg: Message) -> Result<()> {
        let receiver = self.tasks.lock(receiver_id).ok_or(PrsError::NotFound { id: receiver_id })?;
        receiver.queue().send(&self.events, &receiver, msg).map_err(|c| PrsError::code("msg_send", c))?;
        drop(receiver);
        self.wake_task(receiver_id);
        Ok(())
    }

    /// `msg_recv`/`msg_recv_filter`/`*_timeout` (§6), unified behind one
    /// call taking an optional timeout in ticks. `suspend`/`reacknowledge`
    /// are the caller's own coroutine yield points (`crate::context::
    /// yield_now` for a task calling this on itself).
    pub fn msg_recv(
        &self,
        task_id: ObjectId,
        filter: Filter,
        timeout_ticks: Option<u64>,
        mut suspend: impl FnMut(),
        mut reacknowledge: impl FnMut(),
    ) -> Result<Option<Message>> {
        let task = self.tasks.lock(task_id).ok_or(PrsError::NotFound { id: task_id })?;
        let now = self.ticks();
        let timer = timeout_ticks.map(|_| &self.timers);
        task.queue()
            .recv_filter_timeout(&self.events, timer, task_id, &task, filter, now, timeout_ticks, &mut suspend, &mut reacknowledge)
            .map_err(|c| PrsError::code("msg_recv", c))
    }

    pub fn sem_create(&self, initial: i64, name: Option<&str>) -> Result<ObjectId> {
        let id = self.semaphores.alloc_and_lock(Semaphore::new(WAITER_CAPACITY, initial)).map_err(|c| PrsError::code("sem_create", c))?;
        if let Some(name) = name {
            if let Err(code) = self.names.alloc(name, id) {
                self.semaphores.unlock(id);
                return Err(PrsError::code("sem_create", code));
            }
        }
        Ok(id)
    }

    pub fn sem_destroy(&self, id: ObjectId, name: Option<&str>) -> Result<()> {
        if let Some(name) = name {
            self.names.free(name, id);
        }
        self.semaphores.unlock(id);
        Ok(())
    }

    pub fn sem_wait(&self, id: ObjectId, task_id: ObjectId, mut suspend: impl FnMut()) -> Result<()> {
        let sem = self.semaphores.lock(id).ok_or(PrsError::NotFound { id })?;
        let task = self.tasks.lock(task_id).ok_or(PrsError::NotFound { id: task_id })?;
        sem.wait(&self.events, &self.tasks, task_id, &task, &mut suspend, |woken| self.wake_task(woken))
            .map_err(|c| PrsError::code("sem_wait", c))
    }

    pub fn sem_wait_timeout(&self, id: ObjectId, task_id: ObjectId, timeout_ticks: u64, mut suspend: impl FnMut()) -> Result<bool> {
        let sem = self.semaphores.lock(id).ok_or(PrsError::NotFound { id })?;
        let task = self.tasks.lock(task_id).ok_or(PrsError::NotFound { id: task_id })?;
        let now = self.ticks();
        sem.wait_timeout(&self.events, &self.timers, &self.tasks, task_id, &task, now, timeout_ticks, &mut suspend, |woken| {
            self.wake_task(woken)
        })
        .map_err(|c| PrsError::code("sem_wait_timeout", c))
    }

    pub fn sem_signal(&self, id: ObjectId) -> Result<()> {
        let sem = self.semaphores.lock(id).ok_or(PrsError::NotFound { id })?;
        sem.signal(&self.events, &self.tasks, |woken| self.wake_task(woken));
        Ok(())
    }

    /// `yield` (§6), the scheduling half: demotes `task_id` from Running to
    /// Ready and re-adds it to its own scheduler's ready set. The caller
    /// (`api::yield_task`) still has to actually suspend the coroutine
    /// afterwards — this only fixes up the bookkeeping a plain
    /// `context::yield_now()` wouldn't.
    pub fn yield_task(&self, task_id: ObjectId) -> Result<()> {
        let task = self.tasks.lock(task_id).ok_or(PrsError::NotFound { id: task_id })?;
        let token = task.current_token();
        let priority = task.priority();
        let sched_id = task.sched_id();
        task.change_state(token, TaskLifecycle::Ready);
        drop(task);
        if let Some(slot) = self.schedulers.lock(sched_id) {
            let _ = slot.scheduler.add(task_id, priority);
        }
        Ok(())
    }

    /// Removes `task_id` from its scheduler's ready set, marking it for
    /// `Decision::SwitchToExit` at the worker's next scheduling decision
    /// (§7 `error`'s `KillTask` action).
    pub fn kill_task(&self, task_id: ObjectId) {
        let Some(task) = self.tasks.lock(task_id) else { return };
        let sched_id = task.sched_id();
        drop(task);
        if let Some(slot) = self.schedulers.lock(sched_id) {
            slot.scheduler.remove(task_id);
        }
    }

    #[must_use]
    pub fn exceptions(&self) -> &Mutex<ExceptionChain> {
        &self.exceptions
    }

    pub fn atexit(&self, handler: Box<dyn FnMut() + Send>) {
        self.atexit_handlers.lock().push(handler);
    }

    #[must_use]
    pub fn default_stack_size(&self) -> usize {
        self.config.default_stack_size
    }

    /// Stops every worker in reverse start order, joins their threads, then
    /// runs registered `atexit` handlers (§6 `shutdown`).
    pub fn shutdown(&self) -> anyhow::Result<()> {
        let ids: Vec<ObjectId> = self.worker_ids.lock().iter().rev().copied().collect();
        for id in ids {
            if let Some(slot) = self.schedulers.lock(id) {
                slot.worker.stop();
            }
        }
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            handle.join().map_err(|_| anyhow::anyhow!("a worker thread panicked during shutdown"))?;
        }
        for handler in self.atexit_handlers.lock().iter_mut() {
            handler();
        }
        Ok(())
    }
}
