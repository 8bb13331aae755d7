//! Counting semaphore with an MPMC wait queue of Events (§4.8).
//!
//! `count` is bumped *before* the wait queue is inspected on every path, and
//! every queued waiter holds a single-shot [`Events`] registration — together
//! those two properties rule out both a lost wakeup (a `signal` that lands
//! after `count` already reflects availability still finds and wakes a
//! waiter) and a spurious one (an Event fires at most once, ever).
//!
//! The wait queue stores `(event, task)` pairs rather than bare event ids:
//! whichever party pops an entry off the queue — the waiter itself on the
//! immediate-grant path, or a concurrent `signal` — may not be the task that
//! owns that entry, so it needs the task id to look the task up and hand
//! [`Events::signal`] the `&Task` it requires.

use std::sync::atomic::{AtomicI64, Ordering};

use abi::{ObjectId, ResultCode, TaskLifecycle, UnblockCause};

use crate::directory::Directory;
use crate::event::Events;
use crate::mpmcq::Mpmcq;
use crate::task::Task;
use crate::timer_wheel::TimerWheel;

pub struct Semaphore {
    count: AtomicI64,
    waiters: Mpmcq<(ObjectId, ObjectId)>,
}

impl Semaphore {
    #[must_use]
    pub fn new(capacity: usize, initial: i64) -> Self {
        Self { count: AtomicI64::new(initial), waiters: Mpmcq::new(capacity) }
    }

    #[must_use]
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Blocks until a permit is available. `suspend` performs the caller's
    /// actual coroutine yield and is skipped entirely if this call's own
    /// registration was already granted by the time `count` was inspected.
    /// `on_wake` is invoked with the id of whichever task this call's grant
    /// ended up waking (which may not be the caller itself, since the permit
    /// is granted to whoever is at the head of the wait queue) — a caller
    /// that re-enqueues woken tasks onto a scheduler needs that id even
    /// though this function otherwise only reports its own outcome.
    pub fn wait(
        &self,
        events: &Events,
        tasks: &Directory<Task>,
        task_id: ObjectId,
        task: &Task,
        mut suspend: impl FnMut(),
        mut on_wake: impl FnMut(ObjectId),
    ) -> Result<(), ResultCode> {
        let (event_id, _token) = events.create(task_id, task, 1)?;
        self.waiters.enqueue((event_id, task_id))?;
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        if prev > 0 {
            if let Some((ev, tid)) = self.waiters.dequeue() {
                self.wake(events, tasks, ev, tid, &mut on_wake);
            }
        }
        if task.current_token().state() == TaskLifecycle::Blocked {
            suspend();
        }
        // This event was provisioned for one signaler (a `signal` call) plus
        // the waiter's own share (§4.6: created with refcount
        // `signalers + 1`). Whichever path granted the permit above already
        // spent the signaler's share via `wake`'s `events.signal`; the
        // waiter's own share is still outstanding and must be released here,
        // same as `wait_timeout` does for its own two shares below.
        events.release_all(event_id, 2);
        Ok(())
    }

    /// Same as `wait`, but gives up and returns `false` (restoring the permit
    /// it provisionally took) if no signal arrives within `timeout_ticks`.
    pub fn wait_timeout(
        &self,
        events: &Events,
        timer: &TimerWheel,
        tasks: &Directory<Task>,
        task_id: ObjectId,
        task: &Task,
        now: u64,
        timeout_ticks: u64,
        mut suspend: impl FnMut(),
        mut on_wake: impl FnMut(ObjectId),
    ) -> Result<bool, ResultCode> {
        let (event_id, _token) = events.create(task_id, task, 2)?;
        self.waiters.enqueue((event_id, task_id))?;
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        if prev > 0 {
            if let Some((ev, tid)) = self.waiters.dequeue() {
                self.wake(events, tasks, ev, tid, &mut on_wake);
            }
        }

        // This event was provisioned for two signalers (a `signal` call and
        // the timer) plus the waiter's own share. Whichever of those never
        // actually fires — the timer cancelled below, or no `signal` ever
        // arriving — leaves its share undrained unless we release it
        // ourselves; `release_all` closes that out regardless of which path
        // got us here, since extra releases on an already-freed event are
        // harmless no-ops.
        let timer_guard = match timer.queue(event_id, UnblockCause::Timeout, now, timeout_ticks) {
            Ok(g) => g,
            Err(code) => {
                self.count.fetch_add(1, Ordering::AcqRel);
                events.release_all(event_id, 3);
                return Err(code);
            }
        };

        if task.current_token().state() == TaskLifecycle::Blocked {
            suspend();
        }
        TimerWheel::cancel(timer_guard);
        events.release_all(event_id, 3);

        let acquired = task.current_token().cause() != UnblockCause::Timeout;
        if !acquired {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(acquired)
    }

    /// Releases one permit, waking the oldest waiter if `count` was negative
    /// (i.e. there was at least one outstanding waiter) just before this call.
    pub fn signal(&self, events: &Events, tasks: &Directory<Task>, mut on_wake: impl FnMut(ObjectId)) {
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        if prev < 0 {
            if let Some((ev, tid)) = self.waiters.dequeue() {
                self.wake(events, tasks, ev, tid, &mut on_wake);
            }
        }
    }

    fn wake(&self, events: &Events, tasks: &Directory<Task>, event: ObjectId, task_id: ObjectId, on_wake: &mut impl FnMut(ObjectId)) {
        match tasks.lock(task_id) {
            Some(t) => {
                events.signal(event, UnblockCause::Signal, &t);
                drop(t);
                on_wake(task_id);
            }
            None => {
                events.unref(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskParams;
    use abi::Priority;

    fn tasks_with_one(name: &str) -> (Directory<Task>, ObjectId) {
        let dir = Directory::new(4);
        let id = dir
            .alloc_and_lock(
                Task::new(
                    TaskParams { name: name.into(), priority: Priority(1), stack_size: 4096, sched_id: ObjectId::INVALID },
                    ObjectId::INVALID,
                    4,
                )
                .unwrap(),
            )
            .unwrap();
        (dir, id)
    }

    #[test]
    fn wait_on_a_signaled_semaphore_never_suspends() {
        let events = Events::new(4);
        let (tasks, id) = tasks_with_one("t");
        let sem = Semaphore::new(4, 1);
        let guard = tasks.lock(id).unwrap();
        sem.wait(&events, &tasks, id, &guard, || panic!("must not suspend, a permit was available"), |_| {})
            .unwrap();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn wait_on_an_empty_semaphore_suspends_until_signal() {
        let events = Events::new(4);
        let (tasks, id) = tasks_with_one("t");
        let sem = Semaphore::new(4, 0);
        let guard = tasks.lock(id).unwrap();
        sem.wait(
            &events,
            &tasks,
            id,
            &guard,
            || {
                sem.signal(&events, &tasks, |_| {});
            },
            |_| {},
        )
        .unwrap();
        assert_eq!(guard.current_token().cause(), UnblockCause::Signal);
    }

    #[test]
    fn signal_before_wait_means_wait_never_suspends() {
        let events = Events::new(4);
        let (tasks, id) = tasks_with_one("t");
        let sem = Semaphore::new(4, 0);
        sem.signal(&events, &tasks, |_| {});
        let guard = tasks.lock(id).unwrap();
        sem.wait(&events, &tasks, id, &guard, || panic!("lost wakeup: signal preceded wait"), |_| {}).unwrap();
    }

    #[test]
    fn wait_timeout_expires_and_restores_the_permit() {
        let events = Events::new(4);
        let timer = TimerWheel::new(4);
        let (tasks, id) = tasks_with_one("t");
        let sem = Semaphore::new(4, 0);
        let guard = tasks.lock(id).unwrap();
        let acquired = sem
            .wait_timeout(
                &events,
                &timer,
                &tasks,
                id,
                &guard,
                0,
                5,
                || {
                    for t in 1..=5 {
                        timer.tick(t, |event, cause| {
                            events.signal(event, cause, &guard);
                        });
                    }
                },
                |_| {},
            )
            .unwrap();
        assert!(!acquired);
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn wait_timeout_satisfied_by_a_signal_leaves_the_permit_consumed() {
        let events = Events::new(4);
        let timer = TimerWheel::new(4);
        let (tasks, id) = tasks_with_one("t");
        let sem = Semaphore::new(4, 0);
        let guard = tasks.lock(id).unwrap();
        let acquired = sem
            .wait_timeout(
                &events,
                &timer,
                &tasks,
                id,
                &guard,
                0,
                100,
                || {
                    sem.signal(&events, &tasks, |_| {});
                },
                |_| {},
            )
            .unwrap();
        assert!(acquired);
    }
}
