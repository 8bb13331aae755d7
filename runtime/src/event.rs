//! Event: single-shot, multi-source, reference-counted wakeup token (§4.6).
//!
//! An Event ties one blocked task to however many parties might end up
//! signaling it (a sender, a semaphore, a timer) plus the waiter itself.
//! Every party — signalers and the waiter alike — calls exactly one of
//! `signal`/`unref`/`cancel`; whichever of those calls drives the shared
//! counter to zero is the one that frees the record. A transient directory
//! lock guards each individual call against a concurrent free; the
//! counter, not the directory refcount, is the event's own protocol state.

use std::sync::atomic::{AtomicU32, Ordering};

use abi::{ObjectId, ResultCode, UnblockCause};

use crate::directory::Directory;
use crate::task::{StateToken, Task};

struct EventRecord {
    target_task: ObjectId,
    target_token: StateToken,
    remaining: AtomicU32,
}

bitflags::bitflags! {
    /// Result of a [`Events::signal`] call (§4.6: "a state bitmask
    /// `{signaled, freed}`").
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct SignalOutcome: u8 {
        /// This call was the one that transitioned the target task back to
        /// Ready/Running.
        const SIGNALED = 1 << 0;
        /// This call drove the event's reference count to zero and freed it.
        const FREED = 1 << 1;
    }
}

/// Table of live Events, addressed by [`ObjectId`].
pub struct Events {
    dir: Directory<EventRecord>,
}

impl Events {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { dir: Directory::new(capacity) }
    }

    /// Allocates an Event bound to `task`'s current block, snapshotting its
    /// token. `signalers` is the number of distinct parties expected to call
    /// `signal`/`unref` besides the waiter's own eventual call. Returns the
    /// id together with the token `task.block()` produced, since a caller
    /// that ends up not actually suspending (e.g. a message queue's
    /// re-scan finding a match immediately) needs it to restore Running.
    /// `task_id` is stored alongside the token so a caller that only has the
    /// event id in hand (the timer wheel's global tick loop) can still look
    /// the owning task back up through a `Directory<Task>` (§3 "Event").
    pub fn create(&self, task_id: ObjectId, task: &Task, signalers: u32) -> Result<(ObjectId, StateToken), ResultCode> {
        let target_token = task.block();
        let id = self.dir.alloc_and_lock(EventRecord {
            target_task: task_id,
            target_token,
            remaining: AtomicU32::new(signalers + 1),
        })?;
        Ok((id, target_token))
    }

    /// The task id an event was created against, for a caller that doesn't
    /// already hold a `&Task` (the runtime's global tick loop dispatching a
    /// `TimerWheel::tick` callback). `None` if the event has already been
    /// freed.
    pub fn target_task(&self, id: ObjectId) -> Option<ObjectId> {
        self.dir.lock(id).map(|record| record.target_task)
    }

    /// Decrements the event's remaining count and, if this call's decrement
    /// succeeds, attempts to transition the target task from Blocked back to
    /// Ready with `cause`. Only one caller across every `signal`/`unref` on
    /// this event can win that transition, since it's gated by the task's
    /// own token CAS.
    pub fn signal(&self, id: ObjectId, cause: UnblockCause, task: &Task) -> SignalOutcome {
        let Some(record) = self.dir.lock(id) else { return SignalOutcome::FREED };
        let prev = record.remaining.fetch_sub(1, Ordering::AcqRel);
        let mut outcome = SignalOutcome::empty();
        if task.unblock(record.target_token, cause, false) {
            outcome |= SignalOutcome::SIGNALED;
        }
        let is_last = prev == 1;
        drop(record);
        if is_last {
            self.dir.unlock(id);
            outcome |= SignalOutcome::FREED;
        }
        outcome
    }

    /// Decrements the event's remaining count without attempting to wake the
    /// target task. Returns `true` if this call freed the event.
    pub fn unref(&self, id: ObjectId) -> bool {
        let Some(record) = self.dir.lock(id) else { return false };
        let prev = record.remaining.fetch_sub(1, Ordering::AcqRel);
        let is_last = prev == 1;
        drop(record);
        if is_last {
            self.dir.unlock(id);
        }
        is_last
    }

    /// Releases the waiter's own share of the event immediately, for a
    /// waiter that knows no signaler has touched it yet (§4.6 `cancel`).
    /// Behaviorally identical to `unref` — a signaler that later calls
    /// `signal` on an already-cancelled event simply loses its `unblock`
    /// race harmlessly, same as any other stale signal.
    pub fn cancel(&self, id: ObjectId) -> bool {
        self.unref(id)
    }

    /// Calls `unref` up to `count` times, stopping early once the event is
    /// freed. A waiter that's done with an event — its timeout has been
    /// cancelled, its filter torn down — doesn't always know whether every
    /// signaler it provisioned for (§4.6: created with refcount
    /// `signalers + 1`) actually fired; a signaler whose source was
    /// cancelled before it could act (e.g. a timer entry cancelled before
    /// expiry) never gets a chance to call its own `unref`. Calling this
    /// with `signalers + 1` unconditionally closes that gap: any share a
    /// real signaler already decremented is simply not there to decrement
    /// again, since `unref`/`signal` on an already-freed id's stale
    /// generation is a harmless no-op.
    pub fn release_all(&self, id: ObjectId, count: u32) {
        for _ in 0..count {
            if self.unref(id) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskParams;
    use abi::Priority;

    fn task() -> Task {
        Task::new(
            TaskParams { name: "t".into(), priority: Priority(1), stack_size: 4096, sched_id: ObjectId::INVALID },
            ObjectId::INVALID,
            4,
        )
        .unwrap()
    }

    #[test]
    fn single_signaler_wakes_and_frees() {
        let events = Events::new(4);
        let t = task();
        let (id, _token) = events.create(ObjectId::INVALID, &t, 1).unwrap();
        let outcome = events.signal(id, UnblockCause::Send, &t);
        assert!(outcome.contains(SignalOutcome::SIGNALED));
        assert!(outcome.contains(SignalOutcome::FREED));
    }

    #[test]
    fn only_the_winning_signal_reports_signaled() {
        let events = Events::new(4);
        let t = task();
        let (id, _token) = events.create(ObjectId::INVALID, &t, 2).unwrap();
        let first = events.signal(id, UnblockCause::Send, &t);
        let second = events.signal(id, UnblockCause::Timeout, &t);
        assert!(first.contains(SignalOutcome::SIGNALED));
        assert!(!first.contains(SignalOutcome::FREED));
        assert!(!second.contains(SignalOutcome::SIGNALED));
        assert!(second.contains(SignalOutcome::FREED));
    }

    #[test]
    fn cancel_before_any_signal_still_lets_a_late_signal_free_it() {
        let events = Events::new(4);
        let t = task();
        let (id, _token) = events.create(ObjectId::INVALID, &t, 1).unwrap();
        assert!(!events.cancel(id));
        let outcome = events.signal(id, UnblockCause::Timeout, &t);
        assert!(outcome.contains(SignalOutcome::FREED));
        assert!(outcome.contains(SignalOutcome::SIGNALED));
    }

    #[test]
    fn signal_after_the_task_already_moved_on_is_harmless() {
        let events = Events::new(4);
        let t = task();
        let (id, token) = events.create(ObjectId::INVALID, &t, 1).unwrap();
        // The task is woken through some other path before this event fires.
        assert!(t.unblock(token, UnblockCause::Notification, false));
        let outcome = events.signal(id, UnblockCause::Timeout, &t);
        assert!(outcome.contains(SignalOutcome::FREED));
        assert!(!outcome.contains(SignalOutcome::SIGNALED));
    }
}
