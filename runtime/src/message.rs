//! Message passing: envelopes, per-task mailbox, and selective receive with
//! an optional filter and timeout (§4.7).
//!
//! A mailbox stores its envelopes in a [`Pool`] and threads them in arrival
//! order through an [`Mpsciq`] of the envelope's id — the queue itself never
//! sees the (non-`Copy`) payload, only the `Copy` handle to it. `send` always
//! succeeds onto the tail; `recv`/`recv_filter` scan from the head looking for
//! the first envelope whose id passes the filter, which is the one place this
//! module departs from a plain FIFO queue.
//!
//! Receiving without a match installs a filter record and an [`Events`]
//! registration so a racing `send` can find and wake it, then blocks. Because
//! `Events::create` unconditionally transitions the task to `Blocked`, a
//! receiver whose own re-scan (after installing the filter, before actually
//! suspending) finds a match has to undo that transition itself rather than
//! rely on a signaler who may never show up.

use std::sync::atomic::{AtomicU32, Ordering};

use abi::{MessageId, ObjectId, ResultCode, TaskLifecycle, UnblockCause, MAX_FILTER_IDS};

use crate::event::Events;
use crate::mpsciq::Mpsciq;
use crate::pool::Pool;
use crate::task::Task;
use crate::timer_wheel::TimerWheel;

/// A received or in-flight message (§6 "message envelope"). `sender` is the
/// task id `msg_get_sender` reports; `id` is matched against filters.
#[derive(Clone)]
pub struct Message {
    pub sender: ObjectId,
    pub id: MessageId,
    pub payload: Vec<u8>,
}

/// A snapshot of the ids a `msg_recv_filter` call will accept. An empty
/// filter (`count == 0`) accepts anything, matching a plain `msg_recv`.
#[derive(Copy, Clone)]
pub struct Filter {
    ids: [u32; MAX_FILTER_IDS],
    count: usize,
}

impl Filter {
    #[must_use]
    pub fn any() -> Self {
        Self { ids: [0; MAX_FILTER_IDS], count: 0 }
    }

    /// Builds a filter from up to `MAX_FILTER_IDS` message ids; any ids past
    /// the limit are dropped rather than rejected, since the external API
    /// (§6) specifies the array length, not this constructor, as the gate.
    #[must_use]
    pub fn matching(ids: &[u32]) -> Self {
        let count = ids.len().min(MAX_FILTER_IDS);
        let mut stored = [0u32; MAX_FILTER_IDS];
        stored[..count].copy_from_slice(&ids[..count]);
        Self { ids: stored, count }
    }

    #[must_use]
    pub fn matches(self, id: MessageId) -> bool {
        self.count == 0 || self.ids[..self.count].contains(&id.0)
    }
}

struct FilterRecord {
    filter: Filter,
    event: ObjectId,
}

/// A task's mailbox: arrival-ordered envelopes plus the single installed
/// filter a concurrent `send` checks against.
pub struct MessageQueue {
    bodies: Pool<Message>,
    order: Mpsciq<ObjectId>,
    filters: Pool<FilterRecord>,
    current_filter: AtomicU32,
}

impl MessageQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            bodies: Pool::new(capacity),
            order: Mpsciq::new(capacity),
            filters: Pool::new(4),
            current_filter: AtomicU32::new(ObjectId::INVALID.0),
        }
    }

    /// Enqueues `msg` and wakes `receiver` if it has an installed filter that
    /// accepts it (§4.7 `send`). `receiver` must be the task that owns this
    /// queue; it's threaded through explicitly rather than stored, since
    /// `MessageQueue` itself doesn't know its owning `Task`.
    pub fn send(&self, events: &Events, receiver: &Task, msg: Message) -> Result<(), ResultCode> {
        let (body_id, guard) = self.bodies.alloc_and_lock(msg)?;
        // Ownership of this reference passes to `order`; it's released when
        // the envelope is dequeued in `take_matching`.
        std::mem::forget(guard);
        if self.order.push(body_id).is_err() {
            self.bodies.unlock(body_id);
            return Err(ResultCode::OutOfMemory);
        }
        self.try_wake_filter(events, receiver);
        Ok(())
    }

    /// Receives the first envelope accepted by `filter`, blocking (with an
    /// optional timeout) if none is queued yet. `suspend` performs the
    /// caller's actual coroutine yield; it returns once the task has been
    /// unblocked by some path, at which point this re-checks the queue.
    /// `reacknowledge` is invoked only in the rare case where a signaler
    /// raced this call's own re-scan and already marked the task Ready —
    /// since this call never actually suspended, something needs to consume
    /// that now-stale readiness before the task yields for any other reason.
    pub fn recv_filter_timeout(
        &self,
        events: &Events,
        timer: Option<&TimerWheel>,
        task_id: ObjectId,
        task: &Task,
        filter: Filter,
        now: u64,
        timeout_ticks: Option<u64>,
        mut suspend: impl FnMut(),
        mut reacknowledge: impl FnMut(),
    ) -> Result<Option<Message>, ResultCode> {
        loop {
            if let Some(msg) = self.take_matching(filter) {
                return Ok(Some(msg));
            }

            let signalers = if timeout_ticks.is_some() { 2 } else { 1 };
            let (event_id, blocked_token) = events.create(task_id, task, signalers)?;

            let filter_alloc = self.filters.alloc_and_lock(FilterRecord { filter, event: event_id });
            let filter_id = match filter_alloc {
                Ok((id, guard)) => {
                    std::mem::forget(guard);
                    id
                }
                Err(code) => {
                    events.cancel(event_id);
                    return Err(code);
                }
            };
            self.current_filter.store(filter_id.0, Ordering::Release);

            let timer_guard = match timeout_ticks {
                Some(delay) => {
                    let wheel = timer.expect("a timeout requires a timer wheel");
                    match wheel.queue(event_id, UnblockCause::Timeout, now, delay) {
                        Ok(g) => Some(g),
                        Err(code) => {
                            self.clear_filter(filter_id);
                            events.cancel(event_id);
                            return Err(code);
                        }
                    }
                }
                None => None,
            };

            // Re-scan: a send may have landed between the first scan and the
            // filter becoming visible.
            if let Some(msg) = self.take_matching(filter) {
                self.clear_filter(filter_id);
                if let Some(g) = timer_guard {
                    TimerWheel::cancel(g);
                }
                // Nothing external has touched this event yet: neither a
                // racing send (we just cleared the filter) nor the timer
                // (just cancelled) gets a chance to call its own share, so
                // the full `signalers + 1` has to be drained here.
                events.release_all(event_id, signalers + 1);
                if task.change_state(blocked_token, TaskLifecycle::Running).is_none() {
                    // A signaler won the race and already marked us Ready;
                    // that entry needs to be consumed before we yield again.
                    reacknowledge();
                }
                return Ok(Some(msg));
            }

            suspend();

            self.clear_filter(filter_id);
            if let Some(g) = timer_guard {
                TimerWheel::cancel(g);
            }
            // Whichever of {a send, the timer} actually woke us already
            // released its own share; the other (the timer, if it was
            // cancelled before firing, or a send that never arrived) never
            // gets to. Draining the full count here is always safe since a
            // share already released just finds the event gone.
            events.release_all(event_id, signalers + 1);

            match task.current_token().cause() {
                UnblockCause::Send => continue,
                _ => return Ok(None),
            }
        }
    }

    fn try_wake_filter(&self, events: &Events, receiver: &Task) {
        let filter_id = ObjectId(self.current_filter.load(Ordering::Acquire));
        if !filter_id.is_valid() {
            return;
        }
        let Some(record) = self.filters.lock(filter_id) else { return };
        let filter = record.filter;
        let event = record.event;
        drop(record);
        let matched = self.order.iter().any(|(_, body_id)| self.matches(body_id, filter));
        if matched {
            // Clearing the slot here is an optimization, not a correctness
            // requirement: `recv`'s own re-scan clears it too, and a stale
            // filter_id just fails its CAS harmlessly.
            let _ =
                self.current_filter.compare_exchange(filter_id.0, ObjectId::INVALID.0, Ordering::AcqRel, Ordering::Relaxed);
            events.signal(event, UnblockCause::Send, receiver);
        }
    }

    fn take_matching(&self, filter: Filter) -> Option<Message> {
        for (node_id, body_id) in self.order.iter() {
            if self.matches(body_id, filter) {
                self.order.remove(node_id);
                let msg = {
                    let guard = self.bodies.lock(body_id)?;
                    Message { sender: guard.sender, id: guard.id, payload: guard.payload.clone() }
                };
                // Releases the reference `send` transferred to the queue.
                self.bodies.unlock(body_id);
                return Some(msg);
            }
        }
        None
    }

    fn matches(&self, body_id: ObjectId, filter: Filter) -> bool {
        self.bodies.lock(body_id).map(|g| filter.matches(g.id)).unwrap_or(false)
    }

    fn clear_filter(&self, filter_id: ObjectId) {
        let _ = self.current_filter.compare_exchange(filter_id.0, ObjectId::INVALID.0, Ordering::AcqRel, Ordering::Relaxed);
        self.filters.unlock(filter_id);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
