//! Multi-level timer wheel (§4.5).
//!
//! Eight wheels of 256 slots each cover the full 64-bit tick range (8 bits
//! per wheel level). An entry with delay `d` lands in the lowest wheel whose
//! slot span still covers `d`; every time the lowest wheel's pointer wraps,
//! one slot of the next wheel up is cascaded down into finer-grained slots,
//! recursing upward only as far as that wheel also wraps on this tick.
//!
//! New entries never touch the slot arrays directly — `queue` only pushes
//! onto the `pending` MPSC queue, which `tick` drains before advancing, so
//! that a producer racing the tick function never observes a torn slot list.

use parking_lot::Mutex;

use abi::{ObjectId, ResultCode, UnblockCause};

use crate::mpsciq::Mpsciq;
use crate::pool::{Pool, PoolGuard};

const WHEELS: usize = 8;
const SLOT_BITS: u32 = 8;
const SLOTS: usize = 1 << SLOT_BITS;
const SLOT_MASK: u64 = (SLOTS as u64) - 1;

/// A single outstanding timed wait (§3 "Timer entry").
pub struct TimerEntry {
    pub event: ObjectId,
    pub cause: UnblockCause,
    pub start_tick: u64,
    pub end_tick: u64,
}

#[derive(Copy, Clone)]
struct PendingInsert {
    id: ObjectId,
    end_tick: u64,
}

struct Inner {
    now: u64,
    slots: Vec<Vec<ObjectId>>,
}

impl Inner {
    fn slot_index(wheel: usize, slot: usize) -> usize {
        wheel * SLOTS + slot
    }

    fn wheel_for_delay(delay: u64) -> usize {
        if delay == 0 {
            return 0;
        }
        let bits = u64::BITS as u64 - delay.leading_zeros() as u64;
        (((bits - 1) / u64::from(SLOT_BITS)) as usize).min(WHEELS - 1)
    }

    fn slot_for(wheel: usize, end_tick: u64) -> usize {
        let shift = wheel as u32 * SLOT_BITS;
        let raw = (end_tick >> shift) as i128 - i128::from(wheel > 0);
        raw.rem_euclid(SLOTS as i128) as usize
    }

    fn insert(&mut self, id: ObjectId, end_tick: u64) {
        let delay = end_tick.saturating_sub(self.now);
        let wheel = Self::wheel_for_delay(delay);
        let slot = Self::slot_for(wheel, end_tick);
        self.slots[Self::slot_index(wheel, slot)].push(id);
    }
}

/// Owns a fixed [`Pool`] of [`TimerEntry`] and the wheel slots that track
/// them until expiry or cancellation.
pub struct TimerWheel {
    pool: Pool<TimerEntry>,
    pending: Mpsciq<PendingInsert>,
    inner: Mutex<Inner>,
}

impl TimerWheel {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: Pool::new(capacity),
            pending: Mpsciq::new(capacity),
            inner: Mutex::new(Inner { now: 0, slots: (0..WHEELS * SLOTS).map(|_| Vec::new()).collect() }),
        }
    }

    /// Queues `event` to be signaled with `cause` at `now + delay_ticks`.
    /// Returns a guard whose drop is the cancellation path (§4.5:
    /// "cancellation simply unlocks the Pool entry").
    pub fn queue(
        &self,
        event: ObjectId,
        cause: UnblockCause,
        now: u64,
        delay_ticks: u64,
    ) -> Result<PoolGuard<'_, TimerEntry>, ResultCode> {
        let end_tick = now.saturating_add(delay_ticks.max(1));
        let (id, guard) = self.pool.alloc_and_lock(TimerEntry { event, cause, start_tick: now, end_tick })?;
        // Second reference: the wheel's own hold, per the refcount-2 invariant.
        self.pool.add_ref(id);
        if self.pending.push(PendingInsert { id, end_tick }).is_err() {
            self.pool.unlock(id);
            drop(guard);
            return Err(ResultCode::OutOfMemory);
        }
        Ok(guard)
    }

    /// Cancels a timer entry by releasing the caller's reference. Equivalent
    /// to dropping the guard returned by `queue`; spelled out for callers
    /// that want the intent visible at the call site.
    pub fn cancel(guard: PoolGuard<'_, TimerEntry>) {
        drop(guard);
    }

    /// Advances the wheel to `now`, invoking `on_expire(event, cause)` for
    /// every entry whose `end_tick` has been reached. Not reentrant — the
    /// clock is required to serialize calls (§4.5 "tick function is
    /// single-consumer").
    pub fn tick(&self, now: u64, mut on_expire: impl FnMut(ObjectId, UnblockCause)) {
        let mut inner = self.inner.try_lock().expect("timer wheel tick must not reenter");
        let prev = inner.now;
        inner.now = now;

        while let Some((_, pending)) = self.pending.pop_front() {
            inner.insert(pending.id, pending.end_tick);
        }

        if now <= prev {
            return;
        }
        for t in (prev + 1)..=now {
            let slot = (t & SLOT_MASK) as usize;
            let ids = std::mem::take(&mut inner.slots[Inner::slot_index(0, slot)]);
            for id in ids {
                self.dispatch(&mut inner, id, now, &mut on_expire);
            }
            if slot == 0 {
                self.cascade(&mut inner, 1, t, now, &mut on_expire);
            }
        }
    }

    fn cascade(
        &self,
        inner: &mut Inner,
        wheel: usize,
        t: u64,
        now: u64,
        on_expire: &mut impl FnMut(ObjectId, UnblockCause),
    ) {
        if wheel >= WHEELS {
            return;
        }
        let shift = wheel as u32 * SLOT_BITS;
        let slot = ((t >> shift) & SLOT_MASK) as usize;
        let ids = std::mem::take(&mut inner.slots[Inner::slot_index(wheel, slot)]);
        for id in ids {
            self.dispatch(inner, id, now, on_expire);
        }
        if slot == 0 {
            self.cascade(inner, wheel + 1, t, now, on_expire);
        }
    }

    /// Resolves one id pulled out of a slot: cancelled entries drop the
    /// wheel's own reference and vanish; due entries fire `on_expire`; not
    ///-yet-due entries (only possible after a cascade) are reinserted.
    fn dispatch(&self, inner: &mut Inner, id: ObjectId, now: u64, on_expire: &mut impl FnMut(ObjectId, UnblockCause)) {
        match self.pool.refcount(id) {
            None => {}
            Some(1) => self.pool.unlock(id),
            Some(_) => {
                let Some(guard) = self.pool.lock(id) else { return };
                let (event, cause, end_tick) = (guard.event, guard.cause, guard.end_tick);
                drop(guard);
                if end_tick <= now {
                    on_expire(event, cause);
                    self.pool.unlock(id);
                } else {
                    inner.insert(id, end_tick);
                }
            }
        }
    }

    #[must_use]
    pub fn now(&self) -> u64 {
        self.inner.lock().now
    }
}
