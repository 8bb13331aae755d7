// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-capacity, `Copy`-payload ring buffers for recording runtime events.
//!
//! This is the substrate for [`log`](https://docs.rs/log)-facing messages and
//! for any other high-frequency instrumentation that must not allocate and
//! must not be visible as extra lock contention to code running inside a
//! signal handler. Unlike the teacher's single-threaded original (one
//! `StaticCell` per task), this runtime is multi-worker, so each ring buffer
//! is guarded by a `parking_lot::Mutex` — still allocation-free, and cheap
//! enough outside of signal-handler context (nothing in this crate is called
//! from a signal handler; see `prs-runtime::worker` for the async-signal-safe
//! path, which uses a single relaxed atomic instead).
//!
//! ## Declaring a ring buffer
//!
//! ```
//! use prs_ringbuf::ringbuf;
//!
//! ringbuf!(EVENTS, u32, 16, 0);
//! EVENTS.record(42);
//! assert_eq!(EVENTS.last().unwrap().payload, 42);
//! ```
//!
//! Entries are de-duplicated: recording the same payload twice in a row bumps
//! the previous entry's `count` instead of consuming a new slot, so a busy
//! loop logging the same condition doesn't evict older history.

use parking_lot::Mutex;

/// One recorded event: its payload, how many times it repeated in a row, and
/// a generation counter bumped on every write (so a reader can tell entries
/// apart even after a count overflow wraps).
#[derive(Copy, Clone, Debug)]
pub struct Entry<T: Copy> {
    pub payload: T,
    pub count: u32,
    pub generation: u32,
}

impl<T: Copy + Default> Default for Entry<T> {
    fn default() -> Self {
        Self { payload: T::default(), count: 0, generation: 0 }
    }
}

struct Inner<T: Copy, const N: usize> {
    last: Option<usize>,
    buffer: [Entry<T>; N],
}

/// A fixed-capacity ring buffer of `N` entries of type `T`.
///
/// Constructed via the [`ringbuf!`] macro, which gives it a `'static` name
/// so it can be located without a handle threaded through every call site —
/// exactly the humility/gdb-inspectable convention the teacher's `ringbuf`
/// crate establishes, minus the microcontroller-specific tooling.
pub struct Ringbuf<T: Copy, const N: usize> {
    inner: Mutex<Inner<T, N>>,
}

impl<T: Copy + Default + PartialEq, const N: usize> Ringbuf<T, N> {
    #[must_use]
    pub const fn new(default: T) -> Self {
        Self { inner: Mutex::new(Inner { last: None, buffer: [Entry { payload: default, count: 0, generation: 0 }; N] }) }
    }

    /// Records `payload`, reusing the most recent slot if it holds the same
    /// payload (de-duplication), otherwise advancing into the next slot,
    /// wrapping at capacity.
    pub fn record(&self, payload: T) {
        let mut inner = self.inner.lock();
        let last = inner.last.unwrap_or(usize::MAX);
        if let Some(ent) = inner.buffer.get_mut(last) {
            if ent.payload == payload {
                ent.count = ent.count.saturating_add(1);
                return;
            }
        }
        let ndx = {
            let next = last.wrapping_add(1);
            if next >= N { 0 } else { next }
        };
        let generation = inner.buffer[ndx].generation.wrapping_add(1);
        inner.buffer[ndx] = Entry { payload, count: 1, generation };
        inner.last = Some(ndx);
    }

    /// Returns a copy of the most recently recorded entry, if any.
    #[must_use]
    pub fn last(&self) -> Option<Entry<T>> {
        let inner = self.inner.lock();
        inner.last.map(|i| inner.buffer[i])
    }

    /// Copies out every live entry, oldest first. Intended for tests and
    /// diagnostic dumps, not the hot path.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Entry<T>>
    where
        T: Default,
    {
        let inner = self.inner.lock();
        let Some(last) = inner.last else { return Vec::new() };
        let mut out = Vec::with_capacity(N);
        let mut i = (last + 1) % N;
        loop {
            if inner.buffer[i].generation != 0 {
                out.push(inner.buffer[i]);
            }
            if i == last {
                break;
            }
            i = (i + 1) % N;
        }
        out
    }
}

/// Declares a named, statically-allocated [`Ringbuf`].
///
/// ```
/// prs_ringbuf::ringbuf!(MY_EVENTS, u32, 8, 0);
/// ```
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $default:expr) => {
        static $name: $crate::Ringbuf<$t, $n> = $crate::Ringbuf::new($default);
    };
}

/// Records an entry in a ringbuf declared with [`ringbuf!`].
#[macro_export]
macro_rules! ringbuf_entry {
    ($name:expr, $payload:expr) => {
        $name.record($payload)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    ringbuf!(TEST_EVENTS, u32, 4, 0);

    #[test]
    fn records_and_reads_back_last_entry() {
        TEST_EVENTS.record(1);
        TEST_EVENTS.record(2);
        assert_eq!(TEST_EVENTS.last().unwrap().payload, 2);
    }

    #[test]
    fn deduplicates_consecutive_identical_payloads() {
        let rb: Ringbuf<u32, 4> = Ringbuf::new(0);
        rb.record(7);
        rb.record(7);
        rb.record(7);
        let last = rb.last().unwrap();
        assert_eq!(last.payload, 7);
        assert_eq!(last.count, 3);
    }

    #[test]
    fn wraps_at_capacity() {
        let rb: Ringbuf<u32, 2> = Ringbuf::new(0);
        rb.record(1);
        rb.record(2);
        rb.record(3);
        let snap = rb.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.iter().map(|e| e.payload).collect::<Vec<_>>(), vec![2, 3]);
    }
}
