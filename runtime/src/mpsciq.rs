//! MPSC intrusive queue with a lazily-built reverse chain (§4.4 "mpsciq").
//!
//! Any number of producer threads may `push`; exactly one consumer thread
//! may `pop_front`, `remove`, or `iter`. Producers prepend onto a Treiber
//! stack (`head`, CAS'd); the single consumer periodically reverses the
//! newest unprocessed segment of that stack into a doubly-linked chain so it
//! can pop in FIFO order and remove an arbitrary node in O(1) once that
//! node's `prev` link exists. This is the workhorse behind ready queues,
//! message queues, and the timer wheel's per-slot and pending lists.

use std::sync::atomic::{AtomicU32, Ordering};

use abi::{ObjectId, ResultCode};

use crate::directory::Directory;

struct Node<T> {
    /// Set once at push time: the node that was `head` just before this one
    /// was pushed, i.e. this node's predecessor in push order. Immutable
    /// after construction, so reading it needs no synchronization beyond the
    /// directory's own lock/unlock protocol. `remove` also uses this to find
    /// the node whose `next_older` has to be spliced around a removed node.
    next_newer: AtomicU32,
    /// Built lazily by the consumer: once this node has been folded into the
    /// FIFO chain, the node that follows it in pop order (the next-newer
    /// node toward `head`). `ObjectId::INVALID` means "not yet linked" or
    /// "this is the newest known node".
    next_older: AtomicU32,
    value: T,
}

/// An MPSC intrusive queue of `T`, backed by its own fixed-capacity node
/// directory.
pub struct Mpsciq<T> {
    nodes: Directory<Node<T>>,
    head: AtomicU32,
    /// Frontier of the already-linked FIFO segment: the newest node whose
    /// `next_older` pointer is known-good. `INVALID` until the first
    /// `ensure_linked` call.
    anchor: AtomicU32,
    /// Oldest node in the already-linked FIFO segment — the next one
    /// `pop_front` will return. `INVALID` when the linked segment is empty.
    tail: AtomicU32,
}

impl<T> Mpsciq<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Directory::new(capacity),
            head: AtomicU32::new(ObjectId::INVALID.0),
            anchor: AtomicU32::new(ObjectId::INVALID.0),
            tail: AtomicU32::new(ObjectId::INVALID.0),
        }
    }

    /// Pushes `value`, returning the id it was stored under (callers that
    /// need to `remove` a specific in-flight entry, such as cancelling a
    /// queued timer, hang onto this id).
    pub fn push(&self, value: T) -> Result<ObjectId, ResultCode> {
        let id = self.nodes.alloc_and_lock(Node {
            next_newer: AtomicU32::new(ObjectId::INVALID.0),
            next_older: AtomicU32::new(ObjectId::INVALID.0),
            value,
        })?;
        // The allocation above already holds one reference on behalf of the
        // queue itself (released by `remove`/`pop_front`); we don't need an
        // extra guard here, so let the one `alloc_and_lock` returned expire.
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            if let Some(g) = self.nodes.lock(id) {
                g.next_newer.store(old_head, Ordering::Relaxed);
            }
            if self.head.compare_exchange_weak(old_head, id.0, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                break;
            }
        }
        Ok(id)
    }

    /// Walks any newly-pushed nodes (those between the current `head` and
    /// the previous `anchor`) and links them onto the FIFO chain. Must only
    /// be called by the single consumer.
    fn ensure_linked(&self) {
        let head = ObjectId(self.head.load(Ordering::Acquire));
        let anchor = ObjectId(self.anchor.load(Ordering::Relaxed));
        if !head.is_valid() || head == anchor {
            return;
        }
        let mut chain = Vec::new();
        let mut cur = head;
        loop {
            chain.push(cur);
            let Some(g) = self.nodes.lock(cur) else { break };
            let newer_side_next = ObjectId(g.next_newer.load(Ordering::Relaxed));
            drop(g);
            if newer_side_next == anchor || !newer_side_next.is_valid() {
                if !newer_side_next.is_valid() {
                    self.tail.store(cur.0, Ordering::Relaxed);
                }
                break;
            }
            cur = newer_side_next;
        }
        // `chain` runs newest..oldest. `tail`/`pop_front` walk the other way
        // (oldest toward newest), so each node's `next_older` must point to
        // its *next-newer* neighbor in this run: for each adjacent pair the
        // older one (`pair[1]`) gets its `next_older` set to the newer one
        // (`pair[0]`), not the other way around.
        for pair in chain.windows(2) {
            if let Some(g) = self.nodes.lock(pair[1]) {
                g.next_older.store(pair[0].0, Ordering::Relaxed);
            }
        }
        // Splice this run onto whatever was already linked: the previous
        // anchor was the newest node of the prior run, which is popped
        // immediately before the oldest node discovered just now.
        if let Some(&oldest_new) = chain.last() {
            if anchor.is_valid() {
                if let Some(g) = self.nodes.lock(anchor) {
                    g.next_older.store(oldest_new.0, Ordering::Relaxed);
                }
            }
        }
        self.anchor.store(head.0, Ordering::Relaxed);
        if ObjectId(self.tail.load(Ordering::Relaxed)) == ObjectId::INVALID {
            if let Some(&last) = chain.last() {
                self.tail.store(last.0, Ordering::Relaxed);
            }
        }
    }

    /// Removes and returns the oldest queued value, if any.
    pub fn pop_front(&self) -> Option<(ObjectId, T)>
    where
        T: Copy,
    {
        self.ensure_linked();
        let tail = ObjectId(self.tail.load(Ordering::Relaxed));
        if !tail.is_valid() {
            return None;
        }
        self.remove(tail).map(|v| (tail, v))
    }

    /// Removes `id` from the queue in O(1) once it has been folded into the
    /// FIFO chain (running `ensure_linked` first guarantees that for any id
    /// currently in the queue).
    pub fn remove(&self, id: ObjectId) -> Option<T>
    where
        T: Copy,
    {
        self.ensure_linked();
        let guard = self.nodes.lock(id)?;
        let value = guard.value;
        // The node that follows `id` in pop order (oldest toward newest).
        let newer = ObjectId(guard.next_older.load(Ordering::Relaxed));
        // `next_newer` is immutable since `push` and always names the node
        // pushed immediately before `id` — exactly the node whose
        // `next_older` currently points at `id`, i.e. `id`'s predecessor in
        // the FIFO chain. Removing a non-tail node has to splice that
        // predecessor straight to `newer`, the same way any singly-linked
        // list removal skips the removed link.
        let predecessor = ObjectId(guard.next_newer.load(Ordering::Relaxed));
        drop(guard);
        if ObjectId(self.tail.load(Ordering::Relaxed)) == id {
            self.tail.store(newer.0, Ordering::Relaxed);
        } else if let Some(pred) = self.nodes.lock(predecessor) {
            pred.next_older.store(newer.0, Ordering::Relaxed);
        }
        // Dropping the queue's allocation reference frees the node (refcount
        // was exactly 1, held by the queue itself since `push`).
        self.nodes.unlock(id);
        Some(value)
    }

    /// Iterates the queue from oldest to newest, without consuming. Building
    /// the FIFO chain first (`ensure_linked`) means this never exposes
    /// not-yet-linked nodes out of order.
    pub fn iter(&self) -> MpsciqIter<'_, T>
    where
        T: Copy,
    {
        self.ensure_linked();
        MpsciqIter { queue: self, cur: ObjectId(self.tail.load(Ordering::Relaxed)) }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        ObjectId(self.head.load(Ordering::Acquire)) == ObjectId::INVALID
    }
}

pub struct MpsciqIter<'a, T> {
    queue: &'a Mpsciq<T>,
    cur: ObjectId,
}

impl<'a, T: Copy> Iterator for MpsciqIter<'a, T> {
    type Item = (ObjectId, T);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.cur.is_valid() {
            return None;
        }
        let id = self.cur;
        let guard = self.queue.nodes.lock(id)?;
        let value = guard.value;
        self.cur = ObjectId(guard.next_older.load(Ordering::Relaxed));
        Some((id, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved_across_pushes_and_pops() {
        let q: Mpsciq<u32> = Mpsciq::new(8);
        for v in 0..4 {
            q.push(v).unwrap();
        }
        let mut out = Vec::new();
        while let Some((_, v)) = q.pop_front() {
            out.push(v);
        }
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[test]
    fn remove_from_the_middle_skips_that_entry() {
        let q: Mpsciq<u32> = Mpsciq::new(8);
        let ids: Vec<_> = (0..4).map(|v| q.push(v).unwrap()).collect();
        q.remove(ids[1]);
        let mut out = Vec::new();
        while let Some((_, v)) = q.pop_front() {
            out.push(v);
        }
        assert_eq!(out, vec![0, 2, 3]);
    }

    #[test]
    fn interleaved_push_and_drain_stays_fifo() {
        let q: Mpsciq<u32> = Mpsciq::new(8);
        q.push(0).unwrap();
        q.push(1).unwrap();
        assert_eq!(q.pop_front().map(|(_, v)| v), Some(0));
        q.push(2).unwrap();
        assert_eq!(q.pop_front().map(|(_, v)| v), Some(1));
        assert_eq!(q.pop_front().map(|(_, v)| v), Some(2));
        assert_eq!(q.pop_front(), None);
    }
}
