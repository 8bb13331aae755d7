//! MPMC queue over the directory (§4.4 "mpmcq").
//!
//! A Michael & Scott style queue: a sentinel head node that is never itself
//! a payload holder, a `tail` that may lag the true end of the chain by one
//! node (cooperatively advanced by whichever thread notices), and a
//! per-node `consumed` flag so that when multiple dequeuers race for the
//! same node, exactly one wins and the others fall through to the next
//! node instead of returning a duplicate or blocking. Used by the semaphore
//! wait queue (§4.8), where both enqueue (new waiters) and dequeue (a
//! signaler popping a waiter to wake) can happen concurrently from any
//! worker.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use abi::{ObjectId, ResultCode};

use crate::directory::Directory;

struct Node<T> {
    next: AtomicU32,
    consumed: AtomicBool,
    // Guarded by `consumed`: only the thread that wins the CAS on `consumed`
    // may `take()` this, and it does so exactly once.
    value: UnsafeCell<Option<T>>,
}

// Safety: `value` is only ever mutated by the single thread that wins the
// `consumed` CAS, and only after that win — see `Node::value`'s doc comment.
unsafe impl<T: Send> Sync for Node<T> {}

pub struct Mpmcq<T> {
    nodes: Directory<Node<T>>,
    head: AtomicU32,
    tail: AtomicU32,
    sentinel: ObjectId,
}

impl<T> Mpmcq<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let nodes = Directory::new(capacity + 1);
        let sentinel = nodes
            .alloc_and_lock(Node {
                next: AtomicU32::new(ObjectId::INVALID.0),
                consumed: AtomicBool::new(true),
                value: UnsafeCell::new(None),
            })
            .expect("capacity + 1 guarantees room for the sentinel");
        Self { nodes, head: AtomicU32::new(sentinel.0), tail: AtomicU32::new(sentinel.0), sentinel }
    }

    pub fn enqueue(&self, value: T) -> Result<(), ResultCode> {
        let id = self.nodes.alloc_and_lock(Node {
            next: AtomicU32::new(ObjectId::INVALID.0),
            consumed: AtomicBool::new(false),
            value: UnsafeCell::new(Some(value)),
        })?;
        loop {
            let tail = ObjectId(self.tail.load(Ordering::Acquire));
            let Some(tail_node) = self.nodes.lock(tail) else { continue };
            let next = ObjectId(tail_node.next.load(Ordering::Acquire));
            if !next.is_valid() {
                if tail_node.next.compare_exchange(ObjectId::INVALID.0, id.0, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                    drop(tail_node);
                    let _ = self.tail.compare_exchange(tail.0, id.0, Ordering::AcqRel, Ordering::Relaxed);
                    return Ok(());
                }
            } else {
                drop(tail_node);
                // Tail lagged behind the true end; help advance it before retrying.
                let _ = self.tail.compare_exchange(tail.0, next.0, Ordering::AcqRel, Ordering::Relaxed);
            }
        }
    }

    /// Pops the oldest value whose `consumed` flag this call wins the race
    /// to set. Returns `None` once the queue is observed empty.
    pub fn dequeue(&self) -> Option<T>
    where
        T: Send,
    {
        loop {
            let head = ObjectId(self.head.load(Ordering::Acquire));
            let head_node = self.nodes.lock(head)?;
            let next = ObjectId(head_node.next.load(Ordering::Acquire));
            if !next.is_valid() {
                return None;
            }
            let next_node = self.nodes.lock(next)?;
            if next_node.consumed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                drop(next_node);
                drop(head_node);
                if self.head.compare_exchange(head.0, next.0, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                    if head != self.sentinel {
                        self.nodes.unlock(head);
                    }
                }
                // Re-lock to extract the value now that we've won it. Taking
                // it is sound: the `consumed` CAS above is the single point
                // of arbitration, so no other thread may touch `value`.
                let value = self.nodes.lock(next).and_then(|g| unsafe { (*g.value.get()).take() });
                return value;
            }
            // Lost the race for `next`; another dequeuer claimed it. Try to
            // help advance `head` past it and retry from the new head.
            drop(next_node);
            drop(head_node);
            let _ = self.head.compare_exchange(head.0, next.0, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let head = ObjectId(self.head.load(Ordering::Acquire));
        self.nodes.lock(head).is_some_and(|n| !ObjectId(n.next.load(Ordering::Acquire)).is_valid())
    }
}
