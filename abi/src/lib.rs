// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire types shared between the runtime core and hosted tasks.
//!
//! Nothing in this crate owns a lock or an allocation; it exists purely to
//! give names and invariants to the bit patterns that flow across the
//! directory / scheduler / worker boundaries in `prs-runtime`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of bits of an [`ObjectId`] used for the slot index, rather than the
/// generation. The remaining high bits are the generation.
pub const OBJECT_INDEX_BITS: u32 = 20;

/// Identifies a live (or once-live) entry in a directory (GOD, PD, or Pool).
///
/// An `ObjectId` combines a slot index (predictable at allocation time) with a
/// generation number. The generation is bumped every time the slot is
/// recycled, so a stale id captured before a `free`/`unlock_dest` can never
/// resolve to the entry that replaced it — `lock` on a stale id simply
/// returns `None`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// Reserved value meaning "no object" / "invalid id".
    pub const INVALID: Self = Self(u32::MAX);

    pub const INDEX_BITS: u32 = OBJECT_INDEX_BITS;
    pub const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;

    #[must_use]
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        Self((index as u32 & Self::INDEX_MASK) | ((gen.0 as u32) << Self::INDEX_BITS))
    }

    #[must_use]
    pub fn index(self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    #[must_use]
    pub fn generation(self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u16 & Generation::MASK)
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "ObjectId(invalid)")
        } else {
            write!(f, "ObjectId(index={}, gen={})", self.index(), self.generation().0)
        }
    }
}

/// Generation counter embedded in both an [`ObjectId`] and its slot's
/// [`SlotHeader`]. Advanced by one every time a slot is recycled; wraps on
/// overflow, which is harmless because a full wrap requires 2^12 recycles of
/// the exact same slot between the old id going stale and being checked.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default, Debug)]
pub struct Generation(pub u16);

impl Generation {
    pub const BITS: u32 = 32 - OBJECT_INDEX_BITS;
    pub const MASK: u16 = ((1u32 << Self::BITS) - 1) as u16;
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1) & Self::MASK)
    }
}

/// Packed, atomics-friendly representation of a directory slot header:
/// `{used: bool, delete_mark: bool, reserved: 2 bits, refcnt: 12 bits,
/// generation: matches `Generation::BITS`}`.
///
/// This is the *value* type; `prs-runtime::directory` is responsible for
/// wrapping it in an `AtomicU32` and performing the CAS protocol described by
/// the object directory invariants.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SlotHeader {
    pub used: bool,
    pub delete_mark: bool,
    pub refcnt: u16,
    pub generation: Generation,
}

impl SlotHeader {
    pub const REFCNT_BITS: u32 = 12;
    pub const REFCNT_MAX: u16 = (1 << Self::REFCNT_BITS) - 1;

    const USED_SHIFT: u32 = 0;
    const DELETE_SHIFT: u32 = 1;
    const REFCNT_SHIFT: u32 = 4;
    const GEN_SHIFT: u32 = 4 + Self::REFCNT_BITS;

    #[must_use]
    pub const fn empty() -> Self {
        Self { used: false, delete_mark: false, refcnt: 0, generation: Generation::ZERO }
    }

    #[must_use]
    pub fn to_bits(self) -> u32 {
        (self.used as u32) << Self::USED_SHIFT
            | (self.delete_mark as u32) << Self::DELETE_SHIFT
            | (self.refcnt as u32 & SlotHeader::REFCNT_MAX as u32) << Self::REFCNT_SHIFT
            | (self.generation.0 as u32) << Self::GEN_SHIFT
    }

    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self {
            used: (bits >> Self::USED_SHIFT) & 1 != 0,
            delete_mark: (bits >> Self::DELETE_SHIFT) & 1 != 0,
            refcnt: ((bits >> Self::REFCNT_SHIFT) & SlotHeader::REFCNT_MAX as u32) as u16,
            generation: Generation(((bits >> Self::GEN_SHIFT) & Generation::MASK as u32) as u16),
        }
    }
}

/// Priority of a task. Numerically lower is *more* important, matching the
/// teacher's convention so priority 0 preempts everything.
///
/// Deliberately does not implement `PartialOrd`/`Ord` so call sites can't
/// confuse "greater" with "more important" — use
/// [`Priority::is_more_important_than`].
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const LEVELS: u8 = 32;
    pub const HIGHEST: Self = Self(0);
    pub const LOWEST: Self = Self(Self::LEVELS - 1);

    #[must_use]
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Internal result code returned by every directory / scheduler / worker
/// operation. Callers propagate these upward; the public API converts them
/// into [`crate::PrsError`] at the boundary.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ResultCode {
    Ok,
    Unknown,
    NotImplemented,
    OutOfMemory,
    PlatformError,
    InvalidState,
    NotFound,
    AlreadyExists,
    Empty,
    Locked,
    Timeout,
}

impl ResultCode {
    #[must_use]
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// User-visible severity bucket for a runtime-detected fault (§7).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorSeverity {
    /// Log a record, keep running.
    Continue,
    /// Destroy the current task; scheduler picks another.
    KillTask,
    /// Log, run graceful teardown, exit the process.
    Fatal,
}

/// Taxonomy of runtime-detected faults (§7), raised by the exception
/// mechanism layered on the platform's own signal/SEH delivery.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ExceptionKind {
    Unknown,
    Assert,
    User,
    Pr,
    Os,
    StackOverflow,
    SegmentationFault,
    IllegalInstruction,
    Integer,
    FloatingPoint,
    Bus,
    UserInterrupt,
}

/// The cause recorded in a task's [`StateToken`] the last time it was
/// unblocked. Distinguishes, e.g., "a message arrived" from "my timer
/// expired" without the receiver having to re-inspect the queue.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum UnblockCause {
    None = 0,
    Send = 1,
    Signal = 2,
    Timeout = 3,
    Notification = 4,
    Interrupt = 5,
}

impl UnblockCause {
    #[must_use]
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Send,
            2 => Self::Signal,
            3 => Self::Timeout,
            4 => Self::Notification,
            5 => Self::Interrupt,
            _ => Self::None,
        }
    }
}

/// Lifecycle state of a [`crate::TaskId`]-addressed task (§3 "Task").
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum TaskLifecycle {
    Stopped = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Zombie = 4,
}

impl TaskLifecycle {
    #[must_use]
    pub fn from_u8(v: u8) -> Self {
        match v & 0b111 {
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Zombie,
            _ => Self::Stopped,
        }
    }
}

/// 32-bit message id layout: `[class: 8 | service: 8 | id: 16]` (§6).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct MessageId(pub u32);

impl MessageId {
    pub const CLASS_USER: u8 = 0;
    pub const CLASS_PR_INTERNAL: u8 = 176;

    pub const SERVICE_PROCESS: u8 = 1;
    pub const SERVICE_TEST: u8 = 2;

    #[must_use]
    pub const fn new(class: u8, service: u8, id: u16) -> Self {
        Self((class as u32) << 24 | (service as u32) << 16 | id as u32)
    }

    #[must_use]
    pub fn class(self) -> u8 {
        (self.0 >> 24) as u8
    }

    #[must_use]
    pub fn service(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[must_use]
    pub fn id(self) -> u16 {
        self.0 as u16
    }

    #[must_use]
    pub fn is_internal(self) -> bool {
        self.class() == Self::CLASS_PR_INTERNAL
    }
}

bitflags::bitflags! {
    /// Worker flags (§3 "Worker flags"), combined into one atomic word.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct WorkerFlags: u32 {
        const INTERRUPTIBLE     = 1 << 0;
        const INTERRUPT_PENDING = 1 << 1;
        const IDLE              = 1 << 2;
        const STOP               = 1 << 3;
    }
}

/// Maximum filter arity accepted by `msg_recv_filter` (§6: "filter array is
/// `[count, id1, id2, ...]` with count <= 16").
pub const MAX_FILTER_IDS: usize = 16;

/// Maximum task name length in bytes (§6 task creation parameters).
pub const MAX_TASK_NAME: usize = 31;

/// Which ready-set policy a scheduler was created with (§4.10, §6
/// "Scheduler creation parameters"). Carried in [`SchedulerParams`]-shaped
/// config so `runtime::config` can select a policy from a TOML file without
/// the config crate depending on `prs-runtime`'s scheduler types directly.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    #[default]
    Cooperative,
    Priority,
}

/// Severity bucket for a `log()` record (§4.14 of `SPEC_FULL.md`). Mirrors
/// the subset of `log::Level` the runtime actually emits; kept as its own
/// type so `prs-abi` doesn't have to depend on the `log` crate.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_round_trips_index_and_generation() {
        let id = ObjectId::for_index_and_gen(12345, Generation(7));
        assert_eq!(id.index(), 12345);
        assert_eq!(id.generation(), Generation(7));
    }

    #[test]
    fn generation_wraps_within_its_bit_width() {
        let mut g = Generation(Generation::MASK);
        g = g.next();
        assert_eq!(g, Generation::ZERO);
    }

    #[test]
    fn slot_header_round_trips_through_bits() {
        let h = SlotHeader { used: true, delete_mark: false, refcnt: 3, generation: Generation(42) };
        let back = SlotHeader::from_bits(h.to_bits());
        assert_eq!(h, back);
    }

    #[test]
    fn slot_header_refcnt_is_capped_at_twelve_bits() {
        let h = SlotHeader { used: true, delete_mark: true, refcnt: SlotHeader::REFCNT_MAX, generation: Generation(1) };
        let back = SlotHeader::from_bits(h.to_bits());
        assert_eq!(back.refcnt, SlotHeader::REFCNT_MAX);
    }

    #[test]
    fn priority_ordering_is_inverted_from_numeric_value() {
        assert!(Priority(0).is_more_important_than(Priority(1)));
        assert!(!Priority(5).is_more_important_than(Priority(5)));
    }

    #[test]
    fn message_id_layout_matches_spec_bit_widths() {
        let id = MessageId::new(MessageId::CLASS_PR_INTERNAL, MessageId::SERVICE_PROCESS, 0x00A5);
        assert_eq!(id.class(), MessageId::CLASS_PR_INTERNAL);
        assert_eq!(id.service(), MessageId::SERVICE_PROCESS);
        assert_eq!(id.id(), 0x00A5);
        assert!(id.is_internal());
    }
}
