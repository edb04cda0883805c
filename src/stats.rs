//! Heap statistics and block dumps.
//!
//! Everything here is read-only apart from [`Heap::dump_after_collect`],
//! which forces a collection first.

use std::fmt;
use std::time::Duration;

use crate::core::{ObjectFlags, ObjectKind, Slot, BYTES_PER_SLOT};
use crate::error::HeapResult;
use crate::heap::Heap;
use crate::value::Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBounds {
    pub start: Addr,
    /// One past the last slot.
    pub end: Addr,
    pub slots: usize,
    pub bytes: usize,
}

/// Snapshot of arena occupancy.
///
/// # Examples
///
/// ```
/// use frameheap::{Heap, HeapConfig, Value};
///
/// let mut heap = Heap::new(HeapConfig::with_arena_slots(128)).unwrap();
/// heap.allocate_array(Value::Nil, 6).unwrap();
/// let stats = heap.stats();
/// assert_eq!(stats.used_slots, 8);
/// assert_eq!(stats.free_slots, 120);
/// assert_eq!(stats.largest_free, 120);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub total_slots: usize,
    pub free_slots: usize,
    pub largest_free: usize,
    pub used_slots: usize,
    pub free_blocks: usize,
    pub live_blocks: usize,
    pub forwarding_stubs: usize,
    pub collections: u64,
    pub epoch: u32,
}

/// Outcome of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionStats {
    /// Epoch in force after the collection.
    pub epoch: u32,
    pub live_objects: usize,
    pub live_slots: usize,
    pub reclaimed_slots: usize,
    pub moved_objects: usize,
    pub weak_slots_cleared: usize,
    pub declawed_refs: usize,
    pub indirect_deleted: usize,
    pub duration: Duration,
}

/// One line of a heap dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: Addr,
    /// `None` for a forwarding stub.
    pub kind: Option<ObjectKind>,
    pub slots: u32,
    pub length: u32,
    pub flags: ObjectFlags,
}

impl BlockInfo {
    pub fn is_free(&self) -> bool {
        self.kind == Some(ObjectKind::Free)
    }

    pub fn is_forwarding(&self) -> bool {
        self.kind.is_none()
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind.map_or("forward", ObjectKind::name);
        write!(f, "{} {:<15} slots={:<6} len={}", self.addr, kind, self.slots, self.length)?;
        for (name, flag) in [
            ("LOCKED", ObjectFlags::LOCKED),
            ("READ_ONLY", ObjectFlags::READ_ONLY),
            ("DIRTY", ObjectFlags::DIRTY),
            ("MARKED", ObjectFlags::MARKED),
        ] {
            if self.flags.contains(flag) {
                write!(f, " {name}")?;
            }
        }
        Ok(())
    }
}

impl Heap {
    pub fn bounds(&self) -> HeapBounds {
        let slots = self.arena.len();
        HeapBounds {
            start: Addr(0),
            end: Addr(slots as u32),
            slots,
            bytes: slots * BYTES_PER_SLOT,
        }
    }

    pub fn stats(&self) -> HeapStats {
        let total_slots = self.arena.len();
        let free_slots = self.arena.free_slots();
        let mut stats = HeapStats {
            total_slots,
            free_slots,
            largest_free: self.arena.largest_free() as usize,
            used_slots: total_slots - free_slots,
            collections: self.collections,
            epoch: self.epoch,
            ..HeapStats::default()
        };
        for (_, slot) in self.arena.blocks().flatten() {
            match slot {
                Slot::Header(h) if h.is_free() => stats.free_blocks += 1,
                Slot::Header(_) => stats.live_blocks += 1,
                Slot::Forward(_) => stats.forwarding_stubs += 1,
                _ => {}
            }
        }
        stats
    }

    pub fn last_collection(&self) -> Option<&CollectionStats> {
        self.last_collection.as_ref()
    }

    /// Kind, span, length and flags of every block in address order.
    pub fn dump(&self) -> HeapResult<Vec<BlockInfo>> {
        self.check_poisoned()?;
        let mut blocks = Vec::new();
        for block in self.arena.blocks() {
            let (addr, slot) = block?;
            let info = match slot {
                Slot::Header(h) => BlockInfo {
                    addr,
                    kind: Some(h.kind),
                    slots: h.slots,
                    length: h.length,
                    flags: h.flags,
                },
                Slot::Forward(f) => BlockInfo {
                    addr,
                    kind: None,
                    slots: f.slots,
                    length: 0,
                    flags: ObjectFlags::empty(),
                },
                _ => continue,
            };
            blocks.push(info);
        }
        Ok(blocks)
    }

    pub fn dump_after_collect(&mut self) -> HeapResult<Vec<BlockInfo>> {
        self.collect()?;
        self.dump()
    }
}
