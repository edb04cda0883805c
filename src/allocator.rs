//! Block allocator over a single contiguous arena of slots.
//!
//! Blocks tile the arena exactly: walking headers from slot zero visits every
//! block once. Free blocks are also kept in an address-ordered index so lookup
//! and coalescing do not need a full walk. No two free blocks are ever
//! adjacent.

use std::collections::BTreeMap;

use crate::core::{Header, ObjectKind, Slot};
use crate::error::{HeapError, HeapResult};
use crate::value::{Addr, Value};

pub struct Arena {
    slots: Vec<Slot>,
    /// Free block start -> span.
    free: BTreeMap<u32, u32>,
    /// Rotating first-fit cursor.
    cursor: u32,
    min_block: u32,
    /// Blocks destroyed by an explicit free since the last collection, keyed
    /// by address, with the epoch the free happened in.
    freed: BTreeMap<u32, u32>,
    /// Oldest epoch whose references are still current.
    epoch_base: u32,
}

impl Arena {
    pub fn new(total_slots: usize, min_block: u32) -> Self {
        let mut slots = vec![Slot::Empty; total_slots];
        slots[0] = Slot::Header(Header::free(total_slots as u32));
        let mut free = BTreeMap::new();
        free.insert(0, total_slots as u32);
        Self {
            slots,
            free,
            cursor: 0,
            min_block,
            freed: BTreeMap::new(),
            epoch_base: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn min_block(&self) -> u32 {
        self.min_block
    }

    pub fn contains(&self, addr: Addr) -> bool {
        addr.index() < self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut Slot {
        &mut self.slots[index]
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }

    pub fn header(&self, addr: Addr) -> Option<&Header> {
        match self.slots.get(addr.index()) {
            Some(Slot::Header(h)) => Some(h),
            _ => None,
        }
    }

    pub fn header_mut(&mut self, addr: Addr) -> Option<&mut Header> {
        match self.slots.get_mut(addr.index()) {
            Some(Slot::Header(h)) => Some(h),
            _ => None,
        }
    }

    /// Span of the block starting at `addr`, validated against the arena end.
    pub fn span(&self, addr: Addr) -> HeapResult<u32> {
        let span = self.slots[addr.index()].block_span().ok_or_else(|| {
            HeapError::HeapCorruption(format!("no block header at {addr}"))
        })?;
        if span == 0 || addr.index() + span as usize > self.slots.len() {
            return Err(HeapError::HeapCorruption(format!(
                "block at {addr} has span {span} outside the arena"
            )));
        }
        Ok(span)
    }

    pub fn epoch_base(&self) -> u32 {
        self.epoch_base
    }

    /// Whether `epoch` lies between the epoch base and `now`.
    pub fn is_current(&self, epoch: u32, now: u32) -> bool {
        epoch.wrapping_sub(self.epoch_base) <= now.wrapping_sub(self.epoch_base)
    }

    /// Records an explicit free of the block at `addr` in `epoch`. References
    /// issued earlier resolve as dangling until the next collection, even once
    /// the address is reused.
    pub(crate) fn note_freed(&mut self, addr: Addr, epoch: u32) {
        self.freed.insert(addr.0, epoch);
    }

    pub fn has_freed(&self) -> bool {
        !self.freed.is_empty()
    }

    /// Starts a new reference epoch after a collection has rewritten every
    /// stored reference.
    pub(crate) fn start_epoch(&mut self, epoch: u32) {
        self.epoch_base = epoch;
        self.freed.clear();
    }

    fn freed_before(&self, addr: Addr, epoch: u32) -> bool {
        self.freed.get(&addr.0).is_some_and(|&freed_at| {
            epoch.wrapping_sub(self.epoch_base) < freed_at.wrapping_sub(self.epoch_base)
        })
    }

    /// Whether `addr` falls inside a block of the free index.
    fn in_free_block(&self, addr: Addr) -> bool {
        self.free
            .range(..=addr.0)
            .next_back()
            .is_some_and(|(&start, &span)| addr.0 < start + span)
    }

    /// Follows forwarding stubs from `value`. Chains are bounded by the number
    /// of slots; a longer chain can only be a cycle.
    pub fn chase(&self, mut value: Value) -> HeapResult<Chased> {
        for _ in 0..=self.slots.len() {
            let Value::Ref(r) = value else {
                return Ok(Chased::Immediate(value));
            };
            if self.freed_before(r.addr, r.epoch) {
                return Ok(Chased::Dangling(r.addr));
            }
            match self.slots.get(r.addr.index()) {
                Some(Slot::Header(h)) if h.is_free() => return Ok(Chased::Dangling(r.addr)),
                Some(Slot::Header(_)) => return Ok(Chased::Object(r.addr)),
                Some(Slot::Forward(f)) => value = f.target,
                Some(_) if self.in_free_block(r.addr) => return Ok(Chased::Dangling(r.addr)),
                Some(_) => {
                    return Err(HeapError::HeapCorruption(format!(
                        "reference to {} does not point at a block",
                        r.addr
                    )))
                }
                None => return Ok(Chased::Dangling(r.addr)),
            }
        }
        Err(HeapError::HeapCorruption("cyclic forwarding chain".into()))
    }

    /// Iterates block starts in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            arena: self,
            next: 0,
        }
    }

    pub fn free_blocks(&self) -> impl Iterator<Item = (Addr, u32)> + '_ {
        self.free.iter().map(|(&start, &span)| (Addr(start), span))
    }

    pub fn free_slots(&self) -> usize {
        self.free.values().map(|&s| s as usize).sum()
    }

    pub fn largest_free(&self) -> u32 {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// First fit from the rotating cursor, wrapping once.
    fn find_fit(&self, slots: u32) -> Option<u32> {
        let cursor = self.cursor;
        self.free
            .range(cursor..)
            .chain(self.free.range(..cursor))
            .find(|(_, &span)| span >= slots)
            .map(|(&start, _)| start)
    }

    /// Carves a block of at least `slots` out of free space. The payload is
    /// left zeroed (`Slot::Empty`). Returns `None` when nothing fits.
    pub fn allocate(&mut self, slots: u32, kind: ObjectKind, length: u32) -> Option<Addr> {
        debug_assert!(kind != ObjectKind::Free);
        let slots = slots.max(self.min_block);
        let start = self.find_fit(slots)?;
        let span = self.free.remove(&start)?;
        let used = self.split(start, span, slots);
        self.slots[start as usize] = Slot::Header(Header::new(kind, used, length));
        self.clear(start + 1, used - 1);
        self.cursor = start + used;
        if self.cursor as usize >= self.slots.len() {
            self.cursor = 0;
        }
        tracing::trace!(addr = start, slots = used, kind = kind.name(), "allocated block");
        Some(Addr(start))
    }

    /// Splits `span` at `start` keeping `wanted` slots; a remainder below the
    /// minimum block size is absorbed. Returns the span kept.
    fn split(&mut self, start: u32, span: u32, wanted: u32) -> u32 {
        let rest = span - wanted;
        if rest >= self.min_block {
            let tail = start + wanted;
            self.write_free(tail, rest);
            self.free.insert(tail, rest);
            wanted
        } else {
            span
        }
    }

    pub(crate) fn write_free(&mut self, start: u32, span: u32) {
        self.slots[start as usize] = Slot::Header(Header::free(span));
        self.clear(start + 1, span - 1);
    }

    pub(crate) fn clear(&mut self, start: u32, count: u32) {
        let start = start as usize;
        self.slots[start..start + count as usize].fill(Slot::Empty);
    }

    /// Returns a block to free space, coalescing with both neighbours.
    pub fn release(&mut self, addr: Addr) -> HeapResult<()> {
        let mut start = addr.0;
        let mut span = self.span(addr)?;
        if self.free.contains_key(&start) {
            return Err(HeapError::HeapCorruption(format!(
                "double release of block at {addr}"
            )));
        }
        let next = start + span;
        if let Some(next_span) = self.free.remove(&next) {
            span += next_span;
        }
        if let Some((&prev, &prev_span)) = self.free.range(..start).next_back() {
            if prev + prev_span == start {
                self.free.remove(&prev);
                start = prev;
                span += prev_span;
            }
        }
        self.write_free(start, span);
        self.free.insert(start, span);
        if self.cursor > start && self.cursor < start + span {
            self.cursor = start;
        }
        Ok(())
    }

    /// Grows a block into the free block that follows it. Returns `false`
    /// (and changes nothing) when the trailing free space is too small.
    pub fn grow_in_place(&mut self, addr: Addr, new_slots: u32) -> HeapResult<bool> {
        let span = self.span(addr)?;
        if new_slots <= span {
            return Ok(true);
        }
        let next = addr.0 + span;
        let Some(&next_span) = self.free.get(&next) else {
            return Ok(false);
        };
        if span + next_span < new_slots {
            return Ok(false);
        }
        self.free.remove(&next);
        let used = self.split(addr.0, span + next_span, new_slots);
        self.clear(next, used - span);
        self.set_span(addr, used);
        Ok(true)
    }

    /// Shrinks a block, splitting the tail off as free space when it is at
    /// least a minimum block. Returns the span kept.
    pub fn shrink(&mut self, addr: Addr, new_slots: u32) -> HeapResult<u32> {
        let span = self.span(addr)?;
        let new_slots = new_slots.max(self.min_block);
        if new_slots >= span || span - new_slots < self.min_block {
            return Ok(span);
        }
        self.set_span(addr, new_slots);
        let tail = addr.offset(new_slots);
        self.slots[tail.index()] = Slot::Header(Header::free(span - new_slots));
        self.release(tail)?;
        Ok(new_slots)
    }

    fn set_span(&mut self, addr: Addr, span: u32) {
        match &mut self.slots[addr.index()] {
            Slot::Header(h) => h.slots = span,
            Slot::Forward(f) => f.slots = span,
            _ => {}
        }
    }

    /// Rebuilds the free index from the block headers, merging adjacent free
    /// blocks. Used after compaction rewrites the arena wholesale.
    pub(crate) fn rebuild_free_index(&mut self) -> HeapResult<()> {
        self.free.clear();
        let mut addr = 0u32;
        let mut run: Option<(u32, u32)> = None;
        while (addr as usize) < self.slots.len() {
            let span = self.span(Addr(addr))?;
            let is_free = matches!(self.slots[addr as usize], Slot::Header(h) if h.is_free());
            run = match (run, is_free) {
                (Some((start, len)), true) => Some((start, len + span)),
                (None, true) => Some((addr, span)),
                (Some((start, len)), false) => {
                    self.write_free(start, len);
                    self.free.insert(start, len);
                    None
                }
                (None, false) => None,
            };
            addr += span;
        }
        if let Some((start, len)) = run {
            self.write_free(start, len);
            self.free.insert(start, len);
        }
        self.cursor = 0;
        Ok(())
    }
}

/// Where a reference ends up after following forwarding stubs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Chased {
    Object(Addr),
    /// Non-reference value, or a stub chain ending in a tombstone.
    Immediate(Value),
    /// Points at free space or outside the arena.
    Dangling(Addr),
}

pub struct Blocks<'a> {
    arena: &'a Arena,
    next: usize,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = HeapResult<(Addr, &'a Slot)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.arena.len() {
            return None;
        }
        let addr = Addr(self.next as u32);
        match self.arena.span(addr) {
            Ok(span) => {
                self.next += span as usize;
                Some(Ok((addr, self.arena.slot(addr.index()))))
            }
            Err(e) => {
                self.next = self.arena.len();
                Some(Err(e))
            }
        }
    }
}
