//! Sweep-compact: plan destinations, rewrite references, move blocks.
//!
//! The three passes run strictly in sequence. Planning only writes the
//! `relocation` field of live headers; rewriting only changes values in
//! place at their current (source) positions; moving is the only pass that
//! shifts blocks and lays out free space.

use crate::allocator::{Arena, Chased};
use crate::core::{
    Header, IndirectRecord, ObjectFlags, ObjectKind, Slot, CLASS_OFFSET, PAYLOAD_OFFSET,
};
use crate::declaw::{DeclawRegistry, ForeignStatus};
use crate::error::{HeapError, HeapResult};
use crate::heap::Heap;
use crate::value::{Addr, ForeignAddr, ObjRef, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Relocation {
    pub src: Addr,
    pub dest: Addr,
    /// Span before the move.
    pub slots: u32,
    /// Span after the move, including absorbed fragments.
    pub final_slots: u32,
}

#[derive(Debug, Default)]
pub(crate) struct Plan {
    /// Every live block, in source order.
    pub relocations: Vec<Relocation>,
    /// Free space after the move as `(start, span)`.
    pub free_regions: Vec<(u32, u32)>,
    /// Dead indirect binaries whose storage must be deleted.
    pub condemned: Vec<IndirectRecord>,
    pub reclaimed_slots: usize,
    pub moved_objects: usize,
}

impl Plan {
    /// Whether any block moves or dies. References stay valid otherwise.
    pub fn changes_layout(&self) -> bool {
        self.reclaimed_slots > 0 || self.moved_objects > 0
    }
}

/// A gap in front of a pinned block that later blocks can be packed into.
#[derive(Debug, Clone, Copy)]
struct Gap {
    start: u32,
    len: u32,
}

/// Computes a destination for every marked block.
pub(crate) fn plan(heap: &mut Heap) -> HeapResult<Plan> {
    let min_block = heap.config.min_block_slots;
    let capacity = heap.config.free_stack_capacity;
    let arena = &mut heap.arena;

    let mut plan = Plan::default();
    let mut banked: Vec<Gap> = Vec::with_capacity(capacity);
    let mut unassigned: Vec<Gap> = Vec::new();
    let mut free_ptr = 0u32;
    // Relocation whose destination currently ends at `free_ptr`.
    let mut tail_owner: Option<usize> = None;

    let mut addr = 0u32;
    while (addr as usize) < arena.len() {
        let src = Addr(addr);
        let span = arena.span(src)?;
        if span < min_block {
            return Err(HeapError::HeapCorruption(format!(
                "block at {src} spans {span} slots, below the minimum of {min_block}"
            )));
        }
        addr += span;

        let header = match *arena.slot(src.index()) {
            Slot::Header(h) => h,
            _ => {
                // Forwarding stubs are never marked.
                plan.reclaimed_slots += span as usize;
                continue;
            }
        };
        if header.is_free() {
            continue;
        }
        if !header.is_marked() {
            plan.reclaimed_slots += span as usize;
            if header.kind == ObjectKind::IndirectBinary {
                if let Slot::Indirect(record) = *arena.slot(src.index() + PAYLOAD_OFFSET as usize) {
                    plan.condemned.push(record);
                }
            }
            continue;
        }

        if header.is_locked() {
            let gap = src.0 - free_ptr;
            if gap > 0 && gap < min_block {
                let owner = tail_owner.ok_or_else(|| {
                    HeapError::HeapCorruption(format!("unowned {gap}-slot fragment before {src}"))
                })?;
                plan.relocations[owner].final_slots += gap;
            } else if gap > 0 {
                let gap = Gap {
                    start: free_ptr,
                    len: gap,
                };
                if banked.len() < capacity {
                    banked.push(gap);
                } else {
                    unassigned.push(gap);
                }
            }
            set_relocation(arena, src, src)?;
            tail_owner = Some(plan.relocations.len());
            plan.relocations.push(Relocation {
                src,
                dest: src,
                slots: span,
                final_slots: span,
            });
            free_ptr = src.0 + span;
            continue;
        }

        let mut relocation = Relocation {
            src,
            dest: Addr(free_ptr),
            slots: span,
            final_slots: span,
        };
        if let Some(index) = banked.iter().position(|g| g.len >= span) {
            let gap = &mut banked[index];
            relocation.dest = Addr(gap.start);
            let rest = gap.len - span;
            if rest < min_block {
                relocation.final_slots += rest;
                banked.remove(index);
            } else {
                gap.start += span;
                gap.len = rest;
            }
        } else {
            free_ptr += span;
            tail_owner = Some(plan.relocations.len());
        }
        if relocation.dest != src {
            plan.moved_objects += 1;
        }
        set_relocation(arena, src, relocation.dest)?;
        plan.relocations.push(relocation);
    }

    let end = arena.len() as u32;
    let tail = end - free_ptr;
    if tail > 0 && tail < min_block {
        let owner = tail_owner.ok_or_else(|| {
            HeapError::HeapCorruption(format!("unowned {tail}-slot fragment at the arena end"))
        })?;
        plan.relocations[owner].final_slots += tail;
    } else if tail > 0 {
        unassigned.push(Gap {
            start: free_ptr,
            len: tail,
        });
    }
    plan.free_regions = banked
        .into_iter()
        .chain(unassigned)
        .map(|g| (g.start, g.len))
        .collect();

    tracing::trace!(
        live = plan.relocations.len(),
        moved = plan.moved_objects,
        reclaimed = plan.reclaimed_slots,
        "compaction planned"
    );
    Ok(plan)
}

fn set_relocation(arena: &mut Arena, src: Addr, dest: Addr) -> HeapResult<()> {
    let header = arena
        .header_mut(src)
        .ok_or_else(|| HeapError::HeapCorruption(format!("no header at {src}")))?;
    header.relocation = dest.0;
    Ok(())
}

/// Maps old references to their post-move form.
struct Updater<'a> {
    declaw: &'a DeclawRegistry,
    epoch: u32,
    declawed: usize,
    fault: Option<HeapError>,
}

impl<'a> Updater<'a> {
    fn new(declaw: &'a DeclawRegistry, epoch: u32) -> Self {
        Self {
            declaw,
            epoch,
            declawed: 0,
            fault: None,
        }
    }

    fn break_foreign(&mut self, value: Value) -> Value {
        let checked = self.declaw.check(value);
        if checked.is_broken() && !value.is_broken() {
            self.declawed += 1;
        }
        checked
    }

    fn apply(&mut self, arena: &Arena, value: Value) -> Value {
        match value {
            Value::Foreign(_) => self.break_foreign(value),
            Value::Ref(_) => match arena.chase(value) {
                Ok(Chased::Object(addr)) => match arena.header(addr) {
                    Some(h) if h.is_marked() => {
                        Value::Ref(ObjRef::new(Addr(h.relocation), self.epoch))
                    }
                    _ => Value::Nil,
                },
                Ok(Chased::Immediate(immediate)) => self.break_foreign(immediate),
                Ok(Chased::Dangling(_)) => Value::Nil,
                Err(e) => {
                    self.fault.get_or_insert(e);
                    Value::Nil
                }
            },
            other => other,
        }
    }

    fn finish(self) -> HeapResult<usize> {
        match self.fault {
            Some(e) => Err(e),
            None => Ok(self.declawed),
        }
    }
}

/// Rewrites every reference held by live blocks and root sources, then
/// drains the declaw list. Returns the number of references broken.
pub(crate) fn rewrite(heap: &mut Heap, plan: &mut Plan, epoch: u32) -> HeapResult<usize> {
    let mut updater = Updater::new(&heap.declaw, epoch);
    let arena = &mut heap.arena;

    for relocation in &plan.relocations {
        let src = relocation.src;
        let Some(&header) = arena.header(src) else {
            return Err(HeapError::HeapCorruption(format!("live block at {src} lost its header")));
        };
        let class_index = src.index() + CLASS_OFFSET as usize;
        let payload = src.index() + PAYLOAD_OFFSET as usize;
        let end = match header.kind {
            ObjectKind::Array | ObjectKind::Frame => payload + header.length as usize,
            _ => payload,
        };
        for index in class_index..end {
            if let Slot::Value(value) = *arena.slot(index) {
                let updated = updater.apply(arena, value);
                *arena.slot_mut(index) = Slot::Value(updated);
            }
        }
        if header.kind == ObjectKind::IndirectBinary {
            if let Slot::Indirect(mut record) = *arena.slot(payload) {
                if record.declawed {
                    continue;
                }
                let procs = heap.procs.get(record.procs)?;
                if declawed_storage(&updater, procs.address(record.handle)) {
                    record.declawed = true;
                    updater.declawed += 1;
                    *arena.slot_mut(payload) = Slot::Indirect(record);
                } else {
                    let view: &Arena = arena;
                    procs.update(record.handle, &mut |v| updater.apply(view, v));
                }
            }
        }
    }

    for record in &mut plan.condemned {
        if !record.declawed {
            let procs = heap.procs.get(record.procs)?;
            if declawed_storage(&updater, procs.address(record.handle)) {
                record.declawed = true;
            }
        }
    }

    let arena: &Arena = arena;
    for value in heap.roots.iter_mut() {
        *value = updater.apply(arena, *value);
    }
    for value in heap.handles.values_mut() {
        *value = updater.apply(arena, *value);
    }
    for value in heap.scratch.iter_mut() {
        *value = updater.apply(arena, *value);
    }
    for object in heap.callbacks.iter() {
        object.lock().update(&mut |v| updater.apply(arena, v));
    }

    let declawed = updater.finish()?;
    let drained = heap.declaw.clear();
    if drained > 0 {
        tracing::debug!(ranges = drained, declawed, "drained declaw ranges");
    }
    Ok(declawed)
}

fn declawed_storage(updater: &Updater<'_>, address: Option<ForeignAddr>) -> bool {
    address.is_some_and(|a| updater.declaw.status(a) == ForeignStatus::Declawed)
}

/// Moves live blocks to their destinations, lays out free space and
/// deletes the storage of dead indirect binaries. Returns the number of
/// external deletions.
pub(crate) fn relocate(heap: &mut Heap, plan: &Plan) -> HeapResult<usize> {
    let arena = &mut heap.arena;
    for r in &plan.relocations {
        if r.src != r.dest {
            let src = r.src.index();
            arena
                .slots_mut()
                .copy_within(src..src + r.slots as usize, r.dest.index());
        }
    }
    // Slack is cleared only once every block has moved; it may overlap a
    // source that had not been copied yet.
    for r in &plan.relocations {
        let header = match arena.slot(r.dest.index()) {
            Slot::Header(h) => *h,
            other => {
                return Err(HeapError::HeapCorruption(format!(
                    "relocated block at {} holds {other:?}",
                    r.dest
                )))
            }
        };
        let mut flags = header.flags;
        flags.remove(ObjectFlags::MARKED);
        *arena.slot_mut(r.dest.index()) = Slot::Header(Header {
            slots: r.final_slots,
            flags,
            relocation: 0,
            ..header
        });
        if r.final_slots > r.slots {
            arena.clear(r.dest.0 + r.slots, r.final_slots - r.slots);
        }
    }
    for &(start, span) in &plan.free_regions {
        arena.write_free(start, span);
    }
    arena.rebuild_free_index()?;

    let mut deleted = 0;
    for record in plan.condemned.iter().filter(|r| !r.declawed) {
        heap.procs.get(record.procs)?.delete(record.handle);
        deleted += 1;
    }
    Ok(deleted)
}
