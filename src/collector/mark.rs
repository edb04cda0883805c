//! Mark phase: an explicit worklist trace from every root source.

use crate::allocator::{Arena, Chased};
use crate::core::{ObjectFlags, ObjectKind, Slot, CLASS_OFFSET, PAYLOAD_OFFSET};
use crate::error::{HeapError, HeapResult};
use crate::heap::Heap;
use crate::indirect::ProcsRegistry;
use crate::value::{Addr, Value};
use crate::weak::WeakChain;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MarkSummary {
    pub live_objects: usize,
    pub live_slots: usize,
}

/// Worklist marker. Objects are marked when pushed, so each is scanned once.
struct Marker<'a> {
    arena: &'a mut Arena,
    weak_chain: &'a mut WeakChain,
    weak_class: Value,
    worklist: Vec<Addr>,
    summary: MarkSummary,
}

impl<'a> Marker<'a> {
    fn new(arena: &'a mut Arena, weak_chain: &'a mut WeakChain, weak_class: Value) -> Self {
        Self {
            arena,
            weak_chain,
            weak_class,
            worklist: Vec::new(),
            summary: MarkSummary::default(),
        }
    }

    /// Marks the object `value` resolves to. Stubs are followed, never
    /// marked; immediates and dangling references end the branch.
    fn push(&mut self, value: Value) -> HeapResult<()> {
        if !value.is_ref() {
            return Ok(());
        }
        let Chased::Object(addr) = self.arena.chase(value)? else {
            return Ok(());
        };
        let Some(header) = self.arena.header_mut(addr) else {
            return Ok(());
        };
        if header.is_marked() {
            return Ok(());
        }
        header.flags.insert(ObjectFlags::MARKED);
        self.summary.live_objects += 1;
        self.summary.live_slots += header.slots as usize;
        self.worklist.push(addr);
        Ok(())
    }

    fn drain(&mut self, procs: &ProcsRegistry) -> HeapResult<()> {
        let mut external = Vec::new();
        while let Some(addr) = self.worklist.pop() {
            let header = *self.arena.header(addr).ok_or_else(|| {
                HeapError::HeapCorruption(format!("marked block at {addr} lost its header"))
            })?;
            let class = self.arena.slot(addr.index() + CLASS_OFFSET as usize).value();
            self.push(class)?;

            match header.kind {
                ObjectKind::Array if class == self.weak_class => {
                    self.weak_chain.push(addr);
                }
                ObjectKind::Array | ObjectKind::Frame => {
                    let first = addr.index() + PAYLOAD_OFFSET as usize;
                    let end = first + header.length as usize;
                    if end > addr.index() + header.slots as usize {
                        return Err(HeapError::HeapCorruption(format!(
                            "object at {addr} has length {} beyond its span {}",
                            header.length, header.slots
                        )));
                    }
                    for index in first..end {
                        let value = self.arena.slot(index).value();
                        self.push(value)?;
                    }
                }
                ObjectKind::IndirectBinary => {
                    if let Slot::Indirect(record) =
                        *self.arena.slot(addr.index() + PAYLOAD_OFFSET as usize)
                    {
                        if !record.declawed {
                            procs
                                .get(record.procs)?
                                .trace(record.handle, &mut |v| external.push(v));
                            for value in external.drain(..) {
                                self.push(value)?;
                            }
                        }
                    }
                }
                ObjectKind::Binary | ObjectKind::Free => {}
            }
        }
        Ok(())
    }
}

/// Marks everything reachable from roots, handles, scratch values and
/// callback objects.
pub(crate) fn mark(heap: &mut Heap) -> HeapResult<MarkSummary> {
    let weak_class = heap.config.weak_array_class;
    let mut marker = Marker::new(&mut heap.arena, &mut heap.weak_chain, weak_class);

    for value in heap.roots.iter() {
        marker.push(value)?;
    }
    for value in heap.handles.values() {
        marker.push(value)?;
    }
    for &value in &heap.scratch {
        marker.push(value)?;
    }
    marker.drain(&heap.procs)?;

    let mut traced = Vec::new();
    for object in heap.callbacks.iter() {
        object.lock().trace(&mut |v| traced.push(v));
        for value in traced.drain(..) {
            marker.push(value)?;
        }
        marker.drain(&heap.procs)?;
    }

    tracing::trace!(
        live_objects = marker.summary.live_objects,
        live_slots = marker.summary.live_slots,
        weak_arrays = marker.weak_chain.len(),
        "mark complete"
    );
    Ok(marker.summary)
}

/// Liveness as seen by `after_mark` hooks. Immediates are always live.
pub(crate) fn is_live(arena: &Arena, value: Value) -> bool {
    match arena.chase(value) {
        Ok(Chased::Object(addr)) => arena.header(addr).is_some_and(|h| h.is_marked()),
        Ok(Chased::Immediate(_)) => true,
        Ok(Chased::Dangling(_)) | Err(_) => false,
    }
}

/// Runs every callback object's post-mark hook.
pub(crate) fn after_mark(heap: &mut Heap) {
    let arena = &heap.arena;
    for object in heap.callbacks.iter() {
        object.lock().after_mark(&|v| is_live(arena, v));
    }
}
