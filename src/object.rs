//! Object-level operations on a [`Heap`]: lengths and resizing, slot and
//! byte access, header flags, cloning and replacement.

use std::sync::Arc;

use crate::allocator::Chased;
use crate::core::{
    object_slots, Forward, Header, IndirectRecord, ObjectFlags, ObjectKind, ShapeFlags, Slot,
    BYTES_PER_SLOT, CLASS_OFFSET, INDIRECT_SLOTS, OBJECT_PREFIX_SLOTS, PAYLOAD_OFFSET,
};
use crate::error::{HeapError, HeapResult};
use crate::heap::Heap;
use crate::value::{Addr, Value};

impl Heap {
    pub fn kind_of(&self, obj: Value) -> HeapResult<ObjectKind> {
        let addr = self.resolve(obj)?;
        Ok(self.header(addr)?.kind)
    }

    /// Logical length: bytes for binaries, elements for arrays and frames.
    /// Indirect binaries report the length of their external data.
    pub fn length(&self, obj: Value) -> HeapResult<usize> {
        let addr = self.resolve(obj)?;
        let header = self.header(addr)?;
        match header.kind {
            ObjectKind::IndirectBinary => {
                let record = self.indirect_record(addr)?;
                if record.declawed {
                    return Ok(0);
                }
                Ok(self.procs.get(record.procs)?.length(record.handle))
            }
            _ => Ok(header.length as usize),
        }
    }

    /// Sets the length of a binary or array, returning the object's
    /// reference, which differs from `obj` if the object had to move.
    ///
    /// # Examples
    ///
    /// ```
    /// use frameheap::{Heap, HeapConfig, HeapError, Value};
    ///
    /// let mut heap = Heap::new(HeapConfig::with_arena_slots(256)).unwrap();
    /// let array = heap.allocate_array(Value::Nil, 2).unwrap();
    /// heap.set_slot(array, 1, Value::Int(5)).unwrap();
    ///
    /// let array = heap.set_length(array, 6).unwrap();
    /// assert_eq!(heap.get_slot(array, 1).unwrap(), Value::Int(5));
    /// assert_eq!(heap.get_slot(array, 5).unwrap(), Value::Nil);
    ///
    /// heap.set_read_only(array, true).unwrap();
    /// assert_eq!(heap.set_length(array, 1), Err(HeapError::ReadOnly));
    /// ```
    pub fn set_length(&mut self, obj: Value, length: usize) -> HeapResult<Value> {
        let addr = self.resolve(obj)?;
        let header = *self.header(addr)?;
        if header.is_read_only() {
            return Err(HeapError::ReadOnly);
        }
        let max = match header.kind {
            ObjectKind::Binary => self.config.max_binary_length,
            ObjectKind::Array => self.config.max_array_length,
            other => return Err(HeapError::type_mismatch("binary or array", other.name())),
        };
        if length > max {
            return Err(HeapError::OutOfRange { length, max });
        }
        let addr = self.resize_object(addr, header.kind, length, &mut [])?;
        Ok(self.make_ref(addr))
    }

    /// Resizes the block of a binary or array to `slots` arena slots, header
    /// included. Contents that no longer fit are dropped.
    pub fn resize(&mut self, obj: Value, slots: usize) -> HeapResult<Value> {
        let addr = self.resolve(obj)?;
        let header = *self.header(addr)?;
        if header.is_locked() {
            tracing::error!(%addr, "attempted to resize a locked object");
            return Err(HeapError::ObjectLocked);
        }
        if header.is_read_only() {
            return Err(HeapError::ReadOnly);
        }
        let payload = slots.saturating_sub(OBJECT_PREFIX_SLOTS as usize);
        let capacity = match header.kind {
            ObjectKind::Binary => payload * BYTES_PER_SLOT,
            ObjectKind::Array => payload,
            other => return Err(HeapError::type_mismatch("binary or array", other.name())),
        };
        let length = (header.length as usize).min(capacity);
        let slots = slots.max(OBJECT_PREFIX_SLOTS as usize);
        let addr = self.resize_block(addr, slots, &mut [])?;
        self.truncate_payload(addr, header.kind, length)?;
        let header = self.header_mut(addr)?;
        header.length = length as u32;
        header.flags.insert(ObjectFlags::DIRTY);
        Ok(self.make_ref(addr))
    }

    /// Changes the logical length of the object at `addr`, moving it if the
    /// block cannot grow in place.
    pub(crate) fn resize_object(
        &mut self,
        addr: Addr,
        kind: ObjectKind,
        length: usize,
        protect: &mut [Value],
    ) -> HeapResult<Addr> {
        let old_length = self.header(addr)?.length as usize;
        let addr = self.resize_block(addr, object_slots(kind, length), protect)?;
        if length < old_length {
            self.truncate_payload(addr, kind, length)?;
        }
        let header = self.header_mut(addr)?;
        header.length = length as u32;
        header.flags.insert(ObjectFlags::DIRTY);
        Ok(addr)
    }

    /// Zeroes payload past `length` so a later grow reads nil or zero bytes.
    fn truncate_payload(&mut self, addr: Addr, kind: ObjectKind, length: usize) -> HeapResult<()> {
        let span = self.arena.span(addr)? as usize;
        let first = addr.index() + PAYLOAD_OFFSET as usize;
        let end = addr.index() + span;
        let keep = if kind == ObjectKind::Binary {
            let whole = length / BYTES_PER_SLOT;
            let partial = length % BYTES_PER_SLOT;
            if partial != 0 {
                if let Slot::Bytes(bytes) = self.arena.slot_mut(first + whole) {
                    bytes[partial..].fill(0);
                }
            }
            length.div_ceil(BYTES_PER_SLOT)
        } else {
            length
        };
        let from = (first + keep).min(end);
        self.arena.slots_mut()[from..end].fill(Slot::Empty);
        Ok(())
    }

    /// Resizes the block at `addr` to `new_slots`. Shrinks split the tail
    /// off, grows extend into trailing free space, and anything else moves
    /// the object and leaves a forwarding stub behind.
    pub(crate) fn resize_block(
        &mut self,
        addr: Addr,
        new_slots: usize,
        protect: &mut [Value],
    ) -> HeapResult<Addr> {
        let header = *self.header(addr)?;
        if header.is_locked() {
            tracing::error!(%addr, "attempted to resize a locked object");
            return Err(HeapError::ObjectLocked);
        }
        if new_slots > self.arena.len() {
            return Err(HeapError::OutOfMemory {
                requested: new_slots,
            });
        }
        let wanted = new_slots as u32;
        if wanted <= header.slots {
            let result = self.arena.shrink(addr, wanted);
            self.guard(result)?;
            return Ok(addr);
        }
        let result = self.arena.grow_in_place(addr, wanted);
        if self.guard(result)? {
            return Ok(addr);
        }

        let mut guarded = Vec::with_capacity(protect.len() + 1);
        guarded.push(self.make_ref(addr));
        guarded.extend_from_slice(protect);
        let dest = self.allocate_block(header.kind, new_slots, header.length, &mut guarded)?;
        protect.copy_from_slice(&guarded[1..]);
        let addr = self.resolve(guarded[0])?;

        let source = *self.header(addr)?;
        let span = self.arena.span(addr)?;
        let dest_span = self.arena.span(dest)?;
        let used = (object_slots(source.kind, source.length as usize) as u32).min(dest_span);
        self.arena.slots_mut().copy_within(
            addr.index() + 1..addr.index() + used as usize,
            dest.index() + 1,
        );
        *self.arena.slot_mut(dest.index()) = Slot::Header(Header {
            slots: dest_span,
            relocation: 0,
            ..source
        });
        let target = self.make_ref(dest);
        *self.arena.slot_mut(addr.index()) = Slot::Forward(Forward { slots: span, target });
        self.arena.clear(addr.0 + 1, span - 1);
        tracing::trace!(from = %addr, to = %dest, slots = new_slots, "relocated on resize");
        Ok(dest)
    }

    /// Destroys an object at once. References to it dangle afterwards: they
    /// fail with `NotAPointer` even once the space is reused, and the next
    /// collection rewrites every stored copy to nil.
    pub fn free(&mut self, obj: Value) -> HeapResult<()> {
        let addr = self.resolve(obj)?;
        let header = *self.header(addr)?;
        if header.is_locked() {
            return Err(HeapError::ObjectLocked);
        }
        if header.kind == ObjectKind::IndirectBinary {
            let record = self.indirect_record(addr)?;
            if !record.declawed {
                self.procs.get(record.procs)?.delete(record.handle);
            }
        }
        let result = self.arena.release(addr);
        self.guard(result)?;
        self.epoch = self.epoch.wrapping_add(1);
        self.arena.note_freed(addr, self.epoch);
        Ok(())
    }

    // ---- class and slots ----

    /// The class slot. For frames this is the shape.
    pub fn class_of(&self, obj: Value) -> HeapResult<Value> {
        let addr = self.resolve(obj)?;
        Ok(self.arena.slot(addr.index() + CLASS_OFFSET as usize).value())
    }

    pub fn set_class(&mut self, obj: Value, class: Value) -> HeapResult<()> {
        let addr = self.resolve(obj)?;
        let header = *self.header(addr)?;
        if header.kind == ObjectKind::Frame {
            return Err(HeapError::type_mismatch("binary or array", "frame"));
        }
        if header.is_read_only() {
            return Err(HeapError::ReadOnly);
        }
        self.check_value(class)?;
        self.write_class(addr, class);
        self.header_mut(addr)?.flags.insert(ObjectFlags::DIRTY);
        if header.kind == ObjectKind::IndirectBinary {
            let record = self.indirect_record(addr)?;
            if !record.declawed {
                self.procs.get(record.procs)?.set_class(record.handle, class);
            }
        }
        Ok(())
    }

    fn value_slot(&self, addr: Addr, index: usize) -> HeapResult<usize> {
        let header = self.header(addr)?;
        if !header.kind.has_value_slots() {
            return Err(HeapError::type_mismatch("array or frame", header.kind.name()));
        }
        let length = header.length as usize;
        if index >= length {
            return Err(HeapError::IndexOutOfBounds { index, length });
        }
        Ok(addr.index() + PAYLOAD_OFFSET as usize + index)
    }

    pub fn get_slot(&self, obj: Value, index: usize) -> HeapResult<Value> {
        let addr = self.resolve(obj)?;
        let slot = self.value_slot(addr, index)?;
        Ok(self.arena.slot(slot).value())
    }

    pub fn set_slot(&mut self, obj: Value, index: usize, value: Value) -> HeapResult<()> {
        let addr = self.resolve(obj)?;
        let slot = self.value_slot(addr, index)?;
        if self.header(addr)?.is_read_only() {
            return Err(HeapError::ReadOnly);
        }
        self.check_value(value)?;
        *self.arena.slot_mut(slot) = Slot::Value(value);
        self.header_mut(addr)?.flags.insert(ObjectFlags::DIRTY);
        Ok(())
    }

    /// All element values of an array or frame.
    pub fn slots(&self, obj: Value) -> HeapResult<Vec<Value>> {
        let addr = self.resolve(obj)?;
        let header = self.header(addr)?;
        if !header.kind.has_value_slots() {
            return Err(HeapError::type_mismatch("array or frame", header.kind.name()));
        }
        let first = addr.index() + PAYLOAD_OFFSET as usize;
        Ok((first..first + header.length as usize)
            .map(|i| self.arena.slot(i).value())
            .collect())
    }

    // ---- bytes ----

    pub fn read_bytes(&self, obj: Value) -> HeapResult<Vec<u8>> {
        let addr = self.resolve(obj)?;
        let header = self.header(addr)?;
        match header.kind {
            ObjectKind::Binary => {
                let length = header.length as usize;
                let first = addr.index() + PAYLOAD_OFFSET as usize;
                let mut bytes = Vec::with_capacity(length.next_multiple_of(BYTES_PER_SLOT));
                for i in first..first + length.div_ceil(BYTES_PER_SLOT) {
                    match self.arena.slot(i) {
                        Slot::Bytes(chunk) => bytes.extend_from_slice(chunk),
                        _ => bytes.extend_from_slice(&[0; BYTES_PER_SLOT]),
                    }
                }
                bytes.truncate(length);
                Ok(bytes)
            }
            ObjectKind::IndirectBinary => {
                let record = self.indirect_record(addr)?;
                if record.declawed {
                    return Ok(Vec::new());
                }
                Ok(self.procs.get(record.procs)?.data(record.handle))
            }
            other => Err(HeapError::type_mismatch("binary", other.name())),
        }
    }

    /// Overwrites bytes starting at `offset`. The object does not grow.
    pub fn write_bytes(&mut self, obj: Value, offset: usize, data: &[u8]) -> HeapResult<()> {
        let addr = self.resolve(obj)?;
        let header = *self.header(addr)?;
        if header.kind != ObjectKind::Binary {
            return Err(HeapError::type_mismatch("binary", header.kind.name()));
        }
        if header.is_read_only() {
            return Err(HeapError::ReadOnly);
        }
        let length = header.length as usize;
        let end = offset.saturating_add(data.len());
        if end > length {
            return Err(HeapError::IndexOutOfBounds { index: end, length });
        }
        let first = addr.index() + PAYLOAD_OFFSET as usize;
        for (position, &byte) in (offset..end).zip(data) {
            let slot = self.arena.slot_mut(first + position / BYTES_PER_SLOT);
            let mut chunk = match slot {
                Slot::Bytes(chunk) => *chunk,
                _ => [0; BYTES_PER_SLOT],
            };
            chunk[position % BYTES_PER_SLOT] = byte;
            *slot = Slot::Bytes(chunk);
        }
        self.header_mut(addr)?.flags.insert(ObjectFlags::DIRTY);
        Ok(())
    }

    // ---- flags ----

    pub fn flags(&self, obj: Value) -> HeapResult<ObjectFlags> {
        let addr = self.resolve(obj)?;
        Ok(self.header(addr)?.flags)
    }

    fn update_flags(&mut self, obj: Value, f: impl FnOnce(&mut ObjectFlags)) -> HeapResult<()> {
        let addr = self.resolve(obj)?;
        f(&mut self.header_mut(addr)?.flags);
        Ok(())
    }

    pub fn set_read_only(&mut self, obj: Value, read_only: bool) -> HeapResult<()> {
        self.update_flags(obj, |flags| flags.set(ObjectFlags::READ_ONLY, read_only))
    }

    pub fn is_read_only(&self, obj: Value) -> HeapResult<bool> {
        Ok(self.flags(obj)?.contains(ObjectFlags::READ_ONLY))
    }

    /// Pins an object: the compactor leaves it where it is.
    pub fn lock(&mut self, obj: Value) -> HeapResult<()> {
        self.update_flags(obj, |flags| flags.insert(ObjectFlags::LOCKED))
    }

    pub fn unlock(&mut self, obj: Value) -> HeapResult<()> {
        self.update_flags(obj, |flags| flags.remove(ObjectFlags::LOCKED))
    }

    pub fn is_locked(&self, obj: Value) -> HeapResult<bool> {
        Ok(self.flags(obj)?.contains(ObjectFlags::LOCKED))
    }

    pub fn is_dirty(&self, obj: Value) -> HeapResult<bool> {
        Ok(self.flags(obj)?.contains(ObjectFlags::DIRTY))
    }

    pub fn clear_dirty(&mut self, obj: Value) -> HeapResult<()> {
        self.update_flags(obj, |flags| flags.remove(ObjectFlags::DIRTY))
    }

    // ---- clone and replace ----

    /// Shallow copy. The copy is writable and unpinned; a cloned frame
    /// shares its shape with the original.
    pub fn clone_object(&mut self, obj: Value) -> HeapResult<Value> {
        let addr = self.resolve(obj)?;
        let header = *self.header(addr)?;
        let used = match header.kind {
            ObjectKind::IndirectBinary => INDIRECT_SLOTS as usize,
            kind => object_slots(kind, header.length as usize),
        };
        let mut protect = [obj];
        let dest = self.allocate_block(header.kind, used, header.length, &mut protect)?;
        let addr = self.resolve(protect[0])?;
        self.arena
            .slots_mut()
            .copy_within(addr.index() + 1..addr.index() + used, dest.index() + 1);

        match header.kind {
            ObjectKind::Frame => {
                let shape = self.arena.slot(dest.index() + CLASS_OFFSET as usize).value();
                if !shape.is_nil() {
                    self.add_shape_flags(shape, ShapeFlags::SHARED)?;
                }
            }
            ObjectKind::IndirectBinary => {
                let record = self.indirect_record(dest)?;
                if !record.declawed {
                    let procs = Arc::clone(self.procs.get(record.procs)?);
                    let handle = procs.clone_handle(record.handle);
                    *self.arena.slot_mut(dest.index() + PAYLOAD_OFFSET as usize) =
                        Slot::Indirect(IndirectRecord { handle, ..record });
                }
            }
            _ => {}
        }
        Ok(self.make_ref(dest))
    }

    /// Turns `target` into a forwarding stub redirecting to `replacement`.
    /// Every existing reference to `target` now reaches `replacement`.
    ///
    /// # Examples
    ///
    /// ```
    /// use frameheap::{Heap, HeapConfig, Value};
    ///
    /// let mut heap = Heap::new(HeapConfig::with_arena_slots(256)).unwrap();
    /// let old = heap.allocate_array(Value::Nil, 1).unwrap();
    /// let new = heap.allocate_array(Value::Nil, 3).unwrap();
    /// heap.replace(old, new).unwrap();
    /// assert_eq!(heap.length(old).unwrap(), 3);
    /// ```
    pub fn replace(&mut self, target: Value, replacement: Value) -> HeapResult<()> {
        if !target.is_ref() {
            return Err(HeapError::NotAPointer);
        }
        let addr = self.resolve(target)?;
        let header = *self.header(addr)?;
        if header.is_read_only() {
            return Err(HeapError::ReadOnly);
        }
        if header.is_locked() {
            return Err(HeapError::ObjectLocked);
        }
        self.check_value(replacement)?;
        if let Chased::Object(resolved) = self.arena.chase(replacement)? {
            if resolved == addr {
                return Ok(());
            }
        }
        if header.kind == ObjectKind::IndirectBinary {
            let record = self.indirect_record(addr)?;
            if !record.declawed {
                self.procs.get(record.procs)?.delete(record.handle);
            }
        }
        let span = self.arena.span(addr)?;
        *self.arena.slot_mut(addr.index()) = Slot::Forward(Forward {
            slots: span,
            target: replacement,
        });
        self.arena.clear(addr.0 + 1, span - 1);
        tracing::trace!(%addr, %replacement, "replaced object");
        Ok(())
    }
}
