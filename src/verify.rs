//! Heap consistency checker.
//!
//! Walks every block and every root source and reports the first broken
//! invariant as [`HeapError::HeapCorruption`]. A failed check poisons the
//! heap.

use crate::core::{object_slots, Header, ObjectKind, Slot, CLASS_OFFSET, PAYLOAD_OFFSET};
use crate::error::{HeapError, HeapResult};
use crate::heap::Heap;
use crate::value::{Addr, Value};

impl Heap {
    /// Checks block tiling, the free index, object layouts and every stored
    /// reference.
    ///
    /// # Examples
    ///
    /// ```
    /// use frameheap::{Heap, HeapConfig, Value};
    ///
    /// let mut heap = Heap::new(HeapConfig::with_arena_slots(128)).unwrap();
    /// let array = heap.allocate_array(Value::Nil, 3).unwrap();
    /// heap.add_root(array).unwrap();
    /// heap.verify().unwrap();
    /// ```
    pub fn verify(&mut self) -> HeapResult<()> {
        self.check_poisoned()?;
        let result = self.check_blocks().and_then(|()| self.check_root_sources());
        if result.is_ok() {
            tracing::trace!(epoch = self.epoch, "heap verified");
        }
        self.guard(result)
    }

    fn check_blocks(&self) -> HeapResult<()> {
        let arena = &self.arena;
        let min_block = arena.min_block();
        let mut free_seen = Vec::new();
        let mut previous_free = false;
        let mut addr = 0u32;

        while (addr as usize) < arena.len() {
            let block = Addr(addr);
            let span = arena.span(block)?;
            if span < min_block {
                return Err(corrupt(format!("block at {block} spans {span} slots")));
            }
            match *arena.slot(block.index()) {
                Slot::Header(h) if h.is_free() => {
                    if previous_free {
                        return Err(corrupt(format!("free block at {block} follows free space")));
                    }
                    free_seen.push((block, span));
                    previous_free = true;
                }
                Slot::Header(h) => {
                    self.check_object(block, &h)?;
                    previous_free = false;
                }
                Slot::Forward(f) => {
                    self.check_reference(block, f.target)?;
                    previous_free = false;
                }
                other => return Err(corrupt(format!("block at {block} starts with {other:?}"))),
            }
            addr += span;
        }

        let indexed: Vec<(Addr, u32)> = arena.free_blocks().collect();
        if indexed != free_seen {
            return Err(corrupt(format!(
                "free index lists {} blocks, the arena holds {}",
                indexed.len(),
                free_seen.len()
            )));
        }
        Ok(())
    }

    fn check_object(&self, block: Addr, header: &Header) -> HeapResult<()> {
        if header.is_marked() && !self.collector.is_collecting() {
            return Err(corrupt(format!("stray mark on {block}")));
        }
        let needed = object_slots(header.kind, header.length as usize);
        if needed > header.slots as usize {
            return Err(corrupt(format!(
                "{} at {block} needs {needed} slots, spans {}",
                header.kind.name(),
                header.slots
            )));
        }

        let class_index = block.index() + CLASS_OFFSET as usize;
        match *self.arena.slot(class_index) {
            Slot::Value(class) => self.check_reference(block, class)?,
            Slot::Empty => {}
            other => return Err(corrupt(format!("class slot of {block} holds {other:?}"))),
        }

        let payload = block.index() + PAYLOAD_OFFSET as usize;
        match header.kind {
            ObjectKind::Array | ObjectKind::Frame => {
                for index in payload..payload + header.length as usize {
                    match *self.arena.slot(index) {
                        Slot::Value(value) => self.check_reference(block, value)?,
                        Slot::Empty => {}
                        other => {
                            return Err(corrupt(format!("element of {block} holds {other:?}")))
                        }
                    }
                }
            }
            ObjectKind::Binary => {
                let used = needed - PAYLOAD_OFFSET as usize;
                for index in payload..payload + used {
                    if !matches!(self.arena.slot(index), Slot::Bytes(_) | Slot::Empty) {
                        return Err(corrupt(format!("binary at {block} holds a non-byte slot")));
                    }
                }
            }
            ObjectKind::IndirectBinary => {
                self.indirect_record(block)?;
            }
            ObjectKind::Free => {}
        }
        Ok(())
    }

    /// References must come from the current epoch window and lead somewhere
    /// without a cycle. Dangling references left by an explicit free are tolerated;
    /// the next collection clears them.
    fn check_reference(&self, holder: Addr, value: Value) -> HeapResult<()> {
        let Value::Ref(r) = value else {
            return Ok(());
        };
        if !self.arena.is_current(r.epoch(), self.epoch) {
            return Err(corrupt(format!(
                "{holder} holds a reference from epoch {}, current is {}",
                r.epoch(),
                self.epoch
            )));
        }
        self.arena.chase(value)?;
        Ok(())
    }

    fn check_root_sources(&self) -> HeapResult<()> {
        let origin = Addr(0);
        for value in self.roots.iter().chain(self.handles.values()) {
            self.check_reference(origin, value)?;
        }
        Ok(())
    }
}

fn corrupt(reason: String) -> HeapError {
    HeapError::HeapCorruption(reason)
}
