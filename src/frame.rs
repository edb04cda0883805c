//! Frames and shapes.
//!
//! A shape is an array whose class slot holds [`ShapeFlags`], whose first
//! element is the super shape (or nil) and whose remaining elements are tags.
//! A frame's slots are keyed by the tags of its shape chain, root-most shape
//! first. Shapes used by more than one frame are flagged shared and are
//! extended by chaining a new shape instead of being grown in place.

use crate::core::{object_slots, ObjectFlags, ObjectKind, ShapeFlags, Slot, PAYLOAD_OFFSET};
use crate::error::{HeapError, HeapResult};
use crate::heap::Heap;
use crate::value::{Addr, Value};

const MAX_SHAPE_DEPTH: usize = 1024;
const MAX_PROTO_DEPTH: usize = 1024;

// Indices into the protected value array used by `frame_set`.
const FRAME: usize = 0;
const SHAPE: usize = 1;
const TAG: usize = 2;
const VALUE: usize = 3;

impl Heap {
    /// Resolves `shape` and checks that it is laid out as a shape.
    pub(crate) fn check_shape(&self, shape: Value) -> HeapResult<Addr> {
        let addr = self.resolve(shape)?;
        let header = self.header(addr)?;
        if header.kind != ObjectKind::Array {
            return Err(HeapError::type_mismatch("shape", header.kind.name()));
        }
        if header.length == 0 || ShapeFlags::from_value(self.class_of(shape)?).is_none() {
            return Err(HeapError::type_mismatch("shape", "array"));
        }
        Ok(addr)
    }

    pub fn shape_flags(&self, shape: Value) -> HeapResult<ShapeFlags> {
        self.check_shape(shape)?;
        ShapeFlags::from_value(self.class_of(shape)?)
            .ok_or_else(|| HeapError::type_mismatch("shape", "array"))
    }

    pub(crate) fn add_shape_flags(&mut self, shape: Value, flags: ShapeFlags) -> HeapResult<()> {
        let addr = self.check_shape(shape)?;
        let current = self.shape_flags(shape)?;
        self.write_class(addr, (current | flags).to_value());
        Ok(())
    }

    /// Shape addresses from `shape` up to the root of its chain.
    fn shape_levels(&self, shape: Value) -> HeapResult<Vec<Addr>> {
        let mut levels = Vec::new();
        let mut current = shape;
        while !current.is_nil() {
            if levels.len() == MAX_SHAPE_DEPTH {
                return Err(HeapError::OutOfRange {
                    length: levels.len() + 1,
                    max: MAX_SHAPE_DEPTH,
                });
            }
            let addr = self.check_shape(current)?;
            levels.push(addr);
            current = self.arena.slot(addr.index() + PAYLOAD_OFFSET as usize).value();
        }
        Ok(levels)
    }

    /// Number of frame slots described by a shape and its super shapes.
    pub fn shape_size(&self, shape: Value) -> HeapResult<usize> {
        let mut size = 0;
        for addr in self.shape_levels(shape)? {
            size += self.header(addr)?.length as usize - 1;
        }
        Ok(size)
    }

    /// Tags of the whole chain in frame slot order.
    pub fn shape_tags(&self, shape: Value) -> HeapResult<Vec<Value>> {
        let mut tags = Vec::new();
        for addr in self.shape_levels(shape)?.into_iter().rev() {
            let length = self.header(addr)?.length as usize;
            let first = addr.index() + PAYLOAD_OFFSET as usize;
            tags.extend((first + 1..first + length).map(|i| self.arena.slot(i).value()));
        }
        Ok(tags)
    }

    /// Sets one of the shape's own tags (super-shape tags excluded).
    pub fn set_shape_tag(&mut self, shape: Value, index: usize, tag: Value) -> HeapResult<()> {
        let addr = self.check_shape(shape)?;
        let own = self.header(addr)?.length as usize - 1;
        if index >= own {
            return Err(HeapError::IndexOutOfBounds { index, length: own });
        }
        self.check_value(tag)?;
        *self.arena.slot_mut(addr.index() + PAYLOAD_OFFSET as usize + 1 + index) = Slot::Value(tag);
        if tag == self.config.proto_tag {
            self.add_shape_flags(shape, ShapeFlags::PROTO)?;
        }
        Ok(())
    }

    /// Allocates a shape with room for `tag_count` tags. A non-nil super
    /// shape becomes shared.
    ///
    /// # Examples
    ///
    /// ```
    /// use frameheap::{Heap, HeapConfig, ShapeFlags, Symbol, Value};
    ///
    /// let mut heap = Heap::new(HeapConfig::with_arena_slots(256)).unwrap();
    /// let base = heap.allocate_shape(Value::Nil, 1).unwrap();
    /// heap.set_shape_tag(base, 0, Value::Symbol(Symbol(1))).unwrap();
    /// let derived = heap.allocate_shape(base, 2).unwrap();
    ///
    /// assert_eq!(heap.shape_size(derived).unwrap(), 3);
    /// assert!(heap.shape_flags(base).unwrap().contains(ShapeFlags::SHARED));
    /// ```
    pub fn allocate_shape(&mut self, super_shape: Value, tag_count: usize) -> HeapResult<Value> {
        let mut values = [super_shape];
        let addr = self.allocate_shape_protected(&mut values, 0, tag_count)?;
        Ok(self.make_ref(addr))
    }

    /// Allocates a shape extending `values[super_at]` while every value in
    /// `values` stays protected.
    fn allocate_shape_protected(
        &mut self,
        values: &mut [Value],
        super_at: usize,
        tag_count: usize,
    ) -> HeapResult<Addr> {
        let inherited = if values[super_at].is_nil() {
            ShapeFlags::empty()
        } else {
            self.shape_flags(values[super_at])? & ShapeFlags::PROTO
        };
        let length = tag_count + 1;
        let max = self.config.max_array_length;
        if length > max {
            return Err(HeapError::OutOfRange { length, max });
        }
        let addr = self.allocate_block(
            ObjectKind::Array,
            object_slots(ObjectKind::Array, length),
            length as u32,
            values,
        )?;
        let super_shape = values[super_at];
        self.write_class(addr, inherited.to_value());
        *self.arena.slot_mut(addr.index() + PAYLOAD_OFFSET as usize) = Slot::Value(super_shape);
        if !super_shape.is_nil() {
            self.add_shape_flags(super_shape, ShapeFlags::SHARED)?;
        }
        Ok(addr)
    }

    fn frame_header(&self, frame: Value) -> HeapResult<Addr> {
        let addr = self.resolve(frame)?;
        let kind = self.header(addr)?.kind;
        if kind != ObjectKind::Frame {
            return Err(HeapError::type_mismatch("frame", kind.name()));
        }
        Ok(addr)
    }

    pub fn shape_of(&self, frame: Value) -> HeapResult<Value> {
        self.frame_header(frame)?;
        self.class_of(frame)
    }

    pub fn frame_tags(&self, frame: Value) -> HeapResult<Vec<Value>> {
        let shape = self.shape_of(frame)?;
        if shape.is_nil() {
            return Ok(Vec::new());
        }
        self.shape_tags(shape)
    }

    /// Value stored under `tag`, or `None` when the frame has no such slot.
    pub fn frame_get(&self, frame: Value, tag: Value) -> HeapResult<Option<Value>> {
        let addr = self.frame_header(frame)?;
        let length = self.header(addr)?.length as usize;
        let Some(index) = self.frame_tags(frame)?.iter().position(|t| *t == tag) else {
            return Ok(None);
        };
        if index >= length {
            return Ok(None);
        }
        Ok(Some(self.arena.slot(addr.index() + PAYLOAD_OFFSET as usize + index).value()))
    }

    /// Stores `value` under `tag`, adding a slot when the tag is new.
    /// Returns the frame's reference, which changes if the frame moved.
    ///
    /// # Examples
    ///
    /// ```
    /// use frameheap::{Heap, HeapConfig, Symbol, Value};
    ///
    /// let mut heap = Heap::new(HeapConfig::with_arena_slots(256)).unwrap();
    /// let name = Value::Symbol(Symbol(7));
    /// let frame = heap.allocate_frame().unwrap();
    /// let frame = heap.frame_set(frame, name, Value::Int(3)).unwrap();
    /// assert_eq!(heap.frame_get(frame, name).unwrap(), Some(Value::Int(3)));
    /// assert_eq!(heap.length(frame).unwrap(), 1);
    /// ```
    pub fn frame_set(&mut self, frame: Value, tag: Value, value: Value) -> HeapResult<Value> {
        let addr = self.frame_header(frame)?;
        if self.header(addr)?.is_read_only() {
            return Err(HeapError::ReadOnly);
        }
        self.check_value(tag)?;
        self.check_value(value)?;
        let tags = self.frame_tags(frame)?;
        if let Some(index) = tags.iter().position(|t| *t == tag) {
            self.set_slot(frame, index, value)?;
            return Ok(self.make_ref(addr));
        }

        let index = tags.len();
        let shape = self.class_of(frame)?;
        let extend_in_place =
            !shape.is_nil() && !self.shape_flags(shape)?.contains(ShapeFlags::SHARED);
        let mut live = [self.make_ref(addr), shape, tag, value];

        if extend_in_place {
            let shape_addr = self.resolve(live[SHAPE])?;
            let own = self.header(shape_addr)?.length as usize;
            let shape_addr = self.resize_object(shape_addr, ObjectKind::Array, own + 1, &mut live)?;
            *self.arena.slot_mut(shape_addr.index() + PAYLOAD_OFFSET as usize + own) =
                Slot::Value(live[TAG]);
            live[SHAPE] = self.make_ref(shape_addr);
        } else {
            let shape_addr = self.allocate_shape_protected(&mut live, SHAPE, 1)?;
            *self.arena.slot_mut(shape_addr.index() + PAYLOAD_OFFSET as usize + 1) =
                Slot::Value(live[TAG]);
            live[SHAPE] = self.make_ref(shape_addr);
        }

        let frame_addr = self.resolve(live[FRAME])?;
        let frame_addr = self.resize_object(frame_addr, ObjectKind::Frame, index + 1, &mut live)?;
        *self.arena.slot_mut(frame_addr.index() + PAYLOAD_OFFSET as usize + index) =
            Slot::Value(live[VALUE]);
        self.write_class(frame_addr, live[SHAPE]);
        self.header_mut(frame_addr)?.flags.insert(ObjectFlags::DIRTY);
        if live[TAG] == self.config.proto_tag {
            self.add_shape_flags(live[SHAPE], ShapeFlags::PROTO)?;
        }
        Ok(self.make_ref(frame_addr))
    }

    /// Looks `tag` up in the frame, then along its prototype chain.
    pub fn frame_lookup(&self, frame: Value, tag: Value) -> HeapResult<Option<Value>> {
        let proto_tag = self.config.proto_tag;
        let mut current = frame;
        for _ in 0..MAX_PROTO_DEPTH {
            if let Some(found) = self.frame_get(current, tag)? {
                return Ok(Some(found));
            }
            let shape = self.shape_of(current)?;
            if shape.is_nil() || !self.shape_flags(shape)?.contains(ShapeFlags::PROTO) {
                return Ok(None);
            }
            match self.frame_get(current, proto_tag)? {
                Some(next) if next.is_ref() && self.kind_of(next)? == ObjectKind::Frame => {
                    current = next;
                }
                _ => return Ok(None),
            }
        }
        Err(HeapError::OutOfRange {
            length: MAX_PROTO_DEPTH + 1,
            max: MAX_PROTO_DEPTH,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::value::Symbol;

    fn heap() -> Heap {
        Heap::new(HeapConfig::with_arena_slots(512)).unwrap()
    }

    fn sym(n: u32) -> Value {
        Value::Symbol(Symbol(n))
    }

    #[test]
    fn shape_size_sums_each_level_without_super_slot() {
        let mut heap = heap();
        let root = heap.allocate_shape(Value::Nil, 2).unwrap();
        let mid = heap.allocate_shape(root, 0).unwrap();
        let leaf = heap.allocate_shape(mid, 3).unwrap();
        assert_eq!(heap.shape_size(root).unwrap(), 2);
        assert_eq!(heap.shape_size(mid).unwrap(), 2);
        assert_eq!(heap.shape_size(leaf).unwrap(), 5);
    }

    #[test]
    fn cyclic_shape_chains_are_out_of_range() {
        let mut heap = heap();
        let a = heap.allocate_shape(Value::Nil, 0).unwrap();
        let b = heap.allocate_shape(a, 0).unwrap();
        heap.set_slot(a, 0, b).unwrap();
        assert!(matches!(heap.shape_size(b), Err(HeapError::OutOfRange { .. })));
    }

    #[test]
    fn non_shapes_are_type_mismatches() {
        let mut heap = heap();
        let array = heap.allocate_array(Value::Nil, 2).unwrap();
        let bytes = heap.allocate_binary(Value::Nil, 2).unwrap();
        assert!(matches!(heap.shape_size(array), Err(HeapError::TypeMismatch { .. })));
        assert!(matches!(heap.shape_size(bytes), Err(HeapError::TypeMismatch { .. })));
        assert!(matches!(heap.frame_get(array, sym(1)), Err(HeapError::TypeMismatch { .. })));
    }

    #[test]
    fn frames_follow_shape_tag_order() {
        let mut heap = heap();
        let base = heap.allocate_shape(Value::Nil, 1).unwrap();
        heap.set_shape_tag(base, 0, sym(1)).unwrap();
        let shape = heap.allocate_shape(base, 1).unwrap();
        heap.set_shape_tag(shape, 0, sym(2)).unwrap();
        let frame = heap.allocate_frame_with_shape(shape).unwrap();

        assert_eq!(heap.frame_tags(frame).unwrap(), vec![sym(1), sym(2)]);
        assert_eq!(heap.length(frame).unwrap(), 2);
        heap.set_slot(frame, 1, Value::Int(20)).unwrap();
        assert_eq!(heap.frame_get(frame, sym(2)).unwrap(), Some(Value::Int(20)));
        assert_eq!(heap.frame_get(frame, sym(1)).unwrap(), Some(Value::Nil));
        assert_eq!(heap.frame_get(frame, sym(3)).unwrap(), None);
    }

    #[test]
    fn unshared_shapes_grow_in_place() {
        let mut heap = heap();
        let frame = heap.allocate_frame().unwrap();
        let shape = heap.shape_of(frame).unwrap();
        let frame = heap.frame_set(frame, sym(1), Value::Int(1)).unwrap();
        let frame = heap.frame_set(frame, sym(2), Value::Int(2)).unwrap();
        let grown = heap.shape_of(frame).unwrap();
        assert_eq!(heap.deref(shape).unwrap(), heap.deref(grown).unwrap());
        assert_eq!(heap.shape_size(grown).unwrap(), 2);
        assert_eq!(heap.frame_get(frame, sym(1)).unwrap(), Some(Value::Int(1)));
        assert_eq!(heap.frame_get(frame, sym(2)).unwrap(), Some(Value::Int(2)));
    }

    #[test]
    fn shared_shapes_are_extended_by_chaining() {
        let mut heap = heap();
        let shape = heap.allocate_shape(Value::Nil, 1).unwrap();
        heap.set_shape_tag(shape, 0, sym(1)).unwrap();
        let a = heap.allocate_frame_with_shape(shape).unwrap();
        let b = heap.allocate_frame_with_shape(shape).unwrap();
        assert!(heap.shape_flags(shape).unwrap().contains(ShapeFlags::SHARED));

        let a = heap.frame_set(a, sym(2), Value::True).unwrap();
        let extended = heap.shape_of(a).unwrap();
        assert_ne!(extended, shape);
        assert_eq!(heap.get_slot(extended, 0).unwrap(), shape);
        assert_eq!(heap.shape_size(shape).unwrap(), 1);
        assert_eq!(heap.frame_tags(a).unwrap(), vec![sym(1), sym(2)]);
        assert_eq!(heap.frame_get(b, sym(2)).unwrap(), None);
        assert_eq!(heap.shape_of(b).unwrap(), shape);
    }

    #[test]
    fn existing_tags_are_overwritten() {
        let mut heap = heap();
        let frame = heap.allocate_frame().unwrap();
        let frame = heap.frame_set(frame, sym(1), Value::Int(1)).unwrap();
        let again = heap.frame_set(frame, sym(1), Value::Int(2)).unwrap();
        assert_eq!(again, frame);
        assert_eq!(heap.length(frame).unwrap(), 1);
        assert_eq!(heap.frame_get(frame, sym(1)).unwrap(), Some(Value::Int(2)));
    }

    #[test]
    fn lookup_follows_the_prototype_chain() {
        let mut heap = heap();
        let proto = heap.config().proto_tag;
        let parent = heap.allocate_frame().unwrap();
        let parent = heap.frame_set(parent, sym(5), Value::Int(50)).unwrap();
        let parent_root = heap.add_root(parent).unwrap();

        let child = heap.allocate_frame().unwrap();
        let parent = heap.root(parent_root).unwrap();
        let child = heap.frame_set(child, proto, parent).unwrap();
        let child = heap.frame_set(child, sym(6), Value::Int(60)).unwrap();

        assert!(heap
            .shape_flags(heap.shape_of(child).unwrap())
            .unwrap()
            .contains(ShapeFlags::PROTO));
        assert_eq!(heap.frame_lookup(child, sym(5)).unwrap(), Some(Value::Int(50)));
        assert_eq!(heap.frame_lookup(child, sym(6)).unwrap(), Some(Value::Int(60)));
        assert_eq!(heap.frame_lookup(child, sym(7)).unwrap(), None);
        assert_eq!(heap.frame_get(child, sym(5)).unwrap(), None);
    }

    #[test]
    fn read_only_frames_reject_new_slots() {
        let mut heap = heap();
        let frame = heap.allocate_frame().unwrap();
        heap.set_read_only(frame, true).unwrap();
        assert_eq!(heap.frame_set(frame, sym(1), Value::Nil), Err(HeapError::ReadOnly));
    }
}
