//! The heap instance: arena, root tables and the allocation entry points.
//!
//! Every operation that can allocate may trigger a collection, which relocates
//! objects and rewrites stored references. Values held in local variables
//! across such a call go stale; keep them in a root or a handle and read them
//! back afterwards.

use std::fmt;
use std::sync::Arc;

use crate::allocator::{Arena, Chased};
use crate::collector_phase::CollectorState;
use crate::config::HeapConfig;
use crate::core::{
    object_slots, Header, IndirectRecord, ObjectKind, ShapeFlags, Slot, CLASS_OFFSET,
    INDIRECT_SLOTS, PAYLOAD_OFFSET,
};
use crate::declaw::{DeclawRegistry, ForeignStatus};
use crate::error::{HeapError, HeapResult};
use crate::handles::{Depth, HandleId, HandlePool};
use crate::indirect::{ExternalHandle, IndirectBinaryProcs, ProcsId, ProcsRegistry};
use crate::roots::{CallbackId, CallbackRegistry, RootId, RootRegistry, SharedExternalRoots};
use crate::stats::CollectionStats;
use crate::value::{Addr, ForeignAddr, ObjRef, Value};
use crate::weak::WeakChain;

pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) arena: Arena,
    pub(crate) roots: RootRegistry,
    pub(crate) handles: HandlePool,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) procs: ProcsRegistry,
    pub(crate) declaw: DeclawRegistry,
    pub(crate) weak_chain: WeakChain,
    /// Values protected across an allocation inside a heap operation.
    pub(crate) scratch: Vec<Value>,
    pub(crate) epoch: u32,
    pub(crate) collector: CollectorState,
    pub(crate) collections: u64,
    pub(crate) last_collection: Option<CollectionStats>,
    pub(crate) poisoned: bool,
}

impl Heap {
    /// Creates a heap with one free block spanning the whole arena.
    ///
    /// # Examples
    ///
    /// ```
    /// use frameheap::{Heap, HeapConfig, Value};
    ///
    /// let mut heap = Heap::new(HeapConfig::with_arena_slots(1024)).unwrap();
    /// let array = heap.allocate_array(Value::Nil, 4).unwrap();
    /// assert_eq!(heap.length(array).unwrap(), 4);
    /// ```
    pub fn new(config: HeapConfig) -> HeapResult<Self> {
        config.validate()?;
        tracing::debug!(
            arena_slots = config.arena_slots,
            min_block = config.min_block_slots,
            "creating heap"
        );
        Ok(Self {
            arena: Arena::new(config.arena_slots, config.min_block_slots),
            roots: RootRegistry::default(),
            handles: HandlePool::with_capacity(config.initial_handles),
            callbacks: CallbackRegistry::default(),
            procs: ProcsRegistry::default(),
            declaw: DeclawRegistry::default(),
            weak_chain: WeakChain::default(),
            scratch: Vec::new(),
            epoch: 0,
            collector: CollectorState::default(),
            collections: 0,
            last_collection: None,
            poisoned: false,
            config,
        })
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Current reference epoch. It advances with every explicit free and
    /// whenever a collection relocates or reclaims anything.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn is_collecting(&self) -> bool {
        self.collector.is_collecting()
    }

    // ---- reference plumbing ----

    pub(crate) fn check_poisoned(&self) -> HeapResult<()> {
        if self.poisoned {
            return Err(HeapError::HeapCorruption("heap is poisoned".into()));
        }
        Ok(())
    }

    /// Marks the heap unusable after a consistency failure.
    pub(crate) fn poison(&mut self, reason: &str) {
        if !self.poisoned {
            tracing::error!(reason, epoch = self.epoch, "heap corruption detected");
        }
        self.poisoned = true;
    }

    /// Routes a result through the poison check.
    pub(crate) fn guard<T>(&mut self, result: HeapResult<T>) -> HeapResult<T> {
        if let Err(HeapError::HeapCorruption(reason)) = &result {
            let reason = reason.clone();
            self.poison(&reason);
        }
        result
    }

    pub(crate) fn make_ref(&self, addr: Addr) -> Value {
        Value::Ref(ObjRef::new(addr, self.epoch))
    }

    /// References issued since the last layout-changing collection are
    /// current; anything older has been rewritten everywhere it was stored.
    pub(crate) fn check_epoch(&self, r: ObjRef) -> HeapResult<()> {
        if !self.arena.is_current(r.epoch, self.epoch) {
            return Err(HeapError::StaleReference);
        }
        Ok(())
    }

    /// Resolves a reference through forwarding stubs to a live block.
    pub(crate) fn resolve(&self, value: Value) -> HeapResult<Addr> {
        self.check_poisoned()?;
        let Value::Ref(r) = value else {
            return Err(HeapError::NotAPointer);
        };
        self.check_epoch(r)?;
        match self.arena.chase(value)? {
            Chased::Object(addr) => Ok(addr),
            Chased::Immediate(_) | Chased::Dangling(_) => Err(HeapError::NotAPointer),
        }
    }

    /// Validates a value before it is stored anywhere the collector traces.
    pub(crate) fn check_value(&self, value: Value) -> HeapResult<()> {
        self.check_poisoned()?;
        if let Value::Ref(r) = value {
            self.check_epoch(r)?;
            if let Chased::Dangling(_) = self.arena.chase(value)? {
                return Err(HeapError::NotAPointer);
            }
        }
        Ok(())
    }

    pub(crate) fn header(&self, addr: Addr) -> HeapResult<&Header> {
        self.arena
            .header(addr)
            .ok_or_else(|| HeapError::HeapCorruption(format!("no header at {addr}")))
    }

    pub(crate) fn header_mut(&mut self, addr: Addr) -> HeapResult<&mut Header> {
        self.arena
            .header_mut(addr)
            .ok_or_else(|| HeapError::HeapCorruption(format!("no header at {addr}")))
    }

    /// Follows forwarding stubs and returns the current value of a
    /// reference: a fresh reference to the live object, or the immediate a
    /// tombstone redirects to. Immediates resolve to themselves.
    pub fn deref(&self, value: Value) -> HeapResult<Value> {
        self.check_poisoned()?;
        let Value::Ref(r) = value else {
            return Ok(value);
        };
        self.check_epoch(r)?;
        match self.arena.chase(value)? {
            Chased::Object(addr) => Ok(self.make_ref(addr)),
            Chased::Immediate(immediate) => Ok(immediate),
            Chased::Dangling(_) => Err(HeapError::NotAPointer),
        }
    }

    /// Runs `f` with `values` registered as scratch roots and copies the
    /// (possibly rewritten) values back afterwards.
    pub(crate) fn protected<T>(
        &mut self,
        values: &mut [Value],
        f: impl FnOnce(&mut Self) -> HeapResult<T>,
    ) -> HeapResult<T> {
        let base = self.scratch.len();
        self.scratch.extend_from_slice(values);
        let result = f(self);
        let restored = self.scratch.split_off(base);
        for (value, restored) in values.iter_mut().zip(restored) {
            *value = restored;
        }
        result
    }

    // ---- allocation ----

    /// Allocates a block, collecting once if nothing fits. `protect` holds
    /// caller values that must survive the collection; they are rewritten in
    /// place.
    pub(crate) fn allocate_block(
        &mut self,
        kind: ObjectKind,
        slots: usize,
        length: u32,
        protect: &mut [Value],
    ) -> HeapResult<Addr> {
        self.check_poisoned()?;
        if slots > self.arena.len() {
            tracing::warn!(requested = slots, arena = self.arena.len(), "request exceeds arena");
            return Err(HeapError::OutOfMemory { requested: slots });
        }
        let wanted = slots as u32;
        if let Some(addr) = self.arena.allocate(wanted, kind, length) {
            return Ok(addr);
        }
        tracing::debug!(requested = slots, kind = kind.name(), "allocation failed, collecting");
        self.protected(protect, |heap| heap.collect().map(drop))?;
        match self.arena.allocate(wanted, kind, length) {
            Some(addr) => Ok(addr),
            None => {
                tracing::warn!(
                    requested = slots,
                    free = self.arena.free_slots(),
                    largest_free = self.arena.largest_free(),
                    "out of memory after collection"
                );
                Err(HeapError::OutOfMemory { requested: slots })
            }
        }
    }

    pub(crate) fn write_class(&mut self, addr: Addr, class: Value) {
        *self.arena.slot_mut(addr.index() + CLASS_OFFSET as usize) = Slot::Value(class);
    }

    fn allocate_object(
        &mut self,
        kind: ObjectKind,
        class: Value,
        length: usize,
        max: usize,
    ) -> HeapResult<Value> {
        if length > max {
            return Err(HeapError::OutOfRange { length, max });
        }
        self.check_value(class)?;
        let mut protect = [class];
        let addr = self.allocate_block(kind, object_slots(kind, length), length as u32, &mut protect)?;
        self.write_class(addr, protect[0]);
        Ok(self.make_ref(addr))
    }

    /// Allocates a zero-filled byte object.
    pub fn allocate_binary(&mut self, class: Value, length: usize) -> HeapResult<Value> {
        let max = self.config.max_binary_length;
        self.allocate_object(ObjectKind::Binary, class, length, max)
    }

    /// Allocates an array of `length` nil elements.
    pub fn allocate_array(&mut self, class: Value, length: usize) -> HeapResult<Value> {
        let max = self.config.max_array_length;
        self.allocate_object(ObjectKind::Array, class, length, max)
    }

    /// Allocates an array whose elements do not keep their referents alive.
    ///
    /// # Examples
    ///
    /// ```
    /// use frameheap::{Heap, HeapConfig, Value};
    ///
    /// let mut heap = Heap::new(HeapConfig::with_arena_slots(256)).unwrap();
    /// let cache = heap.allocate_weak_array(1).unwrap();
    /// let cache_root = heap.add_root(cache).unwrap();
    /// let entry = heap.allocate_binary(Value::Nil, 16).unwrap();
    /// heap.set_slot(cache, 0, entry).unwrap();
    ///
    /// heap.collect().unwrap();
    /// let cache = heap.root(cache_root).unwrap();
    /// assert_eq!(heap.get_slot(cache, 0).unwrap(), Value::Nil);
    /// ```
    pub fn allocate_weak_array(&mut self, length: usize) -> HeapResult<Value> {
        let class = self.config.weak_array_class;
        self.allocate_array(class, length)
    }

    pub fn is_weak_array(&self, value: Value) -> HeapResult<bool> {
        let addr = self.resolve(value)?;
        let header = self.header(addr)?;
        Ok(header.kind == ObjectKind::Array
            && self.arena.slot(addr.index() + CLASS_OFFSET as usize).value()
                == self.config.weak_array_class)
    }

    /// Allocates an empty frame with a fresh unshared shape.
    pub fn allocate_frame(&mut self) -> HeapResult<Value> {
        let shape = self.allocate_shape(Value::Nil, 0)?;
        let mut protect = [shape];
        let addr = self.allocate_block(
            ObjectKind::Frame,
            object_slots(ObjectKind::Frame, 0),
            0,
            &mut protect,
        )?;
        self.write_class(addr, protect[0]);
        Ok(self.make_ref(addr))
    }

    /// Allocates a frame laid out by `shape`, with every slot nil. The shape
    /// becomes shared.
    pub fn allocate_frame_with_shape(&mut self, shape: Value) -> HeapResult<Value> {
        let length = self.shape_size(shape)?;
        let mut protect = [shape];
        let addr = self.allocate_block(
            ObjectKind::Frame,
            object_slots(ObjectKind::Frame, length),
            length as u32,
            &mut protect,
        )?;
        let [shape] = protect;
        self.write_class(addr, shape);
        self.add_shape_flags(shape, ShapeFlags::SHARED)?;
        Ok(self.make_ref(addr))
    }

    pub fn register_procs(&mut self, procs: Arc<dyn IndirectBinaryProcs>) -> ProcsId {
        self.procs.register(procs)
    }

    /// Allocates an indirect binary whose storage is created by `procs`.
    pub fn allocate_indirect_binary(
        &mut self,
        class: Value,
        size: usize,
        procs: ProcsId,
    ) -> HeapResult<Value> {
        let max = self.config.max_binary_length;
        if size > max {
            return Err(HeapError::OutOfRange { length: size, max });
        }
        self.check_value(class)?;
        let table = Arc::clone(self.procs.get(procs)?);
        let handle = table.create(size);
        match self.install_indirect(class, handle, procs) {
            Ok(value) => Ok(value),
            Err(e) => {
                table.delete(handle);
                Err(e)
            }
        }
    }

    /// Adopts existing externally-managed data as an indirect binary.
    pub fn wrap_indirect_binary(
        &mut self,
        class: Value,
        handle: ExternalHandle,
        procs: ProcsId,
    ) -> HeapResult<Value> {
        self.check_value(class)?;
        self.procs.get(procs)?;
        self.install_indirect(class, handle, procs)
    }

    fn install_indirect(
        &mut self,
        class: Value,
        handle: ExternalHandle,
        procs: ProcsId,
    ) -> HeapResult<Value> {
        let mut protect = [class];
        let addr = self.allocate_block(
            ObjectKind::IndirectBinary,
            INDIRECT_SLOTS as usize,
            0,
            &mut protect,
        )?;
        let [class] = protect;
        self.write_class(addr, class);
        *self.arena.slot_mut(addr.index() + PAYLOAD_OFFSET as usize) =
            Slot::Indirect(IndirectRecord {
                handle,
                procs,
                declawed: false,
            });
        self.procs.get(procs)?.set_class(handle, class);
        Ok(self.make_ref(addr))
    }

    pub(crate) fn indirect_record(&self, addr: Addr) -> HeapResult<IndirectRecord> {
        match self.arena.slot(addr.index() + PAYLOAD_OFFSET as usize) {
            Slot::Indirect(record) => Ok(*record),
            other => Err(HeapError::HeapCorruption(format!(
                "indirect binary at {addr} holds {other:?}"
            ))),
        }
    }

    // ---- roots ----

    pub fn add_root(&mut self, value: Value) -> HeapResult<RootId> {
        self.check_value(value)?;
        Ok(self.roots.add(value))
    }

    pub fn root(&self, id: RootId) -> HeapResult<Value> {
        self.check_poisoned()?;
        self.roots.get(id)
    }

    pub fn set_root(&mut self, id: RootId, value: Value) -> HeapResult<()> {
        self.check_value(value)?;
        self.roots.set(id, value)
    }

    pub fn remove_root(&mut self, id: RootId) -> HeapResult<Value> {
        self.roots.remove(id)
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Registers subsystem state whose heap values are traced and rewritten
    /// by every collection.
    pub fn register_callback_object(&mut self, object: SharedExternalRoots) -> CallbackId {
        self.callbacks.register(object)
    }

    pub fn unregister_callback_object(&mut self, id: CallbackId) -> HeapResult<SharedExternalRoots> {
        self.callbacks.unregister(id)
    }

    // ---- handles ----

    /// Allocates a handle at the current scope depth.
    pub fn allocate_handle(&mut self, value: Value) -> HeapResult<HandleId> {
        let depth = self.handles.current_depth();
        self.allocate_handle_at(value, depth)
    }

    /// Allocates a handle tagged with an explicit depth.
    ///
    /// When the pool is exhausted, handles deeper than the current depth are
    /// reclaimed first; failing that, the heap collects and the pool grows.
    pub fn allocate_handle_at(&mut self, value: Value, depth: Depth) -> HeapResult<HandleId> {
        self.check_value(value)?;
        if let Some(id) = self.handles.try_allocate(value, depth) {
            return Ok(id);
        }
        let current = self.handles.current_depth();
        let reclaimed = self.handles.clear_deeper_than(current);
        let mut protect = [value];
        if self.handles.is_exhausted() {
            self.protected(&mut protect, |heap| heap.collect().map(drop))?;
            let increment = self.config.handle_pool_increment;
            self.handles.grow(increment);
            tracing::debug!(
                capacity = self.handles.capacity(),
                increment,
                "grew handle pool"
            );
        } else {
            tracing::trace!(reclaimed, "reclaimed stale handles");
        }
        self.handles
            .try_allocate(protect[0], depth)
            .ok_or_else(|| HeapError::HeapCorruption("handle pool empty after growth".into()))
    }

    pub fn handle(&self, id: HandleId) -> HeapResult<Value> {
        self.check_poisoned()?;
        self.handles.get(id)
    }

    pub fn set_handle(&mut self, id: HandleId, value: Value) -> HeapResult<()> {
        self.check_value(value)?;
        self.handles.set(id, value)
    }

    pub fn dispose_handle(&mut self, id: HandleId) -> HeapResult<()> {
        self.handles.dispose(id)
    }

    /// Releases every handle allocated deeper than `depth`.
    pub fn clear_handles_deeper_than(&mut self, depth: Depth) -> usize {
        self.handles.clear_deeper_than(depth)
    }

    pub fn enter_scope(&mut self) -> Depth {
        self.handles.enter_scope()
    }

    pub fn leave_scope(&mut self, depth: Depth) -> usize {
        self.handles.leave_scope(depth)
    }

    pub fn current_depth(&self) -> Depth {
        self.handles.current_depth()
    }

    pub fn handles_in_use(&self) -> usize {
        self.handles.in_use()
    }

    pub fn handle_capacity(&self) -> usize {
        self.handles.capacity()
    }

    // ---- declawing ----

    /// Registers a foreign range about to be unmapped. References into it
    /// become [`Value::Broken`] at the next collection.
    pub fn register_declaw_range(&mut self, start: ForeignAddr, end: ForeignAddr) -> bool {
        let registered = self.declaw.register(start, end);
        if registered {
            tracing::debug!(start = start.0, end = end.0, "registered declaw range");
        }
        registered
    }

    pub fn declaw_status(&self, addr: ForeignAddr) -> ForeignStatus {
        self.declaw.status(addr)
    }

    pub fn pending_declaw_ranges(&self) -> usize {
        self.declaw.len()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("arena_slots", &self.arena.len())
            .field("free_slots", &self.arena.free_slots())
            .field("roots", &self.roots.len())
            .field("handles", &self.handles.in_use())
            .field("callbacks", &self.callbacks)
            .field("procs", &self.procs)
            .field("epoch", &self.epoch)
            .field("collections", &self.collections)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
