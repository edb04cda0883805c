//! Test fixtures shared by unit tests, integration tests and benches.
//!
//! [`MemoryStore`] is an in-memory backing store for indirect binaries that
//! records every deletion. [`SymbolTable`] is a callback object with one
//! weak and one strong table.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::indirect::{ExternalHandle, IndirectBinaryProcs};
use crate::roots::ExternalRoots;
use crate::value::{ForeignAddr, Value};

#[derive(Debug, Clone, Default)]
struct Blob {
    bytes: Vec<u8>,
    class: Value,
    address: Option<ForeignAddr>,
    /// Heap values the blob keeps alive.
    refs: Vec<Value>,
}

#[derive(Debug, Default)]
struct StoreInner {
    next: u64,
    blobs: HashMap<u64, Blob>,
    deleted: Vec<ExternalHandle>,
}

impl StoreInner {
    fn insert(&mut self, blob: Blob) -> ExternalHandle {
        let id = self.next;
        self.next += 1;
        self.blobs.insert(id, blob);
        ExternalHandle(id)
    }
}

/// In-memory [`IndirectBinaryProcs`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use frameheap::test_utils::MemoryStore;
/// use frameheap::{Heap, HeapConfig, Value};
///
/// let mut heap = Heap::new(HeapConfig::with_arena_slots(128)).unwrap();
/// let store = Arc::new(MemoryStore::new());
/// let procs = heap.register_procs(store.clone());
///
/// let handle = store.insert(b"payload".to_vec());
/// let blob = heap.wrap_indirect_binary(Value::Nil, handle, procs).unwrap();
/// assert_eq!(heap.length(blob).unwrap(), 7);
///
/// heap.collect().unwrap();
/// assert!(store.is_deleted(handle));
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bytes: Vec<u8>) -> ExternalHandle {
        self.inner.lock().insert(Blob {
            bytes,
            ..Blob::default()
        })
    }

    /// Inserts bytes that pretend to live in foreign memory at `address`.
    pub fn insert_mapped(&self, bytes: Vec<u8>, address: ForeignAddr) -> ExternalHandle {
        self.inner.lock().insert(Blob {
            bytes,
            address: Some(address),
            ..Blob::default()
        })
    }

    /// Makes the blob behind `handle` hold `value`.
    pub fn attach(&self, handle: ExternalHandle, value: Value) {
        if let Some(blob) = self.inner.lock().blobs.get_mut(&handle.0) {
            blob.refs.push(value);
        }
    }

    pub fn attached(&self, handle: ExternalHandle) -> Vec<Value> {
        self.inner
            .lock()
            .blobs
            .get(&handle.0)
            .map(|b| b.refs.clone())
            .unwrap_or_default()
    }

    pub fn live_handles(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    pub fn is_deleted(&self, handle: ExternalHandle) -> bool {
        self.inner.lock().deleted.contains(&handle)
    }

    pub fn deleted(&self) -> usize {
        self.inner.lock().deleted.len()
    }

    pub fn class_of(&self, handle: ExternalHandle) -> Option<Value> {
        self.inner.lock().blobs.get(&handle.0).map(|b| b.class)
    }
}

impl IndirectBinaryProcs for MemoryStore {
    fn create(&self, size: usize) -> ExternalHandle {
        self.insert(vec![0; size])
    }

    fn length(&self, handle: ExternalHandle) -> usize {
        self.inner
            .lock()
            .blobs
            .get(&handle.0)
            .map_or(0, |b| b.bytes.len())
    }

    fn data(&self, handle: ExternalHandle) -> Vec<u8> {
        self.inner
            .lock()
            .blobs
            .get(&handle.0)
            .map(|b| b.bytes.clone())
            .unwrap_or_default()
    }

    fn address(&self, handle: ExternalHandle) -> Option<ForeignAddr> {
        self.inner.lock().blobs.get(&handle.0)?.address
    }

    fn clone_handle(&self, handle: ExternalHandle) -> ExternalHandle {
        let mut inner = self.inner.lock();
        let blob = inner.blobs.get(&handle.0).cloned().unwrap_or_default();
        inner.insert(Blob {
            address: None,
            ..blob
        })
    }

    fn delete(&self, handle: ExternalHandle) {
        let mut inner = self.inner.lock();
        inner.blobs.remove(&handle.0);
        inner.deleted.push(handle);
    }

    fn set_class(&self, handle: ExternalHandle, class: Value) {
        if let Some(blob) = self.inner.lock().blobs.get_mut(&handle.0) {
            blob.class = class;
        }
    }

    fn trace(&self, handle: ExternalHandle, visitor: &mut dyn FnMut(Value)) {
        let refs = self.attached(handle);
        for value in refs {
            visitor(value);
        }
    }

    fn update(&self, handle: ExternalHandle, updater: &mut dyn FnMut(Value) -> Value) {
        let mut inner = self.inner.lock();
        if let Some(blob) = inner.blobs.get_mut(&handle.0) {
            for value in &mut blob.refs {
                *value = updater(*value);
            }
        }
    }
}

/// Callback object with an interning table that holds its entries weakly
/// and a pin list that keeps its entries alive.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use parking_lot::Mutex;
/// use frameheap::test_utils::SymbolTable;
/// use frameheap::{Heap, HeapConfig, Value};
///
/// let mut heap = Heap::new(HeapConfig::with_arena_slots(128)).unwrap();
/// let table = Arc::new(Mutex::new(SymbolTable::new()));
/// heap.register_callback_object(table.clone());
///
/// let name = heap.allocate_binary(Value::Nil, 5).unwrap();
/// table.lock().intern(name);
/// heap.collect().unwrap();
/// assert!(table.lock().interned().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct SymbolTable {
    interned: Vec<Value>,
    pinned: Vec<Value>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, value: Value) {
        self.interned.push(value);
    }

    pub fn pin(&mut self, value: Value) {
        self.pinned.push(value);
    }

    pub fn interned(&self) -> &[Value] {
        &self.interned
    }

    pub fn pinned(&self) -> &[Value] {
        &self.pinned
    }
}

impl ExternalRoots for SymbolTable {
    fn trace(&self, visitor: &mut dyn FnMut(Value)) {
        for &value in &self.pinned {
            visitor(value);
        }
    }

    fn after_mark(&mut self, is_marked: &dyn Fn(Value) -> bool) {
        self.interned.retain(|&v| is_marked(v));
    }

    fn update(&mut self, updater: &mut dyn FnMut(Value) -> Value) {
        for value in self.interned.iter_mut().chain(self.pinned.iter_mut()) {
            *value = updater(*value);
        }
    }
}
