//! Indirect binaries: objects whose bytes live outside the arena.
//!
//! The heap stores only an opaque [`ExternalHandle`] and the id of a
//! registered callback table. Length, data, cloning, deletion and tracing of
//! anything the external storage keeps alive all go through the table.

use std::fmt;
use std::sync::Arc;

use crate::error::{HeapError, HeapResult};
use crate::value::{ForeignAddr, Value};

/// Opaque handle issued by the external storage layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ExternalHandle(pub u64);

/// Id of a registered callback table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProcsId(pub(crate) u32);

/// Callback table for externally-backed binaries.
///
/// Implementations are shared with the heap, so any mutable state sits behind
/// interior mutability.
pub trait IndirectBinaryProcs: Send + Sync {
    /// Creates backing storage of `size` zero bytes.
    fn create(&self, size: usize) -> ExternalHandle;

    fn length(&self, handle: ExternalHandle) -> usize;

    /// Copy of the backing bytes.
    fn data(&self, handle: ExternalHandle) -> Vec<u8>;

    /// Where the bytes are mapped, if they live in foreign memory that a
    /// declaw range can revoke.
    fn address(&self, _handle: ExternalHandle) -> Option<ForeignAddr> {
        None
    }

    fn clone_handle(&self, handle: ExternalHandle) -> ExternalHandle;

    /// The owning object died or was destroyed.
    fn delete(&self, handle: ExternalHandle);

    fn set_class(&self, _handle: ExternalHandle, _class: Value) {}

    /// Reports heap values the external storage keeps alive.
    fn trace(&self, _handle: ExternalHandle, _visitor: &mut dyn FnMut(Value)) {}

    /// Rewrites heap values held by the external storage after compaction.
    fn update(&self, _handle: ExternalHandle, _updater: &mut dyn FnMut(Value) -> Value) {}
}

#[derive(Default)]
pub(crate) struct ProcsRegistry {
    tables: Vec<Arc<dyn IndirectBinaryProcs>>,
}

impl ProcsRegistry {
    pub fn register(&mut self, procs: Arc<dyn IndirectBinaryProcs>) -> ProcsId {
        if let Some(index) = self.tables.iter().position(|t| Arc::ptr_eq(t, &procs)) {
            return ProcsId(index as u32);
        }
        self.tables.push(procs);
        ProcsId(self.tables.len() as u32 - 1)
    }

    pub fn get(&self, id: ProcsId) -> HeapResult<&Arc<dyn IndirectBinaryProcs>> {
        self.tables.get(id.0 as usize).ok_or(HeapError::UnknownProcs)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tables.len()
    }
}

impl fmt::Debug for ProcsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcsRegistry")
            .field("tables", &self.tables.len())
            .finish()
    }
}
