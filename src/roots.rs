//! Root registration: long-lived roots and external callback objects.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{HeapError, HeapResult};
use crate::value::Value;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RootId(u32);

/// Flat, growable root table. Removed entries are reused.
#[derive(Debug, Default)]
pub struct RootRegistry {
    slots: Vec<Option<Value>>,
    vacant: Vec<u32>,
}

impl RootRegistry {
    pub fn add(&mut self, value: Value) -> RootId {
        if let Some(index) = self.vacant.pop() {
            self.slots[index as usize] = Some(value);
            return RootId(index);
        }
        self.slots.push(Some(value));
        RootId(self.slots.len() as u32 - 1)
    }

    pub fn remove(&mut self, id: RootId) -> HeapResult<Value> {
        let value = self
            .slots
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(HeapError::UnknownRoot)?;
        self.vacant.push(id.0);
        Ok(value)
    }

    pub fn get(&self, id: RootId) -> HeapResult<Value> {
        self.slots
            .get(id.0 as usize)
            .copied()
            .flatten()
            .ok_or(HeapError::UnknownRoot)
    }

    pub fn set(&mut self, id: RootId, value: Value) -> HeapResult<()> {
        match self.slots.get_mut(id.0 as usize) {
            Some(Some(slot)) => {
                *slot = value;
                Ok(())
            }
            _ => Err(HeapError::UnknownRoot),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.slots.iter().flatten().copied()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Value> + '_ {
        self.slots.iter_mut().flatten()
    }
}

/// Subsystem state holding heap values that are not reachable from roots,
/// such as a symbol table.
///
/// `trace` reports every value to keep alive, `after_mark` lets the subsystem
/// drop entries whose objects were not marked (before anything moves), and
/// `update` rewrites the values it kept after compaction.
pub trait ExternalRoots: Send {
    fn trace(&self, visitor: &mut dyn FnMut(Value));

    fn after_mark(&mut self, _is_marked: &dyn Fn(Value) -> bool) {}

    fn update(&mut self, updater: &mut dyn FnMut(Value) -> Value);
}

pub type SharedExternalRoots = Arc<Mutex<dyn ExternalRoots>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CallbackId(u32);

#[derive(Default)]
pub(crate) struct CallbackRegistry {
    entries: Vec<Option<SharedExternalRoots>>,
}

impl CallbackRegistry {
    pub fn register(&mut self, object: SharedExternalRoots) -> CallbackId {
        if let Some(index) = self.entries.iter().position(Option::is_none) {
            self.entries[index] = Some(object);
            return CallbackId(index as u32);
        }
        self.entries.push(Some(object));
        CallbackId(self.entries.len() as u32 - 1)
    }

    pub fn unregister(&mut self, id: CallbackId) -> HeapResult<SharedExternalRoots> {
        self.entries
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(HeapError::UnknownCallback)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedExternalRoots> + '_ {
        self.entries.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("objects", &self.len())
            .finish()
    }
}
