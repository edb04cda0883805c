//! Stack-scoped handle pool for transient roots.
//!
//! Each handle records the scope depth it was allocated at. Leaving a scope
//! releases every handle deeper than the scope that remains. Slots carry a
//! generation so a disposed handle cannot alias a reused slot.

use crate::error::{HeapError, HeapResult};
use crate::value::Value;

/// Scope depth. Depth zero is the outermost scope.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Depth(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Default)]
struct HandleSlot {
    generation: u32,
    entry: Option<(Value, Depth)>,
}

#[derive(Debug)]
pub struct HandlePool {
    slots: Vec<HandleSlot>,
    /// Indices of empty slots; popped from the end.
    vacant: Vec<u32>,
    current: Depth,
}

impl HandlePool {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut pool = Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            current: Depth(0),
        };
        pool.grow(capacity);
        pool
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    pub fn current_depth(&self) -> Depth {
        self.current
    }

    pub fn is_exhausted(&self) -> bool {
        self.vacant.is_empty()
    }

    pub fn grow(&mut self, additional: usize) {
        let start = self.slots.len();
        self.slots.resize_with(start + additional, HandleSlot::default);
        // Lowest indices are handed out first.
        self.vacant.extend((start as u32..(start + additional) as u32).rev());
    }

    pub fn try_allocate(&mut self, value: Value, depth: Depth) -> Option<HandleId> {
        let index = self.vacant.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.entry = Some((value, depth));
        Some(HandleId {
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, id: HandleId) -> HeapResult<&HandleSlot> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation && s.entry.is_some())
            .ok_or(HeapError::InvalidHandle)
    }

    pub fn get(&self, id: HandleId) -> HeapResult<Value> {
        let slot = self.slot(id)?;
        Ok(slot.entry.map(|(v, _)| v).unwrap_or_default())
    }

    pub fn depth_of(&self, id: HandleId) -> HeapResult<Depth> {
        let slot = self.slot(id)?;
        Ok(slot.entry.map(|(_, d)| d).unwrap_or_default())
    }

    pub fn set(&mut self, id: HandleId, value: Value) -> HeapResult<()> {
        self.slot(id)?;
        if let Some((v, _)) = &mut self.slots[id.index as usize].entry {
            *v = value;
        }
        Ok(())
    }

    pub fn dispose(&mut self, id: HandleId) -> HeapResult<()> {
        self.slot(id)?;
        self.release(id.index);
        Ok(())
    }

    fn release(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(index);
    }

    /// Releases every handle allocated deeper than `depth`.
    pub fn clear_deeper_than(&mut self, depth: Depth) -> usize {
        let doomed: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.entry, Some((_, d)) if d > depth))
            .map(|(i, _)| i as u32)
            .collect();
        for &index in &doomed {
            self.release(index);
        }
        doomed.len()
    }

    pub fn enter_scope(&mut self) -> Depth {
        self.current = Depth(self.current.0 + 1);
        self.current
    }

    /// Leaves the scope at `depth`, releasing its handles and any deeper ones.
    pub fn leave_scope(&mut self, depth: Depth) -> usize {
        let outer = Depth(depth.0.saturating_sub(1));
        self.current = outer;
        self.clear_deeper_than(outer)
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.slots.iter().filter_map(|s| s.entry.map(|(v, _)| v))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> + '_ {
        self.slots
            .iter_mut()
            .filter_map(|s| s.entry.as_mut().map(|(v, _)| v))
    }
}
