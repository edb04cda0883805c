//! Weak arrays.
//!
//! The mark phase retains a weak array without tracing its elements and
//! threads it onto the weak chain. Once marking is complete, every element
//! whose referent stayed unmarked is cleared to `Nil`.

use crate::allocator::{Arena, Chased};
use crate::core::{Slot, PAYLOAD_OFFSET};
use crate::error::HeapResult;
use crate::value::{Addr, Value};

#[derive(Debug, Default)]
pub(crate) struct WeakChain {
    arrays: Vec<Addr>,
}

impl WeakChain {
    pub fn push(&mut self, array: Addr) {
        debug_assert!(!self.arrays.contains(&array), "weak array threaded twice");
        self.arrays.push(array);
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, array: Addr) -> bool {
        self.arrays.contains(&array)
    }

    /// Clears elements pointing at unmarked objects and empties the chain.
    /// Returns the number of cleared elements.
    pub fn clear_dead_entries(&mut self, arena: &mut Arena) -> HeapResult<usize> {
        let mut cleared = 0;
        for array in std::mem::take(&mut self.arrays) {
            let length = match arena.header(array) {
                Some(h) => h.length,
                None => continue,
            };
            let first = array.index() + PAYLOAD_OFFSET as usize;
            for index in first..first + length as usize {
                let value = arena.slot(index).value();
                if !value.is_ref() {
                    continue;
                }
                let dead = match arena.chase(value)? {
                    Chased::Object(target) => arena.header(target).is_some_and(|h| !h.is_marked()),
                    Chased::Dangling(_) => true,
                    Chased::Immediate(_) => false,
                };
                if dead {
                    *arena.slot_mut(index) = Slot::Value(Value::Nil);
                    cleared += 1;
                }
            }
        }
        if cleared > 0 {
            tracing::trace!(cleared, "cleared weak array entries");
        }
        Ok(cleared)
    }
}
