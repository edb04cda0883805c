//! Heap configuration.

use crate::error::{HeapError, HeapResult};
use crate::value::{Symbol, Value};

/// Configuration for heap sizing and collector behaviour.
///
/// # Examples
///
/// ```
/// use frameheap::HeapConfig;
///
/// let default_config = HeapConfig::default();
/// assert_eq!(default_config.min_block_slots, 2);
/// assert!(default_config.validate().is_ok());
///
/// let small = HeapConfig {
///     arena_slots: 512,
///     verify_heap: true,
///     ..HeapConfig::default()
/// };
/// assert_eq!(small.arena_slots, 512);
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Arena size in slots.
    pub arena_slots: usize,
    /// Smallest block the allocator will split off.
    pub min_block_slots: u32,
    /// Free gaps the compactor banks before pinned blocks.
    pub free_stack_capacity: usize,
    /// Initial handle pool size.
    pub initial_handles: usize,
    /// Handles added each time the pool is exhausted.
    pub handle_pool_increment: usize,
    pub max_binary_length: usize,
    pub max_array_length: usize,
    /// Arrays with this class hold their elements weakly.
    pub weak_array_class: Value,
    /// Frame tag followed by `frame_lookup`.
    pub proto_tag: Value,
    /// Run the heap checker before and after every collection.
    pub verify_heap: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            arena_slots: 64 * 1024,
            min_block_slots: 2,
            free_stack_capacity: 8,
            initial_handles: 64,
            handle_pool_increment: 64,
            max_binary_length: 16 * 1024 * 1024,
            max_array_length: 1024 * 1024,
            weak_array_class: Value::Symbol(Symbol::WEAK_ARRAY),
            proto_tag: Value::Symbol(Symbol::PROTO),
            verify_heap: false,
        }
    }
}

impl HeapConfig {
    pub fn with_arena_slots(arena_slots: usize) -> Self {
        Self {
            arena_slots,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> HeapResult<()> {
        if self.min_block_slots < 2 {
            return Err(HeapError::InvalidConfig(
                "min_block_slots must hold a header and a class slot".into(),
            ));
        }
        if self.arena_slots < self.min_block_slots as usize {
            return Err(HeapError::InvalidConfig(format!(
                "arena of {} slots is smaller than one block",
                self.arena_slots
            )));
        }
        if self.arena_slots > u32::MAX as usize {
            return Err(HeapError::InvalidConfig(
                "arena must be addressable with 32-bit slot indices".into(),
            ));
        }
        if self.free_stack_capacity == 0 {
            return Err(HeapError::InvalidConfig(
                "free_stack_capacity must be at least 1".into(),
            ));
        }
        if self.handle_pool_increment == 0 {
            return Err(HeapError::InvalidConfig(
                "handle_pool_increment must be at least 1".into(),
            ));
        }
        if self.weak_array_class.is_ref() || self.proto_tag.is_ref() {
            return Err(HeapError::InvalidConfig(
                "weak array class and proto tag must be immediates".into(),
            ));
        }
        Ok(())
    }
}
