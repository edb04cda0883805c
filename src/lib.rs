//! Managed object heap for a dynamically-typed runtime.
//!
//! Objects live in one contiguous arena of fixed-size slots carved into
//! blocks by a first-fit allocator. A stop-the-world collector marks from
//! registered roots, handles and callback objects, then slides live blocks
//! down over the garbage. Locked blocks stay put, replaced or relocated
//! objects leave forwarding stubs, weak arrays drop unreachable entries and
//! foreign references into unmapped ranges are declawed.
//!
//! # Examples
//!
//! ```
//! use frameheap::{Heap, HeapConfig, Symbol, Value};
//!
//! let mut heap = Heap::new(HeapConfig::with_arena_slots(1024)).unwrap();
//!
//! let frame = heap.allocate_frame().unwrap();
//! let root = heap.add_root(frame).unwrap();
//! let frame = heap.frame_set(frame, Value::Symbol(Symbol(1)), Value::Int(7)).unwrap();
//! heap.set_root(root, frame).unwrap();
//!
//! let _garbage = heap.allocate_array(Value::Nil, 32).unwrap();
//! heap.collect().unwrap();
//!
//! let frame = heap.root(root).unwrap();
//! assert_eq!(heap.frame_get(frame, Value::Symbol(Symbol(1))).unwrap(), Some(Value::Int(7)));
//! ```

pub mod allocator;
mod collector;
pub mod collector_phase;
pub mod config;
pub mod core;
pub mod declaw;
pub mod error;
mod frame;
pub mod handles;
pub mod heap;
pub mod indirect;
mod object;
pub mod roots;
pub mod stats;
pub mod test_utils;
pub mod value;
mod verify;
mod weak;

pub use crate::collector_phase::CollectorPhase;
pub use crate::config::HeapConfig;
pub use crate::core::{ObjectFlags, ObjectKind, ShapeFlags};
pub use crate::declaw::ForeignStatus;
pub use crate::error::{HeapError, HeapResult};
pub use crate::handles::{Depth, HandleId};
pub use crate::heap::Heap;
pub use crate::indirect::{ExternalHandle, IndirectBinaryProcs, ProcsId};
pub use crate::roots::{CallbackId, ExternalRoots, RootId, SharedExternalRoots};
pub use crate::stats::{BlockInfo, CollectionStats, HeapBounds, HeapStats};
pub use crate::value::{Addr, ForeignAddr, ObjRef, Symbol, Value};
