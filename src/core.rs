//! Object model: block headers, arena slots and object layouts.
//!
//! Every block starts with a [`Slot::Header`] (or a [`Slot::Forward`] stub)
//! followed by its payload slots:
//!
//! ```text
//! binary    [Header][class][Bytes]...        length = byte count
//! array     [Header][class][Value]...        length = element count
//! frame     [Header][shape][Value]...        length = slot count
//! indirect  [Header][class][Indirect]        length = 0 (resolved externally)
//! stub      [Forward{slots, target}][Empty]...
//! free      [Header(kind = Free)][Empty]...
//! ```

use bitflags::bitflags;

use crate::indirect::{ExternalHandle, ProcsId};
use crate::value::Value;

/// Payload bytes stored in one arena slot.
pub const BYTES_PER_SLOT: usize = 8;
/// Header plus class/shape slot.
pub const OBJECT_PREFIX_SLOTS: u32 = 2;
pub const INDIRECT_SLOTS: u32 = OBJECT_PREFIX_SLOTS + 1;

pub(crate) const CLASS_OFFSET: u32 = 1;
pub(crate) const PAYLOAD_OFFSET: u32 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Free,
    Binary,
    Array,
    Frame,
    IndirectBinary,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Free => "free",
            ObjectKind::Binary => "binary",
            ObjectKind::Array => "array",
            ObjectKind::Frame => "frame",
            ObjectKind::IndirectBinary => "indirect binary",
        }
    }

    /// Kinds whose payload is a run of tagged references.
    pub fn has_value_slots(self) -> bool {
        matches!(self, ObjectKind::Array | ObjectKind::Frame)
    }

    pub fn is_binary(self) -> bool {
        matches!(self, ObjectKind::Binary | ObjectKind::IndirectBinary)
    }
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u8 {
        const MARKED = 0b0001;
        /// Pinned: the compactor never relocates it.
        const LOCKED = 0b0010;
        const READ_ONLY = 0b0100;
        const DIRTY = 0b1000;
    }
}

bitflags! {
    /// Flags kept in a shape's class slot.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShapeFlags: u32 {
        /// Referenced by more than one frame or shape; extend by chaining.
        const SHARED = 0b0001;
        /// Some frame using the shape carries a prototype slot.
        const PROTO = 0b0100;
    }
}

impl ShapeFlags {
    pub(crate) fn to_value(self) -> Value {
        Value::Int(i64::from(self.bits()))
    }

    pub(crate) fn from_value(value: Value) -> Option<Self> {
        let bits = u32::try_from(value.as_int()?).ok()?;
        Some(ShapeFlags::from_bits_truncate(bits))
    }
}

/// Block header. `relocation` is scratch space owned by the compactor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub slots: u32,
    pub kind: ObjectKind,
    pub flags: ObjectFlags,
    pub length: u32,
    pub(crate) relocation: u32,
}

impl Header {
    pub(crate) fn new(kind: ObjectKind, slots: u32, length: u32) -> Self {
        Self {
            slots,
            kind,
            flags: ObjectFlags::empty(),
            length,
            relocation: 0,
        }
    }

    pub(crate) fn free(slots: u32) -> Self {
        Self::new(ObjectKind::Free, slots, 0)
    }

    pub fn is_free(&self) -> bool {
        self.kind == ObjectKind::Free
    }

    pub fn is_marked(&self) -> bool {
        self.flags.contains(ObjectFlags::MARKED)
    }

    pub fn is_locked(&self) -> bool {
        self.flags.contains(ObjectFlags::LOCKED)
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(ObjectFlags::READ_ONLY)
    }
}

/// Forwarding stub left where an object was relocated or replaced.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Forward {
    pub slots: u32,
    pub target: Value,
}

/// Payload of an indirect binary: the external handle and its callback table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IndirectRecord {
    pub handle: ExternalHandle,
    pub procs: ProcsId,
    /// The backing memory was unmapped; the record must not be dereferenced.
    pub declawed: bool,
}

/// One fixed-stride arena cell.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Slot {
    Header(Header),
    Forward(Forward),
    Value(Value),
    Bytes([u8; BYTES_PER_SLOT]),
    Indirect(IndirectRecord),
    #[default]
    Empty,
}

impl Slot {
    /// Span of the block starting at this slot.
    pub fn block_span(&self) -> Option<u32> {
        match self {
            Slot::Header(h) => Some(h.slots),
            Slot::Forward(f) => Some(f.slots),
            _ => None,
        }
    }

    /// Reads a value slot; zeroed slots read as `Nil`.
    pub fn value(&self) -> Value {
        match self {
            Slot::Value(v) => *v,
            _ => Value::Nil,
        }
    }
}

pub fn binary_slots(byte_len: usize) -> usize {
    OBJECT_PREFIX_SLOTS as usize + byte_len.div_ceil(BYTES_PER_SLOT)
}

pub fn value_object_slots(len: usize) -> usize {
    OBJECT_PREFIX_SLOTS as usize + len
}

/// Slots needed for an object of `kind` with logical `length`.
pub fn object_slots(kind: ObjectKind, length: usize) -> usize {
    match kind {
        ObjectKind::Binary => binary_slots(length),
        ObjectKind::Array | ObjectKind::Frame => value_object_slots(length),
        ObjectKind::IndirectBinary => INDIRECT_SLOTS as usize,
        ObjectKind::Free => length.max(1),
    }
}
