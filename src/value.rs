//! Tagged references stored in heap slots, roots and handles.

use std::fmt;

/// Slot index of a block start inside the arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Addr(pub(crate) u32);

impl Addr {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn offset(self, slots: u32) -> Addr {
        Addr(self.0 + slots)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06}", self.0)
    }
}

/// A heap-owned reference: arena address plus the epoch it was issued in.
///
/// References are rewritten whenever a collection relocates or reclaims
/// blocks. A reference kept outside the heap's roots and handles across such a
/// collection carries an old epoch and is rejected instead of silently
/// resolving to reused memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjRef {
    pub(crate) addr: Addr,
    pub(crate) epoch: u32,
}

impl ObjRef {
    pub(crate) fn new(addr: Addr, epoch: u32) -> Self {
        Self { addr, epoch }
    }

    pub fn addr(self) -> Addr {
        self.addr
    }

    pub fn epoch(self) -> u32 {
        self.epoch
    }
}

/// Interned symbol id. Interning belongs to the runtime's symbol table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(pub u32);

impl Symbol {
    /// Default class of weak arrays.
    pub const WEAK_ARRAY: Symbol = Symbol(0xFFFF_FF00);
    /// Default tag of the prototype slot followed by `frame_lookup`.
    pub const PROTO: Symbol = Symbol(0xFFFF_FF01);
}

/// Address inside externally-backed memory (store-mapped package data).
///
/// Foreign addresses are never heap-owned; they are the only references a
/// declaw range can invalidate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ForeignAddr(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Value {
    #[default]
    Nil,
    True,
    Int(i64),
    Char(char),
    Symbol(Symbol),
    Ref(ObjRef),
    Foreign(ForeignAddr),
    /// Sentinel left behind by declawing a foreign reference.
    Broken,
}

impl Value {
    pub fn is_nil(self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_ref(self) -> bool {
        matches!(self, Value::Ref(_))
    }

    pub fn is_broken(self) -> bool {
        matches!(self, Value::Broken)
    }

    pub fn as_ref(self) -> Option<ObjRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_int(self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_symbol(self) -> Option<Symbol> {
        match self {
            Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Arena address of a heap reference, ignoring its epoch.
    pub fn addr(self) -> Option<Addr> {
        self.as_ref().map(ObjRef::addr)
    }

    pub fn type_name(self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::True => "true",
            Value::Int(_) => "int",
            Value::Char(_) => "char",
            Value::Symbol(_) => "symbol",
            Value::Ref(_) => "ref",
            Value::Foreign(_) => "foreign",
            Value::Broken => "broken",
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        if b {
            Value::True
        } else {
            Value::Nil
        }
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Value::Char(c)
    }
}

impl From<Symbol> for Value {
    fn from(s: Symbol) -> Self {
        Value::Symbol(s)
    }
}

impl From<ForeignAddr> for Value {
    fn from(a: ForeignAddr) -> Self {
        Value::Foreign(a)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::True => write!(f, "true"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Char(c) => write!(f, "{c:?}"),
            Value::Symbol(s) => write!(f, "sym:{}", s.0),
            Value::Ref(r) => write!(f, "ref{}@{}", r.addr, r.epoch),
            Value::Foreign(a) => write!(f, "foreign:{:#x}", a.0),
            Value::Broken => write!(f, "<broken>"),
        }
    }
}
