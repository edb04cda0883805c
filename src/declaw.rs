//! Declaw registry: foreign memory ranges about to be unmapped.
//!
//! Ranges are consumed by the next reference-rewrite pass, which turns every
//! foreign reference inside them into [`Value::Broken`].

use std::ops::Range;

use crate::value::{ForeignAddr, Value};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ForeignStatus {
    Mapped,
    Declawed,
}

#[derive(Debug, Default)]
pub struct DeclawRegistry {
    ranges: Vec<Range<u64>>,
}

impl DeclawRegistry {
    /// Registers `[start, end)`. Empty or inverted ranges are refused.
    pub fn register(&mut self, start: ForeignAddr, end: ForeignAddr) -> bool {
        if start >= end {
            return false;
        }
        self.ranges.push(start.0..end.0);
        true
    }

    pub fn status(&self, addr: ForeignAddr) -> ForeignStatus {
        if self.ranges.iter().any(|r| r.contains(&addr.0)) {
            ForeignStatus::Declawed
        } else {
            ForeignStatus::Mapped
        }
    }

    /// Resolves a value against the pending ranges.
    pub fn check(&self, value: Value) -> Value {
        match value {
            Value::Foreign(addr) if self.status(addr) == ForeignStatus::Declawed => Value::Broken,
            other => other,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn clear(&mut self) -> usize {
        let drained = self.ranges.len();
        self.ranges.clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_ranges_are_refused() {
        let mut registry = DeclawRegistry::default();
        assert!(!registry.register(ForeignAddr(10), ForeignAddr(10)));
        assert!(!registry.register(ForeignAddr(20), ForeignAddr(10)));
        assert!(registry.is_empty());
    }

    #[test]
    fn foreign_values_inside_ranges_break() {
        let mut registry = DeclawRegistry::default();
        assert!(registry.register(ForeignAddr(0x1000), ForeignAddr(0x2000)));
        assert_eq!(registry.check(Value::Foreign(ForeignAddr(0x1000))), Value::Broken);
        assert_eq!(registry.check(Value::Foreign(ForeignAddr(0x1fff))), Value::Broken);
        assert_eq!(
            registry.check(Value::Foreign(ForeignAddr(0x2000))),
            Value::Foreign(ForeignAddr(0x2000))
        );
        assert_eq!(registry.check(Value::Int(0x1800)), Value::Int(0x1800));
    }

    #[test]
    fn clear_drains_everything() {
        let mut registry = DeclawRegistry::default();
        registry.register(ForeignAddr(1), ForeignAddr(2));
        registry.register(ForeignAddr(5), ForeignAddr(9));
        assert_eq!(registry.clear(), 2);
        assert_eq!(registry.status(ForeignAddr(6)), ForeignStatus::Mapped);
    }
}
