//! Error types for the object heap.

use thiserror::Error;

/// Errors that can occur during heap operations.
///
/// `TypeMismatch`, `ReadOnly`, `OutOfRange`, `NotAPointer` and the lookup
/// failures are ordinary typed failures for the caller. The variants reported
/// by [`HeapError::is_fatal`] abort the unit of work that triggered them;
/// `HeapCorruption` additionally poisons the heap.
///
/// # Examples
///
/// ```
/// use frameheap::error::{HeapError, HeapResult};
///
/// let oom = HeapError::OutOfMemory { requested: 64 };
/// assert!(oom.is_fatal());
/// assert!(!HeapError::ReadOnly.is_fatal());
///
/// let failure: HeapResult<u32> = Err(HeapError::NotAPointer);
/// assert!(failure.is_err());
/// assert_eq!(HeapError::ReadOnly.to_string(), "Object is read-only");
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("Out of memory: cannot allocate {requested} slots")]
    OutOfMemory { requested: usize },
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("Object is read-only")]
    ReadOnly,
    #[error("Length {length} exceeds maximum {max}")]
    OutOfRange { length: usize, max: usize },
    #[error("Index {index} out of bounds for length {length}")]
    IndexOutOfBounds { index: usize, length: usize },
    #[error("Value is not a heap reference")]
    NotAPointer,
    #[error("Object is locked and cannot be moved or replaced")]
    ObjectLocked,
    #[error("Reference is from an earlier heap epoch")]
    StaleReference,
    #[error("Handle is not allocated")]
    InvalidHandle,
    #[error("Root is not registered")]
    UnknownRoot,
    #[error("Callback object is not registered")]
    UnknownCallback,
    #[error("Indirect binary callback table is not registered")]
    UnknownProcs,
    #[error("Heap corruption: {0}")]
    HeapCorruption(String),
    #[error("Collection requested while a collection is active")]
    ReentrantCollection,
    #[error("Invalid heap configuration: {0}")]
    InvalidConfig(String),
}

impl HeapError {
    /// Fatal errors terminate the operation that raised them and must reach a
    /// top-level handler.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HeapError::OutOfMemory { .. }
                | HeapError::HeapCorruption(_)
                | HeapError::ReentrantCollection
                | HeapError::ObjectLocked
        )
    }

    pub(crate) fn type_mismatch(expected: &'static str, found: &'static str) -> Self {
        HeapError::TypeMismatch { expected, found }
    }
}

/// Result type for heap operations.
pub type HeapResult<T> = Result<T, HeapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_readable_messages() {
        let cases = [
            (
                HeapError::OutOfMemory { requested: 12 },
                "Out of memory: cannot allocate 12 slots",
            ),
            (
                HeapError::type_mismatch("array", "binary"),
                "Type mismatch: expected array, found binary",
            ),
            (
                HeapError::OutOfRange { length: 9, max: 8 },
                "Length 9 exceeds maximum 8",
            ),
            (HeapError::NotAPointer, "Value is not a heap reference"),
            (
                HeapError::HeapCorruption("bad span".into()),
                "Heap corruption: bad span",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn fatal_classification() {
        assert!(HeapError::ReentrantCollection.is_fatal());
        assert!(HeapError::HeapCorruption(String::new()).is_fatal());
        assert!(HeapError::ObjectLocked.is_fatal());
        assert!(!HeapError::NotAPointer.is_fatal());
        assert!(!HeapError::StaleReference.is_fatal());
        assert!(!HeapError::IndexOutOfBounds { index: 1, length: 0 }.is_fatal());
    }
}
