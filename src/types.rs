// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that are
// used in one file.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The token naming one physical region of backing storage.
///
/// A `BackingId` is allocated exactly once per region and is never duplicated by
/// aliasing: every handle that shares storage carries the *same* id. The
/// `#[repr(transparent)]` attribute guarantees this is a zero-cost abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BackingId(pub u64);

impl fmt::Display for BackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backing#{}", self.0)
    }
}

/// A half-open `[start, end)` index interval produced by the planner and consumed
/// exactly once by the executor. Indices are element indices for vector
/// containers and row indices for matrix containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: usize,
    pub end: usize,
}

impl ChunkRange {
    #[inline]
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "inverted chunk range {start}..{end}");
        Self { start, end }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The element type of a container. All chunk reads widen to `f64` for the
/// accumulators; the dtype controls the on-storage byte layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    #[inline]
    pub fn element_size(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
        };
        f.write_str(name)
    }
}

/// The logical shape of a container, fixed at creation. Resizing never happens
/// in place: a different shape means a different backing region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    /// A flat column of `len` elements.
    Vector { len: usize },
    /// A dense row-major table.
    Matrix { rows: usize, cols: usize },
}

impl Shape {
    #[inline]
    pub fn element_count(&self) -> usize {
        match *self {
            Shape::Vector { len } => len,
            Shape::Matrix { rows, cols } => rows * cols,
        }
    }

    /// The number of addressable units along the chunking axis: elements for
    /// vectors, rows for matrices.
    #[inline]
    pub fn chunk_axis_len(&self) -> usize {
        match *self {
            Shape::Vector { len } => len,
            Shape::Matrix { rows, .. } => rows,
        }
    }

    /// Elements per addressable unit along the chunking axis.
    #[inline]
    pub fn row_width(&self) -> usize {
        match *self {
            Shape::Vector { .. } => 1,
            Shape::Matrix { cols, .. } => cols,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Shape::Vector { len } => write!(f, "[{len}]"),
            Shape::Matrix { rows, cols } => write!(f, "[{rows} x {cols}]"),
        }
    }
}

/// How a length should be split into chunks. Both spellings produce the same
/// kind of plan; callers pick whichever constraint they actually have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Split into exactly this many chunks (the last may be shorter).
    ByCount(usize),
    /// Split into chunks of exactly this many units (the last may be shorter).
    BySize(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_range_length_and_emptiness() {
        let r = ChunkRange::new(5, 10);
        assert_eq!(r.len(), 5);
        assert!(!r.is_empty());
        assert!(ChunkRange::new(3, 3).is_empty());
    }

    #[test]
    fn shape_axis_accessors_distinguish_vector_and_matrix() {
        let v = Shape::Vector { len: 12 };
        assert_eq!(v.element_count(), 12);
        assert_eq!(v.chunk_axis_len(), 12);
        assert_eq!(v.row_width(), 1);

        let m = Shape::Matrix { rows: 4, cols: 3 };
        assert_eq!(m.element_count(), 12);
        assert_eq!(m.chunk_axis_len(), 4);
        assert_eq!(m.row_width(), 3);
    }

    #[test]
    fn dtype_sizes_match_storage_layout() {
        assert_eq!(DType::F32.element_size(), 4);
        assert_eq!(DType::F64.element_size(), 8);
        assert_eq!(DType::I32.element_size(), 4);
        assert_eq!(DType::I64.element_size(), 8);
    }
}
