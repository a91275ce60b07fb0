// ========================================================================================
//                                  The Chunk Planner
// ========================================================================================
//
// Turns a length and a partitioning request into an ordered, gap-free,
// overlap-free sequence of half-open ranges. Pure and deterministic: there is
// no hidden state, so identical inputs always yield identical plans, which is
// what lets the executor promise partition-independent results.

use crate::types::{ChunkRange, Partition};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanError {
    #[error("invalid partition argument: {0}")]
    InvalidArgument(String),
}

/// Plans chunk ranges covering `[0, total_length)`.
///
/// `ByCount(n)` uses a chunk size of `ceil(total_length / n)`; `BySize(s)` uses
/// `s` directly. Either way all ranges but the last have equal length, ranges
/// ascend, are pairwise disjoint, and their union is exactly
/// `[0, total_length)`. A zero length plans to an empty sequence.
pub fn plan(total_length: usize, partition: Partition) -> Result<Vec<ChunkRange>, PlanError> {
    let chunk_size = match partition {
        Partition::ByCount(n) => {
            if n < 1 {
                return Err(PlanError::InvalidArgument(
                    "chunk count must be at least 1".to_string(),
                ));
            }
            total_length.div_ceil(n)
        }
        Partition::BySize(s) => {
            if s < 1 {
                return Err(PlanError::InvalidArgument(
                    "chunk size must be at least 1".to_string(),
                ));
            }
            s
        }
    };

    if total_length == 0 {
        return Ok(Vec::new());
    }
    // A zero chunk_size can only arise from ByCount over a zero length, which
    // the branch above already handled.
    debug_assert!(chunk_size > 0);

    let mut ranges = Vec::with_capacity(total_length.div_ceil(chunk_size));
    let mut start = 0usize;
    while start < total_length {
        let end = (start + chunk_size).min(total_length);
        ranges.push(ChunkRange::new(start, end));
        start = end;
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Disjointness, ascending order, and exact coverage of [0, len).
    fn assert_covers(ranges: &[ChunkRange], total: usize) {
        let mut cursor = 0usize;
        for r in ranges {
            assert_eq!(r.start, cursor, "gap or overlap before {r}");
            assert!(r.start < r.end, "empty range {r} in plan");
            cursor = r.end;
        }
        assert_eq!(cursor, total, "plan does not cover the full length");
    }

    #[test]
    fn by_count_splits_23_into_5_with_a_short_tail() {
        let ranges = plan(23, Partition::ByCount(5)).unwrap();
        let expected: Vec<ChunkRange> = [(0, 5), (5, 10), (10, 15), (15, 20), (20, 23)]
            .iter()
            .map(|&(s, e)| ChunkRange::new(s, e))
            .collect();
        assert_eq!(ranges, expected);
        assert_covers(&ranges, 23);
    }

    #[test]
    fn by_size_covers_exactly() {
        let ranges = plan(10, Partition::BySize(4)).unwrap();
        assert_eq!(ranges.len(), 3);
        assert_covers(&ranges, 10);
        assert_eq!(ranges[2], ChunkRange::new(8, 10));
    }

    #[test]
    fn coverage_holds_across_many_lengths_and_counts() {
        for total in [1usize, 2, 7, 64, 100, 1023] {
            for n in 1..=12 {
                let ranges = plan(total, Partition::ByCount(n)).unwrap();
                assert_covers(&ranges, total);
                assert!(ranges.len() <= n);
            }
            for s in 1..=12 {
                let ranges = plan(total, Partition::BySize(s)).unwrap();
                assert_covers(&ranges, total);
            }
        }
    }

    #[test]
    fn zero_count_and_zero_size_are_invalid() {
        assert!(matches!(
            plan(10, Partition::ByCount(0)),
            Err(PlanError::InvalidArgument(_))
        ));
        assert!(matches!(
            plan(10, Partition::BySize(0)),
            Err(PlanError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_length_plans_to_nothing() {
        assert!(plan(0, Partition::ByCount(3)).unwrap().is_empty());
        assert!(plan(0, Partition::BySize(3)).unwrap().is_empty());
    }

    #[test]
    fn planning_is_deterministic() {
        let a = plan(1000, Partition::ByCount(7)).unwrap();
        let b = plan(1000, Partition::ByCount(7)).unwrap();
        assert_eq!(a, b);
    }
}
