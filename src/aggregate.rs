// ========================================================================================
//
//                              THE AGGREGATOR LIBRARY
//
// ========================================================================================
//
// ### Purpose ###
//
// Every statistic in the engine is expressed through one contract: an
// accumulator with `initial_state`, `absorb` (fold one chunk into a state),
// `combine` (merge two states), and `finalize` (consume the state into a
// value). `combine` MUST be associative and commutative; the executor leans on
// that to make results independent of chunking and merge order.
//
// Median gets two explicit contracts that are never unified silently:
//
//  - exact: a min/max/count pass, then counting-bin passes that narrow the
//    surviving interval until few enough candidates remain to materialize,
//    then an exact order-statistic selection;
//  - approximate: one histogram pass with a caller-chosen bin count, the
//    median interpolated inside its bin. Accuracy is bounded by bin width.

use crate::container::Container;
use crate::executor::{ChunkBlock, ExecuteOptions, ExecutorError, execute};
use crate::types::ChunkRange;
use log::debug;
use thiserror::Error;

/// Counting bins per narrowing pass of the exact median.
const EXACT_MEDIAN_BINS: usize = 1024;
/// Candidate values the exact median is willing to materialize at once.
const SELECT_WINDOW: u64 = 4096;
/// Hard cap on narrowing passes; with 1024-way narrowing this is never
/// reached for finite doubles, it only guards degenerate float intervals.
const MAX_NARROWING_PASSES: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccumulatorError {
    #[error("empty input: the statistic is undefined over zero observations")]
    EmptyInput,
    #[error(
        "design matrix is rank-deficient at column {column}; drop or regularize that predictor"
    )]
    SingularDesign { column: usize },
}

/// The absorb/combine/finalize contract every statistic implements.
///
/// `combine` must be associative and commutative. `absorb` may assume blocks
/// cover disjoint ranges; it never sees the same row twice in one reduction.
pub trait Accumulator: Send + Sync {
    type State: Send;
    type Output;

    /// The state of a reduction that has seen no data.
    fn initial_state(&self) -> Self::State;

    /// Folds one chunk into the state.
    fn absorb(&self, state: Self::State, block: &ChunkBlock)
    -> Result<Self::State, AccumulatorError>;

    /// Merges two independently accumulated states.
    fn combine(&self, a: Self::State, b: Self::State) -> Result<Self::State, AccumulatorError>;

    /// Consumes the state into the final value.
    fn finalize(&self, state: Self::State) -> Result<Self::Output, AccumulatorError>;
}

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Accumulator(#[from] AccumulatorError),
}

/// The statistics the engine exposes. Exact and approximate medians are
/// distinct variants on purpose: the caller always chooses, nothing falls
/// back between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Mean,
    /// Sample variance, ddof = 1.
    Variance,
    MedianExact,
    MedianApprox {
        bins: usize,
    },
}

// ========================================================================================
//                                        Mean
// ========================================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanState {
    pub sum: f64,
    pub count: u64,
}

pub struct MeanAccumulator;

impl Accumulator for MeanAccumulator {
    type State = MeanState;
    type Output = f64;

    fn initial_state(&self) -> MeanState {
        MeanState::default()
    }

    fn absorb(&self, mut state: MeanState, block: &ChunkBlock) -> Result<MeanState, AccumulatorError> {
        for &v in block.values() {
            state.sum += v;
        }
        state.count += block.values().len() as u64;
        Ok(state)
    }

    fn combine(&self, a: MeanState, b: MeanState) -> Result<MeanState, AccumulatorError> {
        Ok(MeanState {
            sum: a.sum + b.sum,
            count: a.count + b.count,
        })
    }

    fn finalize(&self, state: MeanState) -> Result<f64, AccumulatorError> {
        if state.count == 0 {
            return Err(AccumulatorError::EmptyInput);
        }
        Ok(state.sum / state.count as f64)
    }
}

// ========================================================================================
//                                      Variance
// ========================================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct VarianceState {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
}

/// Sample variance (ddof = 1) via the streaming Welford recurrence within a
/// chunk and the parallel-variance merge formula across chunks.
pub struct VarianceAccumulator;

impl Accumulator for VarianceAccumulator {
    type State = VarianceState;
    type Output = f64;

    fn initial_state(&self) -> VarianceState {
        VarianceState::default()
    }

    fn absorb(
        &self,
        mut state: VarianceState,
        block: &ChunkBlock,
    ) -> Result<VarianceState, AccumulatorError> {
        for &v in block.values() {
            state.count += 1;
            let delta = v - state.mean;
            state.mean += delta / state.count as f64;
            state.m2 += delta * (v - state.mean);
        }
        Ok(state)
    }

    fn combine(&self, a: VarianceState, b: VarianceState) -> Result<VarianceState, AccumulatorError> {
        if a.count == 0 {
            return Ok(b);
        }
        if b.count == 0 {
            return Ok(a);
        }
        let (na, nb) = (a.count as f64, b.count as f64);
        let n = na + nb;
        let delta = b.mean - a.mean;
        Ok(VarianceState {
            count: a.count + b.count,
            mean: a.mean + delta * nb / n,
            m2: a.m2 + b.m2 + delta * delta * na * nb / n,
        })
    }

    fn finalize(&self, state: VarianceState) -> Result<f64, AccumulatorError> {
        if state.count < 2 {
            return Err(AccumulatorError::EmptyInput);
        }
        Ok(state.m2 / (state.count - 1) as f64)
    }
}

// ========================================================================================
//                                   Min / max / count
// ========================================================================================

#[derive(Debug, Clone, Copy)]
pub struct MinMaxState {
    pub count: u64,
    pub min: f64,
    pub max: f64,
}

impl Default for MinMaxState {
    fn default() -> Self {
        Self {
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

/// Global range and count in one pass. Pass 1 of both median contracts.
pub struct MinMaxCountAccumulator;

impl Accumulator for MinMaxCountAccumulator {
    type State = MinMaxState;
    type Output = MinMaxState;

    fn initial_state(&self) -> MinMaxState {
        MinMaxState::default()
    }

    fn absorb(&self, mut state: MinMaxState, block: &ChunkBlock) -> Result<MinMaxState, AccumulatorError> {
        for &v in block.values() {
            state.min = state.min.min(v);
            state.max = state.max.max(v);
        }
        state.count += block.values().len() as u64;
        Ok(state)
    }

    fn combine(&self, a: MinMaxState, b: MinMaxState) -> Result<MinMaxState, AccumulatorError> {
        Ok(MinMaxState {
            count: a.count + b.count,
            min: a.min.min(b.min),
            max: a.max.max(b.max),
        })
    }

    fn finalize(&self, state: MinMaxState) -> Result<MinMaxState, AccumulatorError> {
        if state.count == 0 {
            return Err(AccumulatorError::EmptyInput);
        }
        Ok(state)
    }
}

// ========================================================================================
//                                  Counting histogram
// ========================================================================================

#[derive(Debug, Clone)]
pub struct HistogramState {
    /// Values strictly below the window.
    pub below: u64,
    /// Per-bin counts over `[lo, hi]`; values above the window are ignored.
    pub counts: Vec<u64>,
}

/// Counts values of a window `[lo, hi]` into equal-width bins; states merge by
/// summing bin counts. Used both as the approximate median's one histogram
/// pass and as the exact median's narrowing pass.
pub struct HistogramAccumulator {
    pub lo: f64,
    pub hi: f64,
    pub bins: usize,
}

impl HistogramAccumulator {
    #[inline]
    fn bin_of(&self, v: f64) -> usize {
        let width = self.hi - self.lo;
        if width <= 0.0 {
            return 0;
        }
        let idx = ((v - self.lo) / width * self.bins as f64) as usize;
        idx.min(self.bins - 1)
    }

    /// Lower edge of bin `b`.
    fn bin_lo(&self, b: usize) -> f64 {
        self.lo + (self.hi - self.lo) * b as f64 / self.bins as f64
    }

    /// Upper edge of bin `b`.
    fn bin_hi(&self, b: usize) -> f64 {
        self.lo + (self.hi - self.lo) * (b + 1) as f64 / self.bins as f64
    }
}

impl Accumulator for HistogramAccumulator {
    type State = HistogramState;
    type Output = HistogramState;

    fn initial_state(&self) -> HistogramState {
        HistogramState {
            below: 0,
            counts: vec![0; self.bins],
        }
    }

    fn absorb(
        &self,
        mut state: HistogramState,
        block: &ChunkBlock,
    ) -> Result<HistogramState, AccumulatorError> {
        for &v in block.values() {
            if v < self.lo {
                state.below += 1;
            } else if v <= self.hi {
                state.counts[self.bin_of(v)] += 1;
            }
        }
        Ok(state)
    }

    fn combine(
        &self,
        mut a: HistogramState,
        b: HistogramState,
    ) -> Result<HistogramState, AccumulatorError> {
        a.below += b.below;
        for (dst, src) in a.counts.iter_mut().zip(b.counts) {
            *dst += src;
        }
        Ok(a)
    }

    fn finalize(&self, state: HistogramState) -> Result<HistogramState, AccumulatorError> {
        Ok(state)
    }
}

// ========================================================================================
//                            Window collection (final pass)
// ========================================================================================

#[derive(Debug, Clone, Default)]
struct CollectState {
    below: u64,
    values: Vec<f64>,
}

/// Materializes every value inside `[lo, hi]` plus the count below it. Only
/// run once the narrowing passes have bounded the window population.
struct CollectAccumulator {
    lo: f64,
    hi: f64,
}

impl Accumulator for CollectAccumulator {
    type State = CollectState;
    type Output = CollectState;

    fn initial_state(&self) -> CollectState {
        CollectState::default()
    }

    fn absorb(&self, mut state: CollectState, block: &ChunkBlock) -> Result<CollectState, AccumulatorError> {
        for &v in block.values() {
            if v < self.lo {
                state.below += 1;
            } else if v <= self.hi {
                state.values.push(v);
            }
        }
        Ok(state)
    }

    fn combine(&self, mut a: CollectState, mut b: CollectState) -> Result<CollectState, AccumulatorError> {
        a.below += b.below;
        a.values.append(&mut b.values);
        Ok(a)
    }

    fn finalize(&self, state: CollectState) -> Result<CollectState, AccumulatorError> {
        Ok(state)
    }
}

// ========================================================================================
//                                   Median drivers
// ========================================================================================

/// The two order-statistic ranks (0-based) whose average is the median.
/// Equal for odd counts, the two middle ranks for even counts.
#[inline]
fn median_ranks(count: u64) -> (u64, u64) {
    ((count - 1) / 2, count / 2)
}

/// Exact median over arbitrary chunk partitions.
///
/// There is no O(1)-per-chunk exact merge for the median, so this runs
/// multiple reduction passes: min/max/count, then counting-bin passes that
/// narrow the interval containing the middle ranks, then one materializing
/// pass and an exact selection. Each pass is itself partition-independent.
pub fn median_exact(
    container: &Container,
    ranges: &[ChunkRange],
    columns: &[usize],
    options: &ExecuteOptions,
) -> Result<f64, AggregateError> {
    let mm = MinMaxCountAccumulator;
    let span = mm.finalize(execute(container, ranges, columns, &mm, options)?)?;
    if span.min == span.max {
        return Ok(span.min);
    }
    let (k1, k2) = median_ranks(span.count);

    let mut lo = span.min;
    let mut hi = span.max;
    for pass in 0..MAX_NARROWING_PASSES {
        let hist_acc = HistogramAccumulator {
            lo,
            hi,
            bins: EXACT_MEDIAN_BINS,
        };
        let hist = hist_acc.finalize(execute(container, ranges, columns, &hist_acc, options)?)?;

        let b1 = rank_bin(&hist, k1);
        let b2 = rank_bin(&hist, k2);
        let candidates: u64 = hist.counts[b1..=b2].iter().sum();
        let (cand_lo, cand_hi) = (hist_acc.bin_lo(b1), hist_acc.bin_hi(b2));
        debug!(
            "exact median pass {pass}: window [{cand_lo}, {cand_hi}] holds {candidates} candidates"
        );

        // Select once the window is small enough, or once it has degenerated
        // to a single representable value or stopped shrinking.
        let degenerate = cand_lo == cand_hi || (cand_lo == lo && cand_hi == hi);
        if degenerate || candidates <= SELECT_WINDOW {
            return collect_window(container, ranges, columns, options, cand_lo, cand_hi, k1, k2);
        }
        lo = cand_lo;
        hi = cand_hi;
    }
    // Interval stopped shrinking in float space; select whatever remains.
    collect_window(container, ranges, columns, options, lo, hi, k1, k2)
}

/// Bin holding global rank `k`, given the counts and the below-window total.
fn rank_bin(hist: &HistogramState, k: u64) -> usize {
    let mut seen = hist.below;
    for (b, &c) in hist.counts.iter().enumerate() {
        seen += c;
        if seen > k {
            return b;
        }
    }
    hist.counts.len() - 1
}

#[allow(clippy::too_many_arguments)]
fn collect_window(
    container: &Container,
    ranges: &[ChunkRange],
    columns: &[usize],
    options: &ExecuteOptions,
    lo: f64,
    hi: f64,
    k1: u64,
    k2: u64,
) -> Result<f64, AggregateError> {
    let collector = CollectAccumulator { lo, hi };
    let mut window =
        collector.finalize(execute(container, ranges, columns, &collector, options)?)?;
    if window.values.is_empty() {
        return Err(AccumulatorError::EmptyInput.into());
    }

    // Clamp for safety: the narrowing passes guarantee both ranks fall inside
    // the window unless the container was mutated between passes.
    let last = window.values.len() - 1;
    let i1 = (k1.saturating_sub(window.below) as usize).min(last);
    let i2 = (k2.saturating_sub(window.below) as usize).min(last);
    let (_, v1, _) = window.values.select_nth_unstable_by(i1, f64::total_cmp);
    let v1 = *v1;
    let (_, v2, _) = window.values.select_nth_unstable_by(i2, f64::total_cmp);
    let v2 = *v2;
    Ok((v1 + v2) / 2.0)
}

/// Approximate median: one histogram pass over the global range with a
/// caller-chosen bin count, interpolated within the winning bin. The error is
/// bounded by the bin width `(max - min) / bins`.
pub fn median_approx(
    container: &Container,
    ranges: &[ChunkRange],
    columns: &[usize],
    bins: usize,
    options: &ExecuteOptions,
) -> Result<f64, AggregateError> {
    let mm = MinMaxCountAccumulator;
    let span = mm.finalize(execute(container, ranges, columns, &mm, options)?)?;
    if span.min == span.max {
        return Ok(span.min);
    }

    let hist_acc = HistogramAccumulator {
        lo: span.min,
        hi: span.max,
        bins: bins.max(1),
    };
    let hist = hist_acc.finalize(execute(container, ranges, columns, &hist_acc, options)?)?;

    let target = span.count as f64 / 2.0;
    let mut cum = 0u64;
    for (b, &c) in hist.counts.iter().enumerate() {
        let next = cum + c;
        if next as f64 >= target && c > 0 {
            let into = (target - cum as f64) / c as f64;
            return Ok(hist_acc.bin_lo(b) + into * (hist_acc.bin_hi(b) - hist_acc.bin_lo(b)));
        }
        cum = next;
    }
    Ok(span.max)
}

/// Runs one scalar statistic over the selected column of a container.
pub fn compute(
    container: &Container,
    ranges: &[ChunkRange],
    columns: &[usize],
    statistic: Statistic,
    options: &ExecuteOptions,
) -> Result<f64, AggregateError> {
    match statistic {
        Statistic::Mean => {
            let acc = MeanAccumulator;
            Ok(acc.finalize(execute(container, ranges, columns, &acc, options)?)?)
        }
        Statistic::Variance => {
            let acc = VarianceAccumulator;
            Ok(acc.finalize(execute(container, ranges, columns, &acc, options)?)?)
        }
        Statistic::MedianExact => median_exact(container, ranges, columns, options),
        Statistic::MedianApprox { bins } => {
            median_approx(container, ranges, columns, bins, options)
        }
    }
}
