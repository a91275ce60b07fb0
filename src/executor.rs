// ========================================================================================
//
//                            THE CHUNK REDUCTION PIPELINE
//
// ========================================================================================
//
// ### Purpose ###
//
// This module drives a planned sequence of chunk ranges against a container and
// reduces them through an accumulator. A single producer thread reads chunks
// into pooled buffers and sends them down a bounded channel (natural
// backpressure if workers cannot keep up); rayon workers fold `absorb` into
// per-worker states over disjoint ranges; the coordinator then merges the
// worker states with `combine`, whose required associativity and commutativity
// make the result independent of partition, worker count, and merge order.
//
// Failure is all-or-nothing: any read, absorb, or combine failure aborts the
// whole reduction and discards every partial state. A half-completed aggregate
// is indistinguishable from a complete one, so none is ever returned.

use crate::aggregate::Accumulator;
use crate::container::Container;
use crate::types::ChunkRange;
use crossbeam_channel::bounded;
use crossbeam_queue::ArrayQueue;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;
use rayon::prelude::*;
use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use thiserror::Error;

// --- Pipeline Tuning Parameters ---

/// The maximum number of in-flight chunk blocks buffered in the channel.
/// Provides backpressure against a fast producer.
const CHANNEL_BOUND: usize = 64;
/// Reusable chunk buffers per worker.
const BUFFERS_PER_WORKER: usize = 4;

/// Process-wide byte count of live in-memory chunk buffers. This deliberately
/// excludes everything else the process allocates; it answers "how much chunk
/// data is resident right now", not "how big is the process".
static RESIDENT_CHUNK_BYTES: AtomicU64 = AtomicU64::new(0);

/// Current bytes held by live chunk buffers (pooled or in flight).
pub fn resident_memory() -> u64 {
    RESIDENT_CHUNK_BYTES.load(Ordering::Relaxed)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("chunk {range} failed: {cause}")]
    ChunkProcessing { range: ChunkRange, cause: String },
    #[error("merging partial states failed: {cause}")]
    Combine { cause: String },
    #[error("reduction cancelled; all partial state discarded")]
    Cancelled,
}

// ========================================================================================
//                           Tracked buffers and chunk blocks
// ========================================================================================

/// A `Vec<f64>` whose capacity is charged against the resident-memory counter
/// for as long as it lives, whether in flight or parked in the pool.
#[derive(Debug, Default)]
struct TrackedBuf {
    inner: Vec<f64>,
    accounted: u64,
}

impl TrackedBuf {
    /// Re-syncs the counter after the capacity may have grown.
    fn settle(&mut self) {
        let now = (self.inner.capacity() * std::mem::size_of::<f64>()) as u64;
        if now > self.accounted {
            RESIDENT_CHUNK_BYTES.fetch_add(now - self.accounted, Ordering::Relaxed);
        } else {
            RESIDENT_CHUNK_BYTES.fetch_sub(self.accounted - now, Ordering::Relaxed);
        }
        self.accounted = now;
    }
}

impl Drop for TrackedBuf {
    fn drop(&mut self) {
        RESIDENT_CHUNK_BYTES.fetch_sub(self.accounted, Ordering::Relaxed);
    }
}

/// One chunk's worth of data on its way from the producer to a worker: the
/// selected column values for every index in `range`, row-major, `cols` wide.
#[derive(Debug)]
pub struct ChunkBlock {
    range: ChunkRange,
    cols: usize,
    buf: TrackedBuf,
}

impl ChunkBlock {
    #[inline]
    pub fn range(&self) -> ChunkRange {
        self.range
    }

    /// Width of each row in `values`.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.buf.inner
    }

    /// Iterates the block row by row.
    #[inline]
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.buf.inner.chunks_exact(self.cols)
    }

    /// Builds a block from raw values. Used by accumulator unit tests; the
    /// pipeline itself fills pooled buffers.
    pub fn from_values(range: ChunkRange, cols: usize, values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), range.len() * cols);
        let mut buf = TrackedBuf {
            inner: values,
            accounted: 0,
        };
        buf.settle();
        Self { range, cols, buf }
    }

    /// Hands the underlying buffer back to the pool once the block is absorbed.
    fn recycle(self, pool: &ArrayQueue<TrackedBuf>) {
        let _ = pool.push(self.buf);
    }
}

// ========================================================================================
//                                   Pipeline options
// ========================================================================================

/// Knobs for one reduction pass. The default runs on the global rayon pool
/// with no cancellation hook and a progress bar only when stderr is a tty.
#[derive(Debug, Default, Clone)]
pub struct ExecuteOptions {
    /// Worker threads; 0 means the global rayon pool decides.
    pub workers: usize,
    /// Cooperative cancellation flag, checked between chunks. Cancellation
    /// leaves the backing store untouched and discards all in-flight state.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Progress-bar label; `None` disables progress reporting entirely.
    pub progress: Option<String>,
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message(message.to_string());
    pb
}

// ========================================================================================
//                                    The reduction
// ========================================================================================

/// Runs one all-or-nothing reduction pass over `ranges`.
///
/// `columns` selects which container columns land in each block, in order; an
/// empty slice selects every column. The container is held read-only for the
/// whole pass: concurrent `write_chunk` calls through any alias are rejected
/// until this function returns.
pub fn execute<A: Accumulator>(
    container: &Container,
    ranges: &[ChunkRange],
    columns: &[usize],
    accumulator: &A,
    options: &ExecuteOptions,
) -> Result<A::State, ExecutorError> {
    if ranges.is_empty() {
        return Ok(accumulator.initial_state());
    }

    let pass_guard = container
        .begin_read_pass()
        .map_err(|e| ExecutorError::ChunkProcessing {
            range: ranges[0],
            cause: e.to_string(),
        })?;

    let workers = if options.workers > 0 {
        options.workers
    } else {
        num_cpus::get().max(1)
    };
    debug!(
        "reduction pass over {} chunks of {:?} with {workers} workers",
        ranges.len(),
        container.backing_id()
    );

    let pool = ArrayQueue::new(workers * BUFFERS_PER_WORKER);
    for _ in 0..pool.capacity() {
        let _ = pool.push(TrackedBuf::default());
    }

    let (tx, rx) = bounded::<Result<ChunkBlock, ExecutorError>>(CHANNEL_BOUND);
    let pb = options
        .progress
        .as_deref()
        .map(|msg| create_progress_bar(ranges.len() as u64, msg));

    let states: Result<Vec<A::State>, ExecutorError> = thread::scope(|scope| {
        // --- Producer: reads chunks into pooled buffers, honoring backpressure ---
        let producer_pb = pb.clone();
        let producer_pool = &pool;
        scope.spawn(move || {
            let mut scratch: Vec<f64> = Vec::new();
            for &range in ranges {
                if let Some(cancel) = &options.cancel {
                    if cancel.load(Ordering::Relaxed) {
                        let _ = tx.send(Err(ExecutorError::Cancelled));
                        return;
                    }
                }

                let mut buf = producer_pool.pop().unwrap_or_default();
                let filled = fill_block(container, range, columns, &mut scratch, &mut buf);
                let item = match filled {
                    Ok(cols) => Ok(ChunkBlock { range, cols, buf }),
                    Err(cause) => Err(ExecutorError::ChunkProcessing { range, cause }),
                };
                let failed = item.is_err();
                if tx.send(item).is_err() {
                    // Workers have disconnected; not an error, just stop.
                    return;
                }
                if failed {
                    return;
                }
                if let Some(pb) = &producer_pb {
                    pb.inc(1);
                }
            }
        });

        // --- Workers: fold absorb into per-worker states ---
        let run = || {
            rx.into_iter()
                .par_bridge()
                .try_fold(
                    || accumulator.initial_state(),
                    |state, item| {
                        let block = item?;
                        let next = accumulator.absorb(state, &block).map_err(|e| {
                            ExecutorError::ChunkProcessing {
                                range: block.range,
                                cause: e.to_string(),
                            }
                        })?;
                        block.recycle(&pool);
                        Ok(next)
                    },
                )
                .collect::<Result<Vec<A::State>, ExecutorError>>()
        };
        if options.workers > 0 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| ExecutorError::Combine {
                    cause: format!("worker pool construction failed: {e}"),
                })?
                .install(run)
        } else {
            run()
        }
    });

    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    drop(pass_guard);

    // --- Coordinator: single-threaded merge of the worker states ---
    let mut states = states?;
    let mut merged = match states.pop() {
        Some(s) => s,
        None => accumulator.initial_state(),
    };
    for state in states {
        merged = accumulator
            .combine(merged, state)
            .map_err(|e| ExecutorError::Combine {
                cause: e.to_string(),
            })?;
    }
    Ok(merged)
}

/// Reads `range` from the container, gathering `columns` into `buf`. Returns
/// the block width. An empty selection takes every column as stored.
fn fill_block(
    container: &Container,
    range: ChunkRange,
    columns: &[usize],
    scratch: &mut Vec<f64>,
    buf: &mut TrackedBuf,
) -> Result<usize, String> {
    let width = container.shape().row_width();
    if columns.is_empty() {
        container
            .read_chunk_into(range, &mut buf.inner)
            .map_err(|e| e.to_string())?;
        buf.settle();
        return Ok(width);
    }

    if let Some(&bad) = columns.iter().find(|&&c| c >= width) {
        return Err(format!("column {bad} out of bounds for width {width}"));
    }
    container
        .read_chunk_into(range, scratch)
        .map_err(|e| e.to_string())?;
    buf.inner.clear();
    buf.inner.reserve(range.len() * columns.len());
    for row in scratch.chunks_exact(width) {
        for &c in columns {
            buf.inner.push(row[c]);
        }
    }
    buf.settle();
    Ok(columns.len())
}
