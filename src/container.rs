// ========================================================================================
//
//                        SHARED, REFERENCE-COUNTED CONTAINERS
//
// ========================================================================================
//
// ### Purpose ###
//
// A `Container` is a lightweight, typed handle onto one backing-store region.
// Copying a handle copies the *reference*, never the data: every alias names the
// same `BackingId`, and a write through any alias is visible through all of
// them. There is no copy-on-write path. Storage is reclaimed deterministically:
// the region is freed at the exact moment the last handle referencing its
// identity goes away.
//
// The arena is the single authority on which identities are live, what their
// reference counts are, and whether a reduction pass currently holds the region
// read-only (in which case writes are rejected rather than racing the pass).

use crate::store::{BackingStore, StoreError, read_with_retry};
use crate::types::{BackingId, ChunkRange, DType, Shape};
use ahash::AHashSet;
use dashmap::DashMap;
use log::warn;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Fixed per-region bookkeeping overhead charged by [`size_of`].
pub const HEADER_BYTES: u64 = 16;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("shape {shape} is inconsistent with dtype {dtype}: {reason}")]
    ShapeMismatch {
        shape: Shape,
        dtype: DType,
        reason: String,
    },
    #[error("range {range} exceeds the container shape {shape}")]
    RangeOutOfBounds { range: ChunkRange, shape: Shape },
    #[error(
        "write to {id} rejected: {passes} reduction pass(es) hold the container read-only"
    )]
    WriteConflict { id: BackingId, passes: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ========================================================================================
//                                      The arena
// ========================================================================================

struct BackingEntry {
    refcount: usize,
    /// Number of in-flight reduction passes treating this region as immutable.
    active_passes: Arc<AtomicUsize>,
}

/// Owns the backing store and the liveness/refcount table for every identity.
pub struct ContainerArena {
    store: Arc<dyn BackingStore>,
    entries: DashMap<BackingId, BackingEntry, ahash::RandomState>,
}

impl ContainerArena {
    pub fn new(store: Arc<dyn BackingStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            entries: DashMap::default(),
        })
    }

    pub fn store(&self) -> &dyn BackingStore {
        self.store.as_ref()
    }

    /// Number of live backing identities. Used by tests and the CLI `info` path.
    pub fn live_regions(&self) -> usize {
        self.entries.len()
    }

    fn retain(&self, id: BackingId) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.refcount += 1;
        }
    }

    fn release(&self, id: BackingId) {
        let free_now = match self.entries.get_mut(&id) {
            Some(mut entry) => {
                entry.refcount -= 1;
                entry.refcount == 0
            }
            None => {
                warn!("release of unknown {id} ignored");
                return;
            }
        };
        if free_now {
            self.entries.remove(&id);
            if let Err(e) = self.store.free(id) {
                warn!("failed to free {id}: {e}");
            }
        }
    }

    fn passes_for(&self, id: BackingId) -> Option<Arc<AtomicUsize>> {
        self.entries
            .get(&id)
            .map(|entry| Arc::clone(&entry.active_passes))
    }
}

/// RAII witness that a reduction pass holds a region read-only. Writes through
/// any alias fail with `WriteConflict` while at least one guard is alive.
pub struct PassGuard {
    passes: Arc<AtomicUsize>,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.passes.fetch_sub(1, Ordering::SeqCst);
    }
}

// ========================================================================================
//                                     The handle
// ========================================================================================

/// A typed, reference-counted handle onto one backing region.
///
/// `Clone` is aliasing: the clone names the same region and bumps its reference
/// count. `Drop` is release: the region is freed when the count hits zero. The
/// shape and dtype are immutable for the lifetime of the identity.
pub struct Container {
    id: BackingId,
    dtype: DType,
    shape: Shape,
    arena: Arc<ContainerArena>,
}

impl Container {
    /// Allocates a fresh zero-filled region and returns the first handle onto it.
    pub fn create(
        arena: &Arc<ContainerArena>,
        shape: Shape,
        dtype: DType,
    ) -> Result<Self, ContainerError> {
        if let Shape::Matrix { rows, cols } = shape {
            // A matrix may be empty, but not half-empty: one zero dimension with
            // the other nonzero has no consistent row layout.
            if (rows == 0) != (cols == 0) {
                return Err(ContainerError::ShapeMismatch {
                    shape,
                    dtype,
                    reason: "one matrix dimension is zero while the other is not".to_string(),
                });
            }
        }
        let byte_len = shape
            .element_count()
            .checked_mul(dtype.element_size())
            .ok_or_else(|| ContainerError::ShapeMismatch {
                shape,
                dtype,
                reason: "byte length overflows usize".to_string(),
            })?;

        let id = arena.store.allocate(byte_len as u64)?;
        arena.entries.insert(
            id,
            BackingEntry {
                refcount: 1,
                active_passes: Arc::new(AtomicUsize::new(0)),
            },
        );
        Ok(Self {
            id,
            dtype,
            shape,
            arena: Arc::clone(arena),
        })
    }

    #[inline]
    pub fn backing_id(&self) -> BackingId {
        self.id
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Returns a new handle onto the same backing region. O(1), no data copy.
    pub fn alias(&self) -> Self {
        self.clone()
    }

    /// Consumes the handle, decrementing the reference count. The region is
    /// freed if this was the last handle. Equivalent to dropping, spelled out.
    pub fn release(self) {
        drop(self);
    }

    /// Marks the start of a reduction pass over this container. While the
    /// returned guard lives, `write_chunk` through *any* alias is rejected.
    pub fn begin_read_pass(&self) -> Result<PassGuard, ContainerError> {
        let passes = self
            .arena
            .passes_for(self.id)
            .ok_or(StoreError::UnknownBacking(self.id))?;
        passes.fetch_add(1, Ordering::SeqCst);
        Ok(PassGuard { passes })
    }

    fn check_range(&self, range: ChunkRange) -> Result<(), ContainerError> {
        if range.start > range.end || range.end > self.shape.chunk_axis_len() {
            return Err(ContainerError::RangeOutOfBounds {
                range,
                shape: self.shape,
            });
        }
        Ok(())
    }

    /// Reads one chunk (elements for vectors, rows for matrices), widened to
    /// `f64`, appending into `out`. `out` is cleared first so pooled buffers
    /// can be handed straight in.
    pub fn read_chunk_into(
        &self,
        range: ChunkRange,
        out: &mut Vec<f64>,
    ) -> Result<(), ContainerError> {
        self.check_range(range)?;
        out.clear();
        if range.is_empty() {
            return Ok(());
        }
        let width = self.shape.row_width();
        let elem = self.dtype.element_size();
        let offset = (range.start * width * elem) as u64;
        let byte_len = range.len() * width * elem;

        let mut bytes = vec![0u8; byte_len];
        read_with_retry(self.arena.store.as_ref(), self.id, offset, &mut bytes)?;
        decode_into(self.dtype, &bytes, out);
        Ok(())
    }

    /// Convenience wrapper over [`Self::read_chunk_into`].
    pub fn read_chunk(&self, range: ChunkRange) -> Result<Vec<f64>, ContainerError> {
        let mut out = Vec::with_capacity(range.len() * self.shape.row_width());
        self.read_chunk_into(range, &mut out)?;
        Ok(out)
    }

    /// Writes one chunk in place on the shared backing region. The write is
    /// observed through every alias of this handle. Rejected while a reduction
    /// pass is in flight.
    pub fn write_chunk(&self, range: ChunkRange, data: &[f64]) -> Result<(), ContainerError> {
        self.check_range(range)?;
        let width = self.shape.row_width();
        if data.len() != range.len() * width {
            return Err(ContainerError::ShapeMismatch {
                shape: self.shape,
                dtype: self.dtype,
                reason: format!(
                    "write of {} values into range {} expecting {}",
                    data.len(),
                    range,
                    range.len() * width
                ),
            });
        }
        let passes = self
            .arena
            .passes_for(self.id)
            .ok_or(StoreError::UnknownBacking(self.id))?;
        let active = passes.load(Ordering::SeqCst);
        if active > 0 {
            return Err(ContainerError::WriteConflict {
                id: self.id,
                passes: active,
            });
        }

        let elem = self.dtype.element_size();
        let offset = (range.start * width * elem) as u64;
        let bytes = encode(self.dtype, data);
        self.arena.store.write(self.id, offset, &bytes)?;
        Ok(())
    }
}

impl Container {
    /// Total bytes of the backing region.
    pub(crate) fn byte_len(&self) -> u64 {
        (self.shape.element_count() * self.dtype.element_size()) as u64
    }

    /// Raw byte read for persistence; bypasses dtype widening so saved blobs
    /// are bit-exact for every dtype.
    pub(crate) fn raw_read(&self, offset: u64, buf: &mut [u8]) -> Result<(), ContainerError> {
        read_with_retry(self.arena.store.as_ref(), self.id, offset, buf)?;
        Ok(())
    }

    /// Raw byte write for persistence. Subject to the same pass gating as
    /// `write_chunk`.
    pub(crate) fn raw_write(&self, offset: u64, data: &[u8]) -> Result<(), ContainerError> {
        let passes = self
            .arena
            .passes_for(self.id)
            .ok_or(StoreError::UnknownBacking(self.id))?;
        let active = passes.load(Ordering::SeqCst);
        if active > 0 {
            return Err(ContainerError::WriteConflict {
                id: self.id,
                passes: active,
            });
        }
        self.arena.store.write(self.id, offset, data)?;
        Ok(())
    }
}

impl Clone for Container {
    fn clone(&self) -> Self {
        self.arena.retain(self.id);
        Self {
            id: self.id,
            dtype: self.dtype,
            shape: self.shape,
            arena: Arc::clone(&self.arena),
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        self.arena.release(self.id);
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .finish()
    }
}

// ========================================================================================
//                              Quantized, deduplicated sizing
// ========================================================================================

/// Rounds a raw byte count up to its storage bucket: the next value in
/// {8, 16, 32, 64, 128}, and beyond 128 the next multiple of 8.
pub fn quantize(raw: u64) -> u64 {
    for bucket in [8u64, 16, 32, 64, 128] {
        if raw <= bucket {
            return bucket;
        }
    }
    raw.div_ceil(8) * 8
}

/// Total quantized bytes across the given handles, charging each distinct
/// backing identity exactly once no matter how many aliases reach it.
pub fn size_of<'a>(handles: impl IntoIterator<Item = &'a Container>) -> u64 {
    let mut visited: AHashSet<BackingId> = AHashSet::new();
    let mut total = 0u64;
    for handle in handles {
        if !visited.insert(handle.id) {
            continue;
        }
        let payload = (handle.shape.element_count() * handle.dtype.element_size()) as u64;
        total += quantize(HEADER_BYTES + payload);
    }
    total
}

// ========================================================================================
//                               Dtype encode / decode
// ========================================================================================

// Storage bytes are always little-endian, regardless of host order; the
// persistence manifest relies on this.

fn decode_into(dtype: DType, bytes: &[u8], out: &mut Vec<f64>) {
    match dtype {
        DType::F64 => out.extend(
            bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().unwrap())),
        ),
        DType::F32 => out.extend(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()) as f64),
        ),
        DType::I32 => out.extend(
            bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes(c.try_into().unwrap()) as f64),
        ),
        DType::I64 => out.extend(
            bytes
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes(c.try_into().unwrap()) as f64),
        ),
    }
}

fn encode(dtype: DType, values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * dtype.element_size());
    match dtype {
        DType::F64 => {
            for v in values {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        DType::F32 => {
            for v in values {
                bytes.extend_from_slice(&(*v as f32).to_le_bytes());
            }
        }
        DType::I32 => {
            for v in values {
                bytes.extend_from_slice(&(*v as i32).to_le_bytes());
            }
        }
        DType::I64 => {
            for v in values {
                bytes.extend_from_slice(&(*v as i64).to_le_bytes());
            }
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn arena() -> Arc<ContainerArena> {
        ContainerArena::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn alias_shares_the_backing_identity() {
        let arena = arena();
        let a = Container::create(&arena, Shape::Vector { len: 4 }, DType::F64).unwrap();
        let b = a.alias();
        assert_eq!(a.backing_id(), b.backing_id());
    }

    #[test]
    fn writes_through_one_alias_are_visible_through_another() {
        let arena = arena();
        let a = Container::create(&arena, Shape::Vector { len: 4 }, DType::F64).unwrap();
        let b = a.alias();

        b.write_chunk(ChunkRange::new(1, 3), &[2.5, -1.0]).unwrap();
        let seen = a.read_chunk(ChunkRange::new(0, 4)).unwrap();
        assert_eq!(seen, vec![0.0, 2.5, -1.0, 0.0]);
    }

    #[test]
    fn backing_region_survives_until_the_last_handle_drops() {
        let arena = arena();
        let a = Container::create(&arena, Shape::Vector { len: 2 }, DType::F32).unwrap();
        let b = a.alias();
        assert_eq!(arena.live_regions(), 1);

        a.release();
        assert_eq!(arena.live_regions(), 1);
        b.release();
        assert_eq!(arena.live_regions(), 0);
    }

    #[test]
    fn create_rejects_a_half_empty_matrix() {
        let arena = arena();
        assert!(matches!(
            Container::create(&arena, Shape::Matrix { rows: 3, cols: 0 }, DType::F64),
            Err(ContainerError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            Container::create(&arena, Shape::Matrix { rows: 0, cols: 3 }, DType::F64),
            Err(ContainerError::ShapeMismatch { .. })
        ));
        // Rejected before anything reached the store.
        assert_eq!(arena.live_regions(), 0);
    }

    #[test]
    fn create_rejects_a_byte_length_that_overflows() {
        let arena = arena();
        assert!(matches!(
            Container::create(&arena, Shape::Vector { len: usize::MAX }, DType::F64),
            Err(ContainerError::ShapeMismatch { .. })
        ));
        assert_eq!(arena.live_regions(), 0);
    }

    #[test]
    fn read_rejects_ranges_beyond_the_shape() {
        let arena = arena();
        let c = Container::create(&arena, Shape::Vector { len: 3 }, DType::F64).unwrap();
        assert!(matches!(
            c.read_chunk(ChunkRange::new(1, 4)),
            Err(ContainerError::RangeOutOfBounds { .. })
        ));
    }

    #[test]
    fn write_is_rejected_while_a_read_pass_is_in_flight() {
        let arena = arena();
        let c = Container::create(&arena, Shape::Vector { len: 4 }, DType::F64).unwrap();
        let guard = c.begin_read_pass().unwrap();
        assert!(matches!(
            c.write_chunk(ChunkRange::new(0, 1), &[1.0]),
            Err(ContainerError::WriteConflict { .. })
        ));
        drop(guard);
        c.write_chunk(ChunkRange::new(0, 1), &[1.0]).unwrap();
    }

    #[test]
    fn matrix_rows_round_trip_through_typed_storage() {
        let arena = arena();
        let m = Container::create(&arena, Shape::Matrix { rows: 3, cols: 2 }, DType::I32).unwrap();
        m.write_chunk(ChunkRange::new(0, 3), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        assert_eq!(
            m.read_chunk(ChunkRange::new(1, 3)).unwrap(),
            vec![3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn quantize_follows_the_bucket_ladder() {
        assert_eq!(quantize(0), 8);
        assert_eq!(quantize(8), 8);
        assert_eq!(quantize(9), 16);
        assert_eq!(quantize(33), 64);
        assert_eq!(quantize(128), 128);
        assert_eq!(quantize(129), 136);
        assert_eq!(quantize(4_000_016), 4_000_016);
    }

    #[test]
    fn size_of_counts_each_identity_once() {
        let arena = arena();
        let a = Container::create(&arena, Shape::Vector { len: 10 }, DType::F64).unwrap();
        let b = a.alias();
        let c = Container::create(&arena, Shape::Vector { len: 10 }, DType::F64).unwrap();

        let one = size_of([&a]);
        assert_eq!(size_of([&a, &b]), one);
        assert_eq!(size_of([&a, &c]), one + size_of([&c]));
    }

    #[test]
    fn million_element_container_reports_the_quantized_size() {
        let arena = arena();
        let c =
            Container::create(&arena, Shape::Vector { len: 1_000_000 }, DType::F32).unwrap();
        assert_eq!(size_of([&c]), 4_000_016);
    }
}
