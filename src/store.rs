// ========================================================================================
//
//                              THE DURABLE BYTE STORE
//
// ========================================================================================
//
// ### Purpose ###
//
// This module owns physical byte storage. Everything above it speaks in terms of
// opaque `BackingId` tokens and byte ranges; nothing above it ever touches a path
// or a file descriptor. Two drivers are provided: an in-memory arena (tests,
// small data) and a file-backed spool whose reads go through `memmap2`.
//
// Reads are wrapped in a bounded-retry loop with exponential backoff so that a
// flaky device surfaces as `StorageUnavailable` after a fixed number of attempts
// instead of blocking a reduction pass indefinitely.

use crate::types::BackingId;
use dashmap::DashMap;
use log::warn;
use memmap2::Mmap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Maximum read attempts against the backing device before giving up.
const MAX_READ_ATTEMPTS: u32 = 4;
/// Backoff before the second attempt; doubles on every further attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unknown backing identity {0} (already freed, or from another store)")]
    UnknownBacking(BackingId),
    #[error("access of {requested} bytes at offset {offset} exceeds the {region_len}-byte region of {id}")]
    OutOfBounds {
        id: BackingId,
        offset: u64,
        requested: usize,
        region_len: u64,
    },
    #[error("backing storage unavailable after {attempts} read attempts: {last}")]
    StorageUnavailable { attempts: u32, last: String },
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether a retry against the same region could plausibly succeed.
    /// Argument errors and freed identities never become valid by waiting.
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

/// Durable byte storage addressed by opaque identity. Implementations must be
/// safe to share across the producer thread and rayon workers.
pub trait BackingStore: Send + Sync {
    /// Reserves a fresh zero-filled region and returns its identity.
    fn allocate(&self, len: u64) -> Result<BackingId, StoreError>;

    /// Fills `buf` from `offset` within the region. One attempt, no retry;
    /// callers wanting resilience go through [`read_with_retry`].
    fn read(&self, id: BackingId, offset: u64, buf: &mut [u8]) -> Result<(), StoreError>;

    /// Overwrites bytes at `offset` within the region.
    fn write(&self, id: BackingId, offset: u64, data: &[u8]) -> Result<(), StoreError>;

    /// Releases the region. The identity is dead afterwards.
    fn free(&self, id: BackingId) -> Result<(), StoreError>;

    /// The byte length of the region.
    fn region_len(&self, id: BackingId) -> Result<u64, StoreError>;
}

/// Reads with bounded retry and exponential backoff. Transient failures are
/// retried up to [`MAX_READ_ATTEMPTS`] times; exhaustion surfaces as
/// [`StoreError::StorageUnavailable`]. Non-transient errors propagate at once.
pub fn read_with_retry(
    store: &dyn BackingStore,
    id: BackingId,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), StoreError> {
    let mut delay = RETRY_BASE_DELAY;
    let mut last_error = String::new();
    for attempt in 1..=MAX_READ_ATTEMPTS {
        match store.read(id, offset, buf) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                warn!("read attempt {attempt}/{MAX_READ_ATTEMPTS} on {id} failed: {e}");
                last_error = e.to_string();
                if attempt < MAX_READ_ATTEMPTS {
                    thread::sleep(delay);
                    delay *= 2;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::StorageUnavailable {
        attempts: MAX_READ_ATTEMPTS,
        last: last_error,
    })
}

// ========================================================================================
//                                 In-memory arena store
// ========================================================================================

/// A heap-backed store. Regions live in a concurrent map keyed by identity.
#[derive(Debug, Default)]
pub struct MemoryStore {
    regions: DashMap<BackingId, Vec<u8>, ahash::RandomState>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint_id(&self) -> BackingId {
        BackingId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

fn check_bounds(
    id: BackingId,
    offset: u64,
    requested: usize,
    region_len: u64,
) -> Result<(), StoreError> {
    let end = offset
        .checked_add(requested as u64)
        .ok_or(StoreError::OutOfBounds {
            id,
            offset,
            requested,
            region_len,
        })?;
    if end > region_len {
        return Err(StoreError::OutOfBounds {
            id,
            offset,
            requested,
            region_len,
        });
    }
    Ok(())
}

impl BackingStore for MemoryStore {
    fn allocate(&self, len: u64) -> Result<BackingId, StoreError> {
        let id = self.mint_id();
        self.regions.insert(id, vec![0u8; len as usize]);
        Ok(id)
    }

    fn read(&self, id: BackingId, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        let region = self
            .regions
            .get(&id)
            .ok_or(StoreError::UnknownBacking(id))?;
        check_bounds(id, offset, buf.len(), region.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&region[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, id: BackingId, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        let mut region = self
            .regions
            .get_mut(&id)
            .ok_or(StoreError::UnknownBacking(id))?;
        check_bounds(id, offset, data.len(), region.len() as u64)?;
        let start = offset as usize;
        region[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn free(&self, id: BackingId) -> Result<(), StoreError> {
        self.regions
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::UnknownBacking(id))
    }

    fn region_len(&self, id: BackingId) -> Result<u64, StoreError> {
        self.regions
            .get(&id)
            .map(|r| r.len() as u64)
            .ok_or(StoreError::UnknownBacking(id))
    }
}

// ========================================================================================
//                                 File-backed spool store
// ========================================================================================

#[derive(Debug)]
struct SpoolRegion {
    path: PathBuf,
    len: u64,
}

/// A store spooling each region to its own file under a directory. Reads go
/// through a cached memory map per region; the map is dropped on every write
/// and lazily rebuilt, so readers never observe a stale length.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    regions: DashMap<BackingId, SpoolRegion, ahash::RandomState>,
    maps: DashMap<BackingId, Arc<Mmap>, ahash::RandomState>,
    next_id: AtomicU64,
}

impl FileStore {
    /// Opens (creating if needed) a spool directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            regions: DashMap::default(),
            maps: DashMap::default(),
            next_id: AtomicU64::new(0),
        })
    }

    fn map_for(&self, id: BackingId, path: &PathBuf) -> Result<Arc<Mmap>, StoreError> {
        if let Some(map) = self.maps.get(&id) {
            return Ok(Arc::clone(&map));
        }
        let file = File::open(path)?;
        let map = Arc::new(unsafe { Mmap::map(&file)? });
        self.maps.insert(id, Arc::clone(&map));
        Ok(map)
    }
}

impl BackingStore for FileStore {
    fn allocate(&self, len: u64) -> Result<BackingId, StoreError> {
        let id = BackingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let path = self.dir.join(format!("region-{}.bin", id.0));
        let file = File::create(&path)?;
        file.set_len(len)?;
        self.regions.insert(id, SpoolRegion { path, len });
        Ok(id)
    }

    fn read(&self, id: BackingId, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        let (path, len) = {
            let region = self
                .regions
                .get(&id)
                .ok_or(StoreError::UnknownBacking(id))?;
            (region.path.clone(), region.len)
        };
        check_bounds(id, offset, buf.len(), len)?;
        if buf.is_empty() {
            return Ok(());
        }
        let map = self.map_for(id, &path)?;
        let start = offset as usize;
        buf.copy_from_slice(&map[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, id: BackingId, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        let region = self
            .regions
            .get(&id)
            .ok_or(StoreError::UnknownBacking(id))?;
        check_bounds(id, offset, data.len(), region.len)?;
        // Invalidate the cached map before touching the file.
        self.maps.remove(&id);
        let mut file = OpenOptions::new().write(true).open(&region.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn free(&self, id: BackingId) -> Result<(), StoreError> {
        self.maps.remove(&id);
        let (_, region) = self
            .regions
            .remove(&id)
            .ok_or(StoreError::UnknownBacking(id))?;
        fs::remove_file(&region.path)?;
        Ok(())
    }

    fn region_len(&self, id: BackingId) -> Result<u64, StoreError> {
        self.regions
            .get(&id)
            .map(|r| r.len)
            .ok_or(StoreError::UnknownBacking(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` reads with a transient I/O error, then
    /// behaves like the wrapped memory store.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn failing(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    impl BackingStore for FlakyStore {
        fn allocate(&self, len: u64) -> Result<BackingId, StoreError> {
            self.inner.allocate(len)
        }

        fn read(&self, id: BackingId, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
            let remaining = self.failures.load(Ordering::Relaxed);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::Relaxed);
                return Err(StoreError::Io(std::io::Error::new(
                    ErrorKind::Interrupted,
                    "device hiccup",
                )));
            }
            self.inner.read(id, offset, buf)
        }

        fn write(&self, id: BackingId, offset: u64, data: &[u8]) -> Result<(), StoreError> {
            self.inner.write(id, offset, data)
        }

        fn free(&self, id: BackingId) -> Result<(), StoreError> {
            self.inner.free(id)
        }

        fn region_len(&self, id: BackingId) -> Result<u64, StoreError> {
            self.inner.region_len(id)
        }
    }

    #[test]
    fn memory_store_round_trips_bytes() {
        let store = MemoryStore::new();
        let id = store.allocate(8).unwrap();
        store.write(id, 2, &[1, 2, 3]).unwrap();

        let mut buf = [0u8; 8];
        store.read(id, 0, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 1, 2, 3, 0, 0, 0]);
    }

    #[test]
    fn memory_store_rejects_out_of_bounds_access() {
        let store = MemoryStore::new();
        let id = store.allocate(4).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            store.read(id, 2, &mut buf),
            Err(StoreError::OutOfBounds { .. })
        ));
        assert!(matches!(
            store.write(id, 4, &[9]),
            Err(StoreError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn freed_identity_is_dead() {
        let store = MemoryStore::new();
        let id = store.allocate(4).unwrap();
        store.free(id).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(
            store.read(id, 0, &mut buf),
            Err(StoreError::UnknownBacking(_))
        ));
        assert!(matches!(
            store.free(id),
            Err(StoreError::UnknownBacking(_))
        ));
    }

    #[test]
    fn retry_recovers_from_transient_read_failures() {
        let store = FlakyStore::failing(MAX_READ_ATTEMPTS - 2);
        let id = store.allocate(4).unwrap();
        store.write(id, 0, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        read_with_retry(&store, id, 0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn retry_exhaustion_surfaces_storage_unavailable() {
        let store = FlakyStore::failing(MAX_READ_ATTEMPTS);
        let id = store.allocate(4).unwrap();

        let mut buf = [0u8; 4];
        match read_with_retry(&store, id, 0, &mut buf) {
            Err(StoreError::StorageUnavailable { attempts, last }) => {
                assert_eq!(attempts, MAX_READ_ATTEMPTS);
                assert!(last.contains("device hiccup"), "last error was '{last}'");
            }
            other => panic!("expected StorageUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn retry_does_not_mask_non_transient_errors() {
        let store = MemoryStore::new();
        let id = store.allocate(2).unwrap();
        store.free(id).unwrap();

        let mut buf = [0u8; 2];
        assert!(matches!(
            read_with_retry(&store, id, 0, &mut buf),
            Err(StoreError::UnknownBacking(_))
        ));
    }

    #[test]
    fn file_store_round_trips_and_sees_writes_through_fresh_maps() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let id = store.allocate(16).unwrap();

        store.write(id, 0, &[7u8; 16]).unwrap();
        let mut buf = [0u8; 16];
        store.read(id, 0, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 16]);

        // Write after a read must invalidate the cached map.
        store.write(id, 8, &[9u8; 8]).unwrap();
        store.read(id, 0, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[7u8; 8]);
        assert_eq!(&buf[8..], &[9u8; 8]);
    }

    #[test]
    fn file_store_free_removes_the_spool_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let id = store.allocate(4).unwrap();
        store.free(id).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
