// ========================================================================================
//
//                         IMPORT AND PERSISTENCE BOUNDARY
//
// ========================================================================================
//
// ### Purpose ###
//
// This module is the only place external representations enter or leave the
// engine. Import reads delimited text in two passes: count the rows, allocate
// the exact container, then stream row blocks in. Peak memory is bounded by
// the block size rather than the file size. Failures are assumed to be
// user-input errors and carry row/column context.
//
// Persistence writes a TOML manifest next to a raw little-endian blob. `load`
// refuses anything it cannot faithfully reconstruct: a different format
// version, a foreign byte order, a blob whose size disagrees with the
// manifest. Rejecting loudly beats deserializing garbage quietly.

use crate::container::{Container, ContainerArena, ContainerError};
use crate::types::{ChunkRange, DType, Shape};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// On-disk format version; bump on any layout change.
const FORMAT_VERSION: u32 = 1;
/// Rows buffered per `write_chunk` during import and per read during save.
const BLOCK_ROWS: usize = 4096;
/// The engine stores and persists little-endian bytes only.
const ENDIANNESS: &str = "little";

#[derive(Error, Debug)]
pub enum IoError {
    #[error("cannot load '{path}': {reason}")]
    Portability { path: PathBuf, reason: String },
    #[error("row {row}, column {column}: '{field}' is not a number")]
    Parse {
        row: usize,
        column: usize,
        field: String,
    },
    #[error("row {row} has {found} fields, expected {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("input contains no data rows")]
    EmptyTable,
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("manifest is not valid TOML: {0}")]
    ManifestParse(#[from] toml::de::Error),
    #[error("manifest could not be written: {0}")]
    ManifestWrite(#[from] toml::ser::Error),
}

/// Delimited-text import settings.
#[derive(Debug, Clone, Copy)]
pub struct TextFormat {
    pub delimiter: u8,
    pub has_header: bool,
}

impl TextFormat {
    pub fn csv() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
        }
    }

    pub fn tsv() -> Self {
        Self {
            delimiter: b'\t',
            has_header: true,
        }
    }
}

// ========================================================================================
//                                Delimited-text import
// ========================================================================================

fn reader(path: &Path, format: TextFormat) -> Result<csv::Reader<File>, IoError> {
    Ok(csv::ReaderBuilder::new()
        .delimiter(format.delimiter)
        .has_headers(format.has_header)
        .flexible(true)
        .from_path(path)?)
}

/// Imports a delimited text file into a fresh matrix container.
///
/// Every field must parse as a number; the dtype only controls the storage
/// layout. Two passes keep peak memory at `BLOCK_ROWS` rows regardless of
/// file size.
pub fn open(
    arena: &Arc<ContainerArena>,
    path: &Path,
    format: TextFormat,
    dtype: DType,
) -> Result<Container, IoError> {
    // Pass 1: shape discovery.
    let mut rows = 0usize;
    let mut cols = 0usize;
    for record in reader(path, format)?.byte_records() {
        let record = record?;
        if rows == 0 {
            cols = record.len();
        }
        rows += 1;
    }
    if rows == 0 {
        return Err(IoError::EmptyTable);
    }
    info!("importing {path:?}: {rows} rows x {cols} columns as {dtype}");

    let container = Container::create(arena, Shape::Matrix { rows, cols }, dtype)?;

    // Pass 2: parse and stream blocks in.
    let mut block: Vec<f64> = Vec::with_capacity(BLOCK_ROWS * cols);
    let mut block_start = 0usize;
    for (row_idx, record) in reader(path, format)?.byte_records().enumerate() {
        let record = record?;
        if record.len() != cols {
            return Err(IoError::RaggedRow {
                row: row_idx,
                found: record.len(),
                expected: cols,
            });
        }
        for (col_idx, field) in record.iter().enumerate() {
            let value = lexical_core::parse::<f64>(field).map_err(|_| IoError::Parse {
                row: row_idx,
                column: col_idx,
                field: String::from_utf8_lossy(field).into_owned(),
            })?;
            block.push(value);
        }
        if block.len() == BLOCK_ROWS * cols {
            let end = block_start + BLOCK_ROWS;
            container.write_chunk(ChunkRange::new(block_start, end), &block)?;
            block_start = end;
            block.clear();
        }
    }
    if !block.is_empty() {
        let end = block_start + block.len() / cols;
        container.write_chunk(ChunkRange::new(block_start, end), &block)?;
    }
    Ok(container)
}

// ========================================================================================
//                                     Persistence
// ========================================================================================

// `shape` serializes as a TOML table and therefore must come last.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    endianness: String,
    dtype: DType,
    byte_len: u64,
    blob: String,
    shape: Shape,
}

fn blob_path(manifest_path: &Path, blob: &str) -> PathBuf {
    match manifest_path.parent() {
        Some(dir) => dir.join(blob),
        None => PathBuf::from(blob),
    }
}

/// Persists a container as `<location>` (TOML manifest) plus a raw blob next
/// to it. Returns the manifest path, which is what `load` takes back.
pub fn save(container: &Container, location: &Path) -> Result<PathBuf, IoError> {
    let blob_name = format!(
        "{}.bin",
        location
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "container".to_string())
    );
    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        endianness: ENDIANNESS.to_string(),
        dtype: container.dtype(),
        shape: container.shape(),
        byte_len: container.byte_len(),
        blob: blob_name.clone(),
    };
    fs::write(location, toml::to_string_pretty(&manifest)?)?;

    let blob = blob_path(location, &blob_name);
    let mut writer = BufWriter::new(File::create(&blob)?);
    let total = container.byte_len();
    let mut offset = 0u64;
    let mut buf = vec![0u8; 1 << 20];
    while offset < total {
        let take = ((total - offset) as usize).min(buf.len());
        container.raw_read(offset, &mut buf[..take])?;
        writer.write_all(&buf[..take])?;
        offset += take as u64;
    }
    writer.flush()?;
    info!("saved {} bytes to {blob:?}", total);
    Ok(location.to_path_buf())
}

/// Restores a container from a manifest written by [`save`].
pub fn load(arena: &Arc<ContainerArena>, location: &Path) -> Result<Container, IoError> {
    let text = fs::read_to_string(location)?;
    let manifest: Manifest = toml::from_str(&text)?;

    if manifest.format_version != FORMAT_VERSION {
        return Err(IoError::Portability {
            path: location.to_path_buf(),
            reason: format!(
                "format version {} (this build reads {FORMAT_VERSION})",
                manifest.format_version
            ),
        });
    }
    if manifest.endianness != ENDIANNESS {
        return Err(IoError::Portability {
            path: location.to_path_buf(),
            reason: format!(
                "byte order '{}' is not portable to this layout",
                manifest.endianness
            ),
        });
    }
    let expected = (manifest.shape.element_count() * manifest.dtype.element_size()) as u64;
    if manifest.byte_len != expected {
        return Err(IoError::Portability {
            path: location.to_path_buf(),
            reason: format!(
                "manifest byte length {} disagrees with shape {} of {}",
                manifest.byte_len, manifest.shape, manifest.dtype
            ),
        });
    }

    let blob = blob_path(location, &manifest.blob);
    let blob_len = fs::metadata(&blob)?.len();
    if blob_len != expected {
        return Err(IoError::Portability {
            path: location.to_path_buf(),
            reason: format!("blob is {blob_len} bytes, manifest says {expected}"),
        });
    }

    let container = Container::create(arena, manifest.shape, manifest.dtype)?;
    let mut rdr = BufReader::new(File::open(&blob)?);
    let mut offset = 0u64;
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = rdr.read(&mut buf)?;
        if n == 0 {
            break;
        }
        container.raw_write(offset, &buf[..n])?;
        offset += n as u64;
    }
    Ok(container)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn arena() -> Arc<ContainerArena> {
        ContainerArena::new(Arc::new(MemoryStore::new()))
    }

    fn write_csv(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn import_parses_shape_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "t.csv", "a,b\n1,2\n3,4\n5,6\n");
        let c = open(&arena(), &path, TextFormat::csv(), DType::F64).unwrap();

        assert_eq!(c.shape(), Shape::Matrix { rows: 3, cols: 2 });
        assert_eq!(
            c.read_chunk(ChunkRange::new(0, 3)).unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn import_reports_bad_fields_with_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "t.csv", "a,b\n1,2\n3,oops\n");
        match open(&arena(), &path, TextFormat::csv(), DType::F64) {
            Err(IoError::Parse { row, column, field }) => {
                assert_eq!((row, column), (1, 1));
                assert_eq!(field, "oops");
            }
            other => panic!("expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn import_rejects_ragged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "t.csv", "a,b\n1,2\n3\n");
        assert!(matches!(
            open(&arena(), &path, TextFormat::csv(), DType::F64),
            Err(IoError::RaggedRow { row: 1, .. })
        ));
    }

    #[test]
    fn save_then_load_round_trips_every_dtype() {
        let dir = tempfile::tempdir().unwrap();
        let arena = arena();
        for (i, dtype) in [DType::F32, DType::F64, DType::I32, DType::I64]
            .into_iter()
            .enumerate()
        {
            let c = Container::create(&arena, Shape::Vector { len: 5 }, dtype).unwrap();
            c.write_chunk(ChunkRange::new(0, 5), &[1.0, -2.0, 3.0, -4.0, 5.0])
                .unwrap();

            let loc = dir.path().join(format!("c{i}.toml"));
            save(&c, &loc).unwrap();
            let restored = load(&arena, &loc).unwrap();

            assert_eq!(restored.dtype(), dtype);
            assert_eq!(
                restored.read_chunk(ChunkRange::new(0, 5)).unwrap(),
                vec![1.0, -2.0, 3.0, -4.0, 5.0]
            );
            // A fresh identity, not an alias of the saved container.
            assert_ne!(restored.backing_id(), c.backing_id());
        }
    }

    #[test]
    fn load_rejects_a_foreign_format_version() {
        let dir = tempfile::tempdir().unwrap();
        let arena = arena();
        let c = Container::create(&arena, Shape::Vector { len: 2 }, DType::F64).unwrap();
        let loc = dir.path().join("c.toml");
        save(&c, &loc).unwrap();

        let doctored = fs::read_to_string(&loc)
            .unwrap()
            .replace("format_version = 1", "format_version = 99");
        fs::write(&loc, doctored).unwrap();

        assert!(matches!(
            load(&arena, &loc),
            Err(IoError::Portability { .. })
        ));
    }

    #[test]
    fn load_rejects_a_foreign_byte_order() {
        let dir = tempfile::tempdir().unwrap();
        let arena = arena();
        let c = Container::create(&arena, Shape::Vector { len: 2 }, DType::F64).unwrap();
        let loc = dir.path().join("c.toml");
        save(&c, &loc).unwrap();

        let doctored = fs::read_to_string(&loc)
            .unwrap()
            .replace("endianness = \"little\"", "endianness = \"big\"");
        fs::write(&loc, doctored).unwrap();

        assert!(matches!(
            load(&arena, &loc),
            Err(IoError::Portability { .. })
        ));
    }

    #[test]
    fn load_rejects_a_truncated_blob() {
        let dir = tempfile::tempdir().unwrap();
        let arena = arena();
        let c = Container::create(&arena, Shape::Vector { len: 4 }, DType::F64).unwrap();
        let loc = dir.path().join("c.toml");
        save(&c, &loc).unwrap();

        let blob = dir.path().join("c.bin");
        let bytes = fs::read(&blob).unwrap();
        fs::write(&blob, &bytes[..bytes.len() - 8]).unwrap();

        assert!(matches!(
            load(&arena, &loc),
            Err(IoError::Portability { .. })
        ));
    }
}
