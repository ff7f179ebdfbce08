//! Binary snapshot of product embeddings.
//!
//! File format: vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - header_len: u32 (little-endian)
//! - header: JSON `{id, productId, metadata, createdAt}`
//! - embedding: [f32; dimensions] (little-endian)
//!
//! Only product records are written; uploaded query images are transient.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::Eid;
use crate::search::record::{EmbeddingRecord, ProductSnapshot, RecordOwner};

const FORMAT_VERSION: u8 = 1;

/// version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Entry headers are small JSON objects; anything larger is corruption.
const MAX_ENTRY_HEADER: u32 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryHeader {
    id: Eid,
    product_id: u64,
    #[serde(default)]
    metadata: Option<ProductSnapshot>,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

pub struct VectorSnapshot {
    path: PathBuf,
}

impl VectorSnapshot {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read every product record, rejecting files written by another model
    /// or with another vector size.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<Vec<EmbeddingRecord>, SnapshotError> {
        let mut reader = BufReader::new(File::open(&self.path)?);

        let header = read_header(&mut reader)?;
        if header.model_id != *expected_model_id {
            return Err(SnapshotError::ModelMismatch);
        }
        if header.dimensions as usize != expected_dimensions {
            return Err(SnapshotError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        let mut records = Vec::new();
        for _ in 0..header.entry_count {
            records.push(read_entry(&mut reader, header.dimensions as usize)?);
        }

        Ok(records)
    }

    /// Write product records atomically: temp file, fsync, rename.
    pub fn save(
        &self,
        records: &[Arc<EmbeddingRecord>],
        model_id: &[u8; 32],
        dimensions: usize,
    ) -> Result<usize, SnapshotError> {
        let dims = u16::try_from(dimensions).map_err(|_| {
            SnapshotError::InvalidFormat(format!("{dimensions} dimensions do not fit the header"))
        })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("tmp");
        let result = write_to_file(&temp_path, records, model_id, dims);
        let written = match result {
            Ok(written) => written,
            Err(e) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        std::fs::rename(&temp_path, &self.path)?;
        Ok(written)
    }
}

fn write_to_file(
    path: &Path,
    records: &[Arc<EmbeddingRecord>],
    model_id: &[u8; 32],
    dimensions: u16,
) -> Result<usize, SnapshotError> {
    let products: Vec<(u64, &EmbeddingRecord)> = records
        .iter()
        .filter_map(|r| match r.owner {
            RecordOwner::Product { product_id } => Some((product_id, r.as_ref())),
            RecordOwner::Image { .. } => None,
        })
        .collect();

    let mut writer = BufWriter::new(File::create(path)?);
    write_header(
        &mut writer,
        &Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            entry_count: products.len() as u64,
        },
    )?;

    for (product_id, record) in &products {
        if record.vector.len() != dimensions as usize {
            return Err(SnapshotError::DimensionMismatch {
                expected: dimensions as usize,
                got: record.vector.len(),
            });
        }
        write_entry(&mut writer, *product_id, record)?;
    }

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(products.len())
}

fn read_header<R: Read>(reader: &mut R) -> Result<Header, SnapshotError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            SnapshotError::InvalidFormat("file shorter than header".to_string())
        }
        _ => SnapshotError::Io(e),
    })?;

    let version = bytes[0];
    if version != FORMAT_VERSION {
        return Err(SnapshotError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes(slice_array(&bytes[43..47]));
    if stored_checksum != crc32fast::hash(&bytes[0..43]) {
        return Err(SnapshotError::ChecksumMismatch);
    }

    Ok(Header {
        version,
        model_id: slice_array(&bytes[1..33]),
        dimensions: u16::from_le_bytes(slice_array(&bytes[33..35])),
        entry_count: u64::from_le_bytes(slice_array(&bytes[35..43])),
    })
}

fn write_header<W: Write>(writer: &mut W, header: &Header) -> Result<(), SnapshotError> {
    let mut bytes = [0u8; HEADER_SIZE];
    bytes[0] = header.version;
    bytes[1..33].copy_from_slice(&header.model_id);
    bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&bytes[0..43]);
    bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&bytes)?;
    Ok(())
}

fn read_entry<R: Read>(reader: &mut R, dimensions: usize) -> Result<EmbeddingRecord, SnapshotError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_ENTRY_HEADER {
        return Err(SnapshotError::InvalidFormat(format!(
            "entry header of {len} bytes"
        )));
    }

    let mut json = vec![0u8; len as usize];
    reader.read_exact(&mut json)?;
    let header: EntryHeader = serde_json::from_slice(&json)
        .map_err(|e| SnapshotError::InvalidFormat(format!("entry header: {e}")))?;

    let mut raw = vec![0u8; dimensions * 4];
    reader.read_exact(&mut raw)?;
    let vector = raw
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(slice_array(chunk)))
        .collect();

    Ok(EmbeddingRecord {
        id: header.id,
        owner: RecordOwner::Product {
            product_id: header.product_id,
        },
        vector,
        metadata: header.metadata,
        created_at: header.created_at,
    })
}

fn write_entry<W: Write>(
    writer: &mut W,
    product_id: u64,
    record: &EmbeddingRecord,
) -> Result<(), SnapshotError> {
    let header = EntryHeader {
        id: record.id.clone(),
        product_id,
        metadata: record.metadata.clone(),
        created_at: record.created_at,
    };
    let json = serde_json::to_vec(&header)
        .map_err(|e| SnapshotError::InvalidFormat(format!("entry header: {e}")))?;

    writer.write_all(&(json.len() as u32).to_le_bytes())?;
    writer.write_all(&json)?;
    for value in &record.vector {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn slice_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}
