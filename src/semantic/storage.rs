//! Binary storage for the product vector index.
//!
//! The store is a directory holding a single `vectors.bin`:
//!
//! Header (79 bytes):
//! - version: u8 (2)
//! - model_id: [u8; 32] (SHA256 hash of embedding model identity)
//! - catalog_fingerprint: [u8; 32] (SHA256 of the catalog it was built from)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - product_name: u32 length + UTF-8 bytes
//! - text: u32 length + UTF-8 bytes
//! - embedding: [f32; dimensions] (little-endian)
//!
//! Trailer:
//! - checksum: u32 (CRC32 of all entry bytes)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::semantic::index::{IndexChunk, VectorIndex};

/// Current file format version
const FORMAT_VERSION: u8 = 2;

/// Header size in bytes: version(1) + model_id(32) + fingerprint(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 79;

const VECTORS_FILE: &str = "vectors.bin";

/// Upper bound for a single stored string, guards against allocating on garbage lengths
const MAX_STRING_LEN: u32 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different embedding model")]
    ModelMismatch,

    #[error("Catalog mismatch: index was built from a different catalog")]
    CatalogMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl VectorStorageError {
    /// The store cannot be used as written and has to be rebuilt.
    pub fn is_incompatible(&self) -> bool {
        match self {
            VectorStorageError::VersionMismatch(..)
            | VectorStorageError::ModelMismatch
            | VectorStorageError::ChecksumMismatch
            | VectorStorageError::DimensionMismatch { .. }
            | VectorStorageError::InvalidFormat(_) => true,
            VectorStorageError::Io(err) => err.kind() == std::io::ErrorKind::UnexpectedEof,
            VectorStorageError::CatalogMismatch => false,
        }
    }

    /// The store is intact but describes an older catalog.
    pub fn is_stale(&self) -> bool {
        matches!(self, VectorStorageError::CatalogMismatch)
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, VectorStorageError::Io(err) if err.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Storage manager for the vector index directory.
pub struct VectorStorage {
    dir: PathBuf,
}

impl VectorStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(VECTORS_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Load the vector index from storage.
    ///
    /// `expected_dimensions` is checked when the embedder knows its output
    /// size up front; remote providers only learn it from the first response.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_catalog: &[u8; 32],
        expected_dimensions: Option<usize>,
    ) -> Result<VectorIndex, VectorStorageError> {
        let file = File::open(self.path())?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        validate_header(&header, expected_model_id, expected_catalog, expected_dimensions)?;

        let dimensions = header.dimensions as usize;
        let mut index = VectorIndex::with_capacity(dimensions, header.entry_count.min(1 << 20) as usize);
        let mut hasher = crc32fast::Hasher::new();

        for _ in 0..header.entry_count {
            let chunk = read_entry(&mut reader, &mut hasher, dimensions)?;
            index
                .insert(chunk)
                .map_err(|err| VectorStorageError::InvalidFormat(err.to_string()))?;
        }

        let mut trailer = [0u8; 4];
        reader.read_exact(&mut trailer)?;
        if u32::from_le_bytes(trailer) != hasher.finalize() {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut rest = [0u8; 1];
        if reader.read(&mut rest)? != 0 {
            return Err(VectorStorageError::InvalidFormat(
                "trailing bytes after entries".to_string(),
            ));
        }

        Ok(index)
    }

    /// Save the vector index to storage.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(
        &self,
        index: &VectorIndex,
        model_id: &[u8; 32],
        catalog_fingerprint: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        if index.dimensions() > u16::MAX as usize {
            return Err(VectorStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the format",
                index.dimensions()
            )));
        }

        std::fs::create_dir_all(&self.dir)?;

        let path = self.path();
        let temp_path = path.with_extension("tmp");

        let result = write_to_file(&temp_path, index, model_id, catalog_fingerprint);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &path)?;

        Ok(())
    }

    /// Remove the whole store directory if it exists.
    pub fn delete(&self) -> Result<(), VectorStorageError> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn write_to_file(
    path: &Path,
    index: &VectorIndex,
    model_id: &[u8; 32],
    catalog_fingerprint: &[u8; 32],
) -> Result<(), VectorStorageError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let header = Header {
        version: FORMAT_VERSION,
        model_id: *model_id,
        catalog_fingerprint: *catalog_fingerprint,
        dimensions: index.dimensions() as u16,
        entry_count: index.len() as u64,
    };
    write_header(&mut writer, &header)?;

    let mut hasher = crc32fast::Hasher::new();
    for chunk in index.chunks() {
        write_entry(&mut writer, &mut hasher, chunk)?;
    }
    writer.write_all(&hasher.finalize().to_le_bytes())?;

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes)?;

    let version = bytes[0];
    if version != FORMAT_VERSION {
        return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes([bytes[75], bytes[76], bytes[77], bytes[78]]);
    if stored_checksum != crc32fast::hash(&bytes[0..75]) {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&bytes[1..33]);

    let mut catalog_fingerprint = [0u8; 32];
    catalog_fingerprint.copy_from_slice(&bytes[33..65]);

    let dimensions = u16::from_le_bytes([bytes[65], bytes[66]]);

    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&bytes[67..75]);
    let entry_count = u64::from_le_bytes(count_bytes);

    Ok(Header {
        version,
        model_id,
        catalog_fingerprint,
        dimensions,
        entry_count,
    })
}

fn validate_header(
    header: &Header,
    expected_model_id: &[u8; 32],
    expected_catalog: &[u8; 32],
    expected_dimensions: Option<usize>,
) -> Result<(), VectorStorageError> {
    if header.model_id != *expected_model_id {
        return Err(VectorStorageError::ModelMismatch);
    }

    if let Some(expected) = expected_dimensions {
        if header.dimensions as usize != expected {
            return Err(VectorStorageError::DimensionMismatch {
                expected,
                got: header.dimensions as usize,
            });
        }
    }

    if header.dimensions == 0 {
        return Err(VectorStorageError::InvalidFormat(
            "zero embedding dimensions".to_string(),
        ));
    }

    if header.catalog_fingerprint != *expected_catalog {
        return Err(VectorStorageError::CatalogMismatch);
    }

    Ok(())
}

fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];

    bytes[0] = header.version;
    bytes[1..33].copy_from_slice(&header.model_id);
    bytes[33..65].copy_from_slice(&header.catalog_fingerprint);
    bytes[65..67].copy_from_slice(&header.dimensions.to_le_bytes());
    bytes[67..75].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&bytes[0..75]);
    bytes[75..79].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&bytes)?;
    Ok(())
}

fn read_hashed(
    reader: &mut impl Read,
    hasher: &mut crc32fast::Hasher,
    buf: &mut [u8],
) -> Result<(), VectorStorageError> {
    reader.read_exact(buf)?;
    hasher.update(buf);
    Ok(())
}

fn read_string(
    reader: &mut impl Read,
    hasher: &mut crc32fast::Hasher,
) -> Result<String, VectorStorageError> {
    let mut len_bytes = [0u8; 4];
    read_hashed(reader, hasher, &mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_STRING_LEN {
        return Err(VectorStorageError::InvalidFormat(format!(
            "string length {len} out of range"
        )));
    }

    let mut bytes = vec![0u8; len as usize];
    read_hashed(reader, hasher, &mut bytes)?;
    String::from_utf8(bytes).map_err(|err| VectorStorageError::InvalidFormat(err.to_string()))
}

fn read_entry(
    reader: &mut impl Read,
    hasher: &mut crc32fast::Hasher,
    dimensions: usize,
) -> Result<IndexChunk, VectorStorageError> {
    let product_name = read_string(reader, hasher)?;
    let text = read_string(reader, hasher)?;

    let mut raw = vec![0u8; dimensions * 4];
    read_hashed(reader, hasher, &mut raw)?;
    let embedding = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(IndexChunk {
        product_name,
        text,
        embedding,
    })
}

fn write_entry(
    writer: &mut impl Write,
    hasher: &mut crc32fast::Hasher,
    chunk: &IndexChunk,
) -> Result<(), VectorStorageError> {
    let mut bytes = Vec::with_capacity(8 + chunk.product_name.len() + chunk.text.len() + chunk.embedding.len() * 4);

    for s in [&chunk.product_name, &chunk.text] {
        bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
        bytes.extend_from_slice(s.as_bytes());
    }
    for value in &chunk.embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    hasher.update(&bytes);
    writer.write_all(&bytes)?;
    Ok(())
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    catalog_fingerprint: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}
