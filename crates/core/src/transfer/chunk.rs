//! Fixed-size chunking and chunk integrity

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default chunk size cap (1 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Most chunks a single transfer may be split into
pub const MAX_CHUNKS: u32 = 1 << 20;

/// One slice of a transferred file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    /// Zero-based position within the file
    pub index: u32,
    pub offset: u64,
    pub size: u64,
    pub transferred: bool,
    pub retry_count: u32,
}

impl FileChunk {
    /// Offset just past this chunk
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Number of chunks a file of `total_size` bytes is split into
///
/// An empty file still has one (empty) chunk so that completion is observable.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u32 {
    if total_size == 0 {
        return 1;
    }
    u32::try_from(total_size.div_ceil(chunk_size.max(1))).unwrap_or(u32::MAX)
}

/// Chunk count of a geometry that has not been trusted yet
///
/// `None` for a zero chunk size or more than [`MAX_CHUNKS`] chunks.
pub fn checked_chunk_count(total_size: u64, chunk_size: u64) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    let count = if total_size == 0 {
        1
    } else {
        u32::try_from(total_size.div_ceil(chunk_size)).ok()?
    };
    (count <= MAX_CHUNKS).then_some(count)
}

/// Split `total_size` bytes into chunks of at most `chunk_size`; the last
/// chunk may be shorter
pub fn partition(total_size: u64, chunk_size: u64) -> Vec<FileChunk> {
    let chunk_size = chunk_size.max(1);
    (0..chunk_count(total_size, chunk_size))
        .map(|index| {
            let offset = index as u64 * chunk_size;
            FileChunk {
                index,
                offset,
                size: chunk_size.min(total_size - offset),
                transferred: false,
                retry_count: 0,
            }
        })
        .collect()
}

/// Hex SHA-256 of chunk data
pub fn compute_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether `data` matches a hex SHA-256 `checksum`
pub fn verify_checksum(data: &[u8], checksum: &str) -> bool {
    compute_checksum(data).eq_ignore_ascii_case(checksum)
}
