//! Snapshot chunks
//!
//! A committed snapshot is replicated as an ordered sequence of chunks. Each
//! chunk carries a slice of one file plus enough redundancy for the receiver
//! to validate it before anything touches disk.

use std::cmp::Ordering;
use std::fmt;

use byteorder::{BigEndian, ByteOrder};

/// Separator between the file name and the offset in an encoded [`ChunkId`]
const OFFSET_SEPARATOR: u8 = 0;

/// Identity of a chunk: the file it belongs to and its byte offset.
///
/// Used as a resumption token. The encoded form is the UTF-8 file name,
/// followed, for chunks that do not start a file, by a NUL byte and the
/// big-endian offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkId {
    file_name: String,
    offset: u64,
}

impl ChunkId {
    /// Id of the chunk at `offset` within `file_name`
    pub fn new(file_name: impl Into<String>, offset: u64) -> Self {
        ChunkId {
            file_name: file_name.into(),
            offset,
        }
    }

    /// Id of the first chunk of `file_name`
    pub fn of_file(file_name: impl Into<String>) -> Self {
        ChunkId::new(file_name, 0)
    }

    /// Decode from raw bytes. Returns `None` if the bytes are not a valid id.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.iter().position(|b| *b == OFFSET_SEPARATOR) {
            Some(split) => {
                let tail = &bytes[split + 1..];
                if tail.len() != 8 {
                    return None;
                }
                let file_name = std::str::from_utf8(&bytes[..split]).ok()?;
                Some(ChunkId::new(file_name, BigEndian::read_u64(tail)))
            }
            None => {
                let file_name = std::str::from_utf8(bytes).ok()?;
                Some(ChunkId::of_file(file_name))
            }
        }
    }

    /// Encode to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.file_name.as_bytes().to_vec();
        if self.offset > 0 {
            let mut offset = [0u8; 8];
            BigEndian::write_u64(&mut offset, self.offset);
            bytes.push(OFFSET_SEPARATOR);
            bytes.extend_from_slice(&offset);
        }
        bytes
    }

    /// File the chunk belongs to
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Byte offset of the chunk within its file
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

// Chunks are streamed ordered by file name bytes, then offset.
impl Ord for ChunkId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file_name
            .as_bytes()
            .cmp(other.file_name.as_bytes())
            .then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for ChunkId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset == 0 {
            write!(f, "{}", self.file_name)
        } else {
            write!(f, "{}@{}", self.file_name, self.offset)
        }
    }
}

impl From<&str> for ChunkId {
    fn from(file_name: &str) -> Self {
        ChunkId::of_file(file_name)
    }
}

/// One unit of snapshot replication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    /// Encoded id of the snapshot the chunk belongs to
    pub snapshot_id: String,
    /// Name of the file the content belongs to
    pub chunk_name: String,
    /// Number of chunks making up the whole snapshot
    pub total_count: u32,
    /// Slice of the file's content
    pub content: Vec<u8>,
    /// CRC32C of `content`
    pub checksum: u32,
    /// Combined checksum of the whole snapshot
    pub snapshot_checksum: u64,
    /// Offset of `content` within the file
    pub file_block_position: u64,
    /// Size of the whole file
    pub total_file_size: u64,
}

impl SnapshotChunk {
    /// Id of this chunk
    pub fn id(&self) -> ChunkId {
        ChunkId::new(self.chunk_name.clone(), self.file_block_position)
    }
}

/// Reasons a received chunk is rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkWriteError {
    /// Chunk belongs to another snapshot
    #[error("expected chunk for snapshot {expected}, got chunk {chunk} of snapshot {actual}")]
    SnapshotIdMismatch {
        /// Id of the receiving snapshot
        expected: String,
        /// Id declared by the chunk
        actual: String,
        /// Chunk name
        chunk: String,
    },

    /// Total chunk count differs from earlier chunks
    #[error("expected total chunk count {expected}, chunk {chunk} declares {actual}")]
    TotalCountMismatch {
        /// Count declared by earlier chunks
        expected: u32,
        /// Count declared by this chunk
        actual: u32,
        /// Chunk name
        chunk: String,
    },

    /// Chunk content does not match its checksum
    #[error("expected checksum {expected} for chunk {chunk}, computed {actual}")]
    ChecksumMismatch {
        /// Declared checksum
        expected: u32,
        /// Checksum of the received content
        actual: u32,
        /// Chunk name
        chunk: String,
    },

    /// Snapshot checksum differs from earlier chunks
    #[error("expected snapshot checksum {expected}, chunk {chunk} declares {actual}")]
    SnapshotChecksumMismatch {
        /// Checksum declared by earlier chunks
        expected: u64,
        /// Checksum declared by this chunk
        actual: u64,
        /// Chunk name
        chunk: String,
    },

    /// Chunk name is not a plain file name
    #[error("chunk name '{0}' is not a plain file name")]
    InvalidChunkName(String),

    /// Chunk does not continue its file where the previous chunk ended
    #[error("chunk {chunk} starts at {position}, but {written} bytes have been written")]
    OutOfOrder {
        /// Chunk name
        chunk: String,
        /// Declared offset of the chunk
        position: u64,
        /// Bytes already written to the file
        written: u64,
    },
}
