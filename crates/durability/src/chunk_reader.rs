//! Chunked reader over a committed snapshot
//!
//! Turns a snapshot directory into the ordered chunk sequence consumed by
//! replication. The file list and sizes are captured at construction; content
//! is read lazily, one chunk at a time. Ordering is by file name bytes, then
//! offset, so a [`ChunkId`] taken from one reader can resume a transfer on a
//! fresh reader over the same snapshot.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use snapstore_core::{ChunkId, Result, SnapshotChunk, SnapshotError, SnapshotId};
use tracing::trace;

#[derive(Debug, Clone)]
struct ChunkSpan {
    file_name: String,
    offset: u64,
    len: u64,
    file_size: u64,
}

impl ChunkSpan {
    fn id(&self) -> ChunkId {
        ChunkId::new(self.file_name.clone(), self.offset)
    }
}

/// Restartable, seekable chunk iterator over a committed snapshot
#[derive(Debug)]
pub struct SnapshotChunkReader {
    snapshot_id: SnapshotId,
    directory: PathBuf,
    snapshot_checksum: u64,
    chunks: Vec<ChunkSpan>,
    cursor: usize,
}

impl SnapshotChunkReader {
    /// Create a reader over `directory`.
    ///
    /// Files larger than `max_chunk_size` are split into several chunks;
    /// `None` sends every file as a single chunk.
    pub fn new(
        directory: &Path,
        snapshot_id: SnapshotId,
        snapshot_checksum: u64,
        max_chunk_size: Option<u64>,
    ) -> Result<Self> {
        let max_chunk_size = max_chunk_size.filter(|size| *size > 0);

        let mut files = Vec::new();
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let file_name = entry.file_name().into_string().map_err(|name| {
                SnapshotError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("file name {:?} is not valid UTF-8", name),
                ))
            })?;
            files.push((file_name, metadata.len()));
        }
        files.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        let mut chunks = Vec::new();
        for (file_name, file_size) in files {
            let step = max_chunk_size.unwrap_or(file_size).max(1);
            let mut offset = 0;
            loop {
                let len = step.min(file_size - offset);
                chunks.push(ChunkSpan {
                    file_name: file_name.clone(),
                    offset,
                    len,
                    file_size,
                });
                offset += len;
                if offset >= file_size {
                    break;
                }
            }
        }

        if u32::try_from(chunks.len()).is_err() {
            return Err(SnapshotError::illegal_state(format!(
                "snapshot {} has too many chunks ({})",
                snapshot_id,
                chunks.len()
            )));
        }

        Ok(SnapshotChunkReader {
            snapshot_id,
            directory: directory.to_path_buf(),
            snapshot_checksum,
            chunks,
            cursor: 0,
        })
    }

    /// Snapshot being read
    pub fn snapshot_id(&self) -> &SnapshotId {
        &self.snapshot_id
    }

    /// Number of chunks in the whole snapshot
    pub fn total_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// True if another chunk can be read
    pub fn has_next(&self) -> bool {
        self.cursor < self.chunks.len()
    }

    /// Id of the chunk the next call to [`next_chunk`](Self::next_chunk) returns
    pub fn next_id(&self) -> Option<ChunkId> {
        self.chunks.get(self.cursor).map(ChunkSpan::id)
    }

    /// Read the next chunk and advance.
    ///
    /// Fails with an I/O error if the file or the snapshot directory has been
    /// removed since the reader was created.
    pub fn next_chunk(&mut self) -> Result<SnapshotChunk> {
        let span = self
            .chunks
            .get(self.cursor)
            .cloned()
            .ok_or(SnapshotError::NoSuchChunk(self.snapshot_id))?;

        let content = self.read_span(&span)?;
        self.cursor += 1;

        trace!(
            snapshot_id = %self.snapshot_id,
            chunk = %span.id(),
            len = content.len(),
            "Read snapshot chunk"
        );

        Ok(SnapshotChunk {
            snapshot_id: self.snapshot_id.encode(),
            chunk_name: span.file_name,
            total_count: self.total_count(),
            checksum: crc32c::crc32c(&content),
            content,
            snapshot_checksum: self.snapshot_checksum,
            file_block_position: span.offset,
            total_file_size: span.file_size,
        })
    }

    /// Position the reader at the first chunk ordering at or after `id`
    pub fn seek(&mut self, id: &ChunkId) {
        self.cursor = self.chunks.partition_point(|span| span.id() < *id);
    }

    /// Position the reader at the first chunk
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    fn read_span(&self, span: &ChunkSpan) -> Result<Vec<u8>> {
        let mut file = File::open(self.directory.join(&span.file_name))?;
        file.seek(SeekFrom::Start(span.offset))?;
        let mut content = vec![0u8; span.len as usize];
        file.read_exact(&mut content)?;
        Ok(content)
    }
}

impl Iterator for SnapshotChunkReader {
    type Item = Result<SnapshotChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.has_next() {
            Some(self.next_chunk())
        } else {
            None
        }
    }
}
