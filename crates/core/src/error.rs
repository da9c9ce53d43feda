//! Error types for the snapshot store
//!
//! This module defines the error taxonomy shared by every crate in the
//! workspace. We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::chunk::ChunkWriteError;
use crate::id::{IdFormatError, SnapshotId};

/// Result type alias for snapshot store operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Error types for the snapshot store
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Malformed snapshot id
    #[error("Invalid snapshot id: {0}")]
    Format(#[from] IdFormatError),

    /// A received chunk was rejected
    #[error("Failed to write snapshot chunk: {0}")]
    Write(#[from] ChunkWriteError),

    /// Snapshot content does not match its checksums
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Operation not valid in the current state (programmer error)
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Snapshot cannot be deleted while reservations are held
    #[error("Snapshot {0} is reserved")]
    Reserved(SnapshotId),

    /// I/O error (file operations, missing snapshot files, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed checksum file
    #[error("Invalid checksum file {path} at line {line}: {reason}")]
    ChecksumFormat {
        /// Checksum file
        path: PathBuf,
        /// 1-based line number
        line: usize,
        /// What is wrong with the line
        reason: String,
    },

    /// Metadata file could not be encoded or decoded
    #[error("Invalid snapshot metadata: {0}")]
    Metadata(String),

    /// Chunk reader has no more chunks
    #[error("No more chunks in snapshot {0}")]
    NoSuchChunk(SnapshotId),

    /// Store has been closed
    #[error("Snapshot store is closed")]
    Closed,
}

impl SnapshotError {
    /// Create an [`SnapshotError::IllegalState`] from a message
    pub fn illegal_state(message: impl Into<String>) -> Self {
        SnapshotError::IllegalState(message.into())
    }

    /// Create an [`SnapshotError::Corruption`] from a message
    pub fn corruption(message: impl Into<String>) -> Self {
        SnapshotError::Corruption(message.into())
    }

    /// True for errors that indicate the file or directory is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err = SnapshotError::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_error_display_corruption() {
        let err = SnapshotError::corruption("checksum mismatch");
        let msg = err.to_string();
        assert!(msg.contains("Data corruption"));
        assert!(msg.contains("checksum mismatch"));
    }

    #[test]
    fn test_error_display_reserved() {
        let id = SnapshotId::new(3, 1, 2, 1, 0);
        let msg = SnapshotError::Reserved(id).to_string();
        assert!(msg.contains(&id.to_string()));
    }

    #[test]
    fn test_error_from_format() {
        let err: SnapshotError = SnapshotId::parse("1-2").unwrap_err().into();
        assert!(matches!(err, SnapshotError::Format(_)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_error_from_write() {
        let err: SnapshotError = ChunkWriteError::InvalidChunkName("../x".to_string()).into();
        assert!(matches!(err, SnapshotError::Write(_)));
        assert!(err.to_string().contains("../x"));
    }

    #[test]
    fn test_error_display_checksum_format() {
        let err = SnapshotError::ChecksumFormat {
            path: PathBuf::from("/tmp/x.checksum"),
            line: 7,
            reason: "missing checksum".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("line 7"));
        assert!(msg.contains("missing checksum"));
    }
}
