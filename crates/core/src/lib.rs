//! Core types for the snapshot store
//!
//! This crate defines the value types shared by the durability and engine
//! layers:
//! - SnapshotId: sortable snapshot identity and its textual codec
//! - SnapshotMetadata: positions recorded next to the snapshot content
//! - SnapshotChunk / ChunkId: the unit of snapshot replication
//! - SnapshotError: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod error;
pub mod id;
pub mod metadata;

pub use chunk::{ChunkId, ChunkWriteError, SnapshotChunk};
pub use error::{Result, SnapshotError};
pub use id::{IdFormatError, SnapshotId};
pub use metadata::{SnapshotMetadata, METADATA_FILE_NAME, METADATA_VERSION, NO_POSITION};
