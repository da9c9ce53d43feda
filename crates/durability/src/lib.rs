//! Durability layer for the snapshot store
//!
//! This crate handles everything that touches disk:
//!
//! - Store directory layout (committed, pending, reservations)
//! - Per-file CRC32C checksum sets and their SFV checksum files
//! - Chunked, seekable reads of committed snapshots for replication
//! - Durable reservation records
//! - Crash-safe write/fsync/rename helpers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
pub mod chunk_reader;
pub mod files;
pub mod paths;
pub mod reservations;

pub use checksum::{file_checksum, ChecksumProvider, ChecksumSet, DEFAULT_BLOCK_SIZE};
pub use chunk_reader::SnapshotChunkReader;
pub use paths::{checksum_file_snapshot_id, StorePaths, CHECKSUM_SUFFIX, TEMP_SUFFIX};
pub use reservations::{DurableReservations, ReservationRecord};
