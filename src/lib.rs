//! Snapstore - replicated, checksummed snapshot store
//!
//! Snapstore keeps point-in-time snapshots of a log-structured state machine
//! on disk, publishes the newest one, and streams snapshots between replicas
//! as checksummed chunks.
//!
//! # Quick Start
//!
//! ```ignore
//! use snapstore::{SnapshotStore, SnapshotStoreConfig};
//!
//! let store = SnapshotStore::open("/var/lib/partition-1", SnapshotStoreConfig::default())?;
//!
//! // Stage, write and commit a snapshot of everything up to log index 42
//! let transient = store.new_transient_snapshot(42, 3, 120, 118).join()?.unwrap();
//! transient.take(|dir| std::fs::write(dir.join("state"), b"...")).join()?;
//! let snapshot = transient.persist().join()?;
//!
//! // Stream it to a follower
//! for chunk in snapshot.new_chunk_reader()? {
//!     send(chunk?);
//! }
//! ```
//!
//! # Architecture
//!
//! - `snapstore-core`: identities, metadata, chunks, errors
//! - `snapstore-durability`: directory layout, checksum files, chunk reads
//! - `snapstore-engine`: the store itself and its snapshot handles
//!
//! Everything a caller needs is re-exported here.

pub use snapstore_core::{
    ChunkId, ChunkWriteError, IdFormatError, Result, SnapshotChunk, SnapshotError, SnapshotId,
    SnapshotMetadata, METADATA_FILE_NAME, NO_POSITION,
};
pub use snapstore_durability::{ChecksumProvider, ChecksumSet, SnapshotChunkReader};
pub use snapstore_engine::{
    ActorFuture, ActorStats, ConfigError, PersistedSnapshot, ReceivedPhase, ReceivedSnapshot,
    Reservation, ReservationId, SnapshotCounters, SnapshotListener, SnapshotStore,
    SnapshotStoreConfig, TransientPhase, TransientSnapshot,
};
