//! Committed, immutable snapshots

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use snapstore_core::{Result, SnapshotId, SnapshotMetadata};
use snapstore_durability::{ChecksumSet, SnapshotChunkReader};

use crate::actor::ActorFuture;
use crate::reservation::Reservation;
use crate::store::StoreInner;

struct PersistedInner {
    id: SnapshotId,
    path: PathBuf,
    checksum_path: PathBuf,
    metadata: SnapshotMetadata,
    checksums: ChecksumSet,
    store: Weak<StoreInner>,
}

/// A committed snapshot.
///
/// Cheap to clone. The handle stays usable after the snapshot is deleted, but
/// reading its files then fails with I/O errors.
#[derive(Clone)]
pub struct PersistedSnapshot {
    inner: Arc<PersistedInner>,
}

impl PersistedSnapshot {
    pub(crate) fn new(
        id: SnapshotId,
        path: PathBuf,
        checksum_path: PathBuf,
        metadata: SnapshotMetadata,
        checksums: ChecksumSet,
        store: Weak<StoreInner>,
    ) -> Self {
        PersistedSnapshot {
            inner: Arc::new(PersistedInner {
                id,
                path,
                checksum_path,
                metadata,
                checksums,
                store,
            }),
        }
    }

    /// Snapshot id
    pub fn id(&self) -> &SnapshotId {
        &self.inner.id
    }

    /// Log index covered by the snapshot
    pub fn index(&self) -> u64 {
        self.inner.id.index()
    }

    /// Term of the entry at [`index`](Self::index)
    pub fn term(&self) -> u64 {
        self.inner.id.term()
    }

    /// Highest log position that may be compacted once this snapshot exists
    pub fn compaction_bound(&self) -> i64 {
        self.inner.metadata.processed_position
    }

    /// Committed snapshot directory
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Sidecar checksum file
    pub fn checksum_path(&self) -> &Path {
        &self.inner.checksum_path
    }

    /// Positions recorded with the snapshot
    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.inner.metadata
    }

    /// Per-file checksums
    pub fn checksums(&self) -> &ChecksumSet {
        &self.inner.checksums
    }

    /// Combined checksum over all files
    pub fn checksum(&self) -> u64 {
        self.inner.checksums.combined_checksum()
    }

    /// Take an in-memory reservation
    pub fn reserve(&self) -> ActorFuture<Reservation> {
        let id = self.inner.id;
        StoreInner::submit_weak(&self.inner.store, move |store| store.reserve(id, false))
    }

    /// Take a reservation recorded on disk.
    ///
    /// The reservation survives a restart and can be recovered with
    /// `SnapshotStore::persisted_snapshot_reservation(reservation.id())`.
    pub fn reserve_with_persistence(&self) -> ActorFuture<Reservation> {
        let id = self.inner.id;
        StoreInner::submit_weak(&self.inner.store, move |store| store.reserve(id, true))
    }

    /// True while at least one reservation is held
    pub fn is_reserved(&self) -> bool {
        self.inner
            .store
            .upgrade()
            .map(|store| store.is_reserved(&self.inner.id))
            .unwrap_or(false)
    }

    /// Delete the snapshot's files.
    ///
    /// Fails with `SnapshotError::Reserved` while reservations are held; the
    /// snapshot is then deleted when the last one is released.
    pub fn delete(&self) -> ActorFuture<()> {
        let id = self.inner.id;
        StoreInner::submit_weak(&self.inner.store, move |store| store.delete_snapshot(&id))
    }

    /// Chunk reader using the store's configured maximum chunk size
    pub fn new_chunk_reader(&self) -> Result<SnapshotChunkReader> {
        let max_chunk_size = self
            .inner
            .store
            .upgrade()
            .and_then(|store| store.config.max_chunk_size);
        self.new_chunk_reader_with_max_size(max_chunk_size)
    }

    /// Chunk reader splitting files into chunks of at most `max_chunk_size`
    /// bytes, or one chunk per file for `None`
    pub fn new_chunk_reader_with_max_size(
        &self,
        max_chunk_size: Option<u64>,
    ) -> Result<SnapshotChunkReader> {
        SnapshotChunkReader::new(
            &self.inner.path,
            self.inner.id,
            self.checksum(),
            max_chunk_size,
        )
    }
}

impl PartialEq for PersistedSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id && self.inner.path == other.inner.path
    }
}

impl Eq for PersistedSnapshot {}

impl fmt::Debug for PersistedSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistedSnapshot")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("metadata", &self.inner.metadata)
            .finish()
    }
}

impl fmt::Display for PersistedSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.id)
    }
}
