//! Snapshots rebuilt from replicated chunks
//!
//! A received snapshot is assembled chunk by chunk in a staging directory.
//! Every chunk is validated before any of its bytes touch disk, and the
//! rebuilt directory must reproduce the sender's combined checksum before it
//! can be committed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use snapstore_core::{
    ChunkId, ChunkWriteError, Result, SnapshotChunk, SnapshotError, SnapshotId,
};
use snapstore_durability::files::remove_dir_if_exists;
use tracing::{debug, warn};

use crate::actor::ActorFuture;
use crate::persisted::PersistedSnapshot;
use crate::store::StoreInner;

/// Lifecycle of a received snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivedPhase {
    /// No chunk applied yet
    Empty,
    /// Some chunks applied
    Receiving,
    /// Every declared chunk applied
    Complete,
    /// Committed
    Persisted,
    /// Discarded
    Aborted,
}

struct ReceivedState {
    phase: ReceivedPhase,
    total_count: Option<u32>,
    snapshot_checksum: Option<u64>,
    applied: u32,
    directory_created: bool,
    persisted: Option<PersistedSnapshot>,
}

struct ReceivedInner {
    id: SnapshotId,
    directory: PathBuf,
    store: Weak<StoreInner>,
    state: Mutex<ReceivedState>,
}

/// Handle to a snapshot being received from another node. Cheap to clone.
#[derive(Clone)]
pub struct ReceivedSnapshot {
    inner: Arc<ReceivedInner>,
}

impl ReceivedSnapshot {
    pub(crate) fn new(id: SnapshotId, directory: PathBuf, store: Weak<StoreInner>) -> Self {
        ReceivedSnapshot {
            inner: Arc::new(ReceivedInner {
                id,
                directory,
                store,
                state: Mutex::new(ReceivedState {
                    phase: ReceivedPhase::Empty,
                    total_count: None,
                    snapshot_checksum: None,
                    applied: 0,
                    directory_created: false,
                    persisted: None,
                }),
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

    /// Staging directory
    pub fn path(&self) -> &Path {
        &self.inner.directory
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> ReceivedPhase {
        self.inner.state.lock().phase
    }

    /// True if the bytes of chunk `id` are already on disk
    pub fn contains_chunk(&self, id: &ChunkId) -> bool {
        self.written_len(id.file_name())
            .map(|len| len > id.offset())
            .unwrap_or(false)
    }

    /// True if chunk `id` continues its file exactly where writing left off
    pub fn is_expected_chunk(&self, id: &ChunkId) -> bool {
        self.written_len(id.file_name()).unwrap_or(0) == id.offset()
    }

    fn written_len(&self, file_name: &str) -> Option<u64> {
        if validate_chunk_name(file_name).is_err() {
            return None;
        }
        fs::metadata(self.inner.directory.join(file_name))
            .ok()
            .map(|metadata| metadata.len())
    }

    /// Validate and write one chunk.
    ///
    /// A chunk whose bytes are already on disk is accepted without writing.
    pub fn apply(&self, chunk: SnapshotChunk) -> ActorFuture<()> {
        let this = self.clone();
        StoreInner::submit_weak(&self.inner.store, move |store| this.apply_on_actor(store, chunk))
    }

    fn apply_on_actor(&self, store: &StoreInner, chunk: SnapshotChunk) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.phase {
            ReceivedPhase::Persisted | ReceivedPhase::Aborted => {
                return Err(SnapshotError::illegal_state(format!(
                    "cannot apply chunk {} to snapshot {} in phase {:?}",
                    chunk.chunk_name, self.inner.id, state.phase
                )));
            }
            _ => {}
        }
        if !store.is_pending(&self.inner.id) {
            return Err(SnapshotError::illegal_state(format!(
                "snapshot {} is no longer pending",
                self.inner.id
            )));
        }

        self.validate(&state, &chunk)?;

        if state.directory_created && !self.inner.directory.exists() {
            return Err(SnapshotError::illegal_state(format!(
                "staging directory of snapshot {} was removed",
                self.inner.id
            )));
        }
        // a missing staging directory means nothing has been written yet
        let path = self.inner.directory.join(&chunk.chunk_name);
        let existing = match fs::metadata(&path) {
            Ok(metadata) => Some(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let written = existing.unwrap_or(0);
        let end = chunk.file_block_position + chunk.content.len() as u64;
        // an empty chunk only counts when it creates its file
        let is_new = chunk.file_block_position == written
            && (!chunk.content.is_empty() || existing.is_none());

        if is_new {
            fs::create_dir_all(&self.inner.directory)?;
            state.directory_created = true;
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&chunk.content)?;
        } else if end <= written {
            debug!(
                target: "snapstore::received",
                snapshot_id = %self.inner.id,
                chunk = %chunk.id(),
                "Skipping duplicate chunk"
            );
            return Ok(());
        } else {
            return Err(ChunkWriteError::OutOfOrder {
                chunk: chunk.id().to_string(),
                position: chunk.file_block_position,
                written,
            }
            .into());
        }

        state.total_count = Some(chunk.total_count);
        state.snapshot_checksum = Some(chunk.snapshot_checksum);
        state.applied += 1;
        state.phase = if state.applied >= chunk.total_count {
            ReceivedPhase::Complete
        } else {
            ReceivedPhase::Receiving
        };
        store.metrics.record_chunk(chunk.content.len());

        debug!(
            target: "snapstore::received",
            snapshot_id = %self.inner.id,
            chunk = %chunk.id(),
            applied = state.applied,
            total = chunk.total_count,
            "Applied snapshot chunk"
        );
        Ok(())
    }

    fn validate(&self, state: &ReceivedState, chunk: &SnapshotChunk) -> Result<()> {
        let chunk_snapshot_id = SnapshotId::parse(&chunk.snapshot_id).ok();
        if chunk_snapshot_id != Some(self.inner.id) {
            return Err(ChunkWriteError::SnapshotIdMismatch {
                expected: self.inner.id.encode(),
                actual: chunk.snapshot_id.clone(),
                chunk: chunk.chunk_name.clone(),
            }
            .into());
        }

        if let Some(expected) = state.total_count {
            if expected != chunk.total_count {
                return Err(ChunkWriteError::TotalCountMismatch {
                    expected,
                    actual: chunk.total_count,
                    chunk: chunk.chunk_name.clone(),
                }
                .into());
            }
        }

        let actual = crc32c::crc32c(&chunk.content);
        if actual != chunk.checksum {
            return Err(ChunkWriteError::ChecksumMismatch {
                expected: chunk.checksum,
                actual,
                chunk: chunk.chunk_name.clone(),
            }
            .into());
        }

        if let Some(expected) = state.snapshot_checksum {
            if expected != chunk.snapshot_checksum {
                return Err(ChunkWriteError::SnapshotChecksumMismatch {
                    expected,
                    actual: chunk.snapshot_checksum,
                    chunk: chunk.chunk_name.clone(),
                }
                .into());
            }
        }

        validate_chunk_name(&chunk.chunk_name)?;
        Ok(())
    }

    /// Discard the snapshot and remove its staging directory.
    ///
    /// Aborting a persisted snapshot is a no-op.
    pub fn abort(&self) -> ActorFuture<()> {
        let this = self.clone();
        StoreInner::submit_weak(&self.inner.store, move |store| this.abort_on_actor(store))
    }

    fn abort_on_actor(&self, store: &StoreInner) -> Result<()> {
        let mut state = self.inner.state.lock();
        if matches!(state.phase, ReceivedPhase::Persisted | ReceivedPhase::Aborted) {
            return Ok(());
        }
        state.phase = ReceivedPhase::Aborted;
        drop(state);
        remove_dir_if_exists(&self.inner.directory)?;
        store.unregister_pending(&self.inner.id);
        debug!(
            target: "snapstore::received",
            snapshot_id = %self.inner.id,
            "Aborted received snapshot"
        );
        Ok(())
    }

    /// Commit the snapshot once every chunk has been applied.
    ///
    /// The rebuilt directory's combined checksum must match the checksum the
    /// chunks declared; on mismatch the snapshot is aborted and a corruption
    /// error returned.
    pub fn persist(&self) -> ActorFuture<PersistedSnapshot> {
        let this = self.clone();
        StoreInner::submit_weak(&self.inner.store, move |store| this.persist_on_actor(store))
    }

    fn persist_on_actor(&self, store: &Arc<StoreInner>) -> Result<PersistedSnapshot> {
        let mut state = self.inner.state.lock();
        let expected_checksum = match state.phase {
            ReceivedPhase::Persisted => {
                if let Some(persisted) = &state.persisted {
                    return Ok(persisted.clone());
                }
                return Err(SnapshotError::illegal_state("persisted snapshot handle missing"));
            }
            ReceivedPhase::Complete => state.snapshot_checksum,
            ReceivedPhase::Empty | ReceivedPhase::Receiving => {
                return Err(SnapshotError::illegal_state(format!(
                    "snapshot {} is incomplete: {} of {} chunks applied",
                    self.inner.id,
                    state.applied,
                    state.total_count.unwrap_or(0)
                )));
            }
            ReceivedPhase::Aborted => {
                return Err(SnapshotError::illegal_state(format!(
                    "snapshot {} was aborted",
                    self.inner.id
                )));
            }
        };

        match store.commit(&self.inner.id, &self.inner.directory, None, expected_checksum) {
            Ok(outcome) => {
                let persisted = outcome.snapshot().clone();
                state.phase = ReceivedPhase::Persisted;
                state.persisted = Some(persisted.clone());
                drop(state);
                store.notify_listeners(&outcome);
                Ok(persisted)
            }
            Err(e) => {
                warn!(
                    target: "snapstore::received",
                    snapshot_id = %self.inner.id,
                    error = %e,
                    "Failed to persist received snapshot, aborting"
                );
                state.phase = ReceivedPhase::Aborted;
                drop(state);
                remove_dir_if_exists(&self.inner.directory)?;
                store.unregister_pending(&self.inner.id);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ReceivedSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedSnapshot")
            .field("id", &self.inner.id)
            .field("directory", &self.inner.directory)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Chunk names must name a file directly inside the snapshot directory
fn validate_chunk_name(name: &str) -> std::result::Result<(), ChunkWriteError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(ChunkWriteError::InvalidChunkName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_chunk_names() {
        for name in ["file1", "snapshot.metadata", "000001.sst", "a..b"] {
            assert!(validate_chunk_name(name).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_invalid_chunk_names() {
        for name in ["", ".", "..", "../escape", "dir/file", "dir\\file", "nul\0"] {
            assert_eq!(
                validate_chunk_name(name),
                Err(ChunkWriteError::InvalidChunkName(name.to_string()))
            );
        }
    }

    #[test]
    fn test_detached_snapshot_is_closed() {
        let id = SnapshotId::new(1, 0, 1, 0, 0);
        let snapshot = ReceivedSnapshot::new(id, PathBuf::from("/nonexistent"), Weak::new());
        assert_eq!(snapshot.phase(), ReceivedPhase::Empty);
        assert!(!snapshot.contains_chunk(&ChunkId::from("file1")));
        assert!(snapshot.is_expected_chunk(&ChunkId::from("file1")));
        assert!(matches!(snapshot.persist().join(), Err(SnapshotError::Closed)));
    }
}
