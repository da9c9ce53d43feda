//! Locally taken snapshots
//!
//! A transient snapshot is written by the state machine into a staging
//! directory and only becomes visible to readers once persisted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use snapstore_core::{Result, SnapshotError, SnapshotId, SnapshotMetadata};
use snapstore_durability::files::remove_dir_if_exists;
use tracing::{debug, warn};

use crate::actor::ActorFuture;
use crate::persisted::PersistedSnapshot;
use crate::store::StoreInner;

/// Lifecycle of a transient snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientPhase {
    /// Registered, nothing written
    Created,
    /// Writer is running
    Writing,
    /// Writer finished successfully
    Written,
    /// Committed
    Persisted,
    /// Discarded
    Aborted,
}

struct TransientState {
    phase: TransientPhase,
    metadata: SnapshotMetadata,
    persisted: Option<PersistedSnapshot>,
}

struct TransientInner {
    id: SnapshotId,
    directory: PathBuf,
    store: Weak<StoreInner>,
    state: Mutex<TransientState>,
}

/// Handle to a snapshot being taken locally. Cheap to clone.
#[derive(Clone)]
pub struct TransientSnapshot {
    inner: Arc<TransientInner>,
}

impl TransientSnapshot {
    pub(crate) fn new(id: SnapshotId, directory: PathBuf, store: Weak<StoreInner>) -> Self {
        let metadata = SnapshotMetadata::from_id(&id);
        TransientSnapshot {
            inner: Arc::new(TransientInner {
                id,
                directory,
                store,
                state: Mutex::new(TransientState {
                    phase: TransientPhase::Created,
                    metadata,
                    persisted: None,
                }),
            }),
        }
    }

    /// Snapshot id
    pub fn id(&self) -> &SnapshotId {
        &self.inner.id
    }

    /// Staging directory the writer fills
    pub fn path(&self) -> &Path {
        &self.inner.directory
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> TransientPhase {
        self.inner.state.lock().phase
    }

    /// Metadata that persist will write
    pub fn metadata(&self) -> SnapshotMetadata {
        self.inner.state.lock().metadata
    }

    /// Record the highest follow-up event position written by processing.
    pub fn set_last_followup_event_position(&self, position: i64) {
        self.inner.state.lock().metadata.last_followup_event_position = position;
    }

    /// Mark the snapshot as a bootstrap snapshot
    pub fn mark_bootstrap(&self) {
        let mut state = self.inner.state.lock();
        state.metadata = state.metadata.bootstrap();
    }

    /// Run `writer` against the staging directory.
    ///
    /// Can only be called once. If the writer fails, the snapshot is aborted
    /// and its directory removed.
    pub fn take<F>(&self, writer: F) -> ActorFuture<()>
    where
        F: FnOnce(&Path) -> io::Result<()> + Send + 'static,
    {
        let this = self.clone();
        StoreInner::submit_weak(&self.inner.store, move |store| this.take_on_actor(store, writer))
    }

    fn take_on_actor<F>(&self, store: &Arc<StoreInner>, writer: F) -> Result<()>
    where
        F: FnOnce(&Path) -> io::Result<()>,
    {
        {
            let mut state = self.inner.state.lock();
            if state.phase != TransientPhase::Created {
                return Err(SnapshotError::illegal_state(format!(
                    "snapshot {} cannot be taken in phase {:?}",
                    self.inner.id, state.phase
                )));
            }
            if !store.is_pending(&self.inner.id) {
                state.phase = TransientPhase::Aborted;
                return Err(SnapshotError::illegal_state(format!(
                    "snapshot {} was purged before it was taken",
                    self.inner.id
                )));
            }
            state.phase = TransientPhase::Writing;
        }

        let written = fs::create_dir_all(&self.inner.directory).and_then(|_| {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                writer(&self.inner.directory)
            })) {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::Other,
                    "snapshot writer panicked",
                )),
            }
        });

        match written {
            Ok(()) => {
                self.inner.state.lock().phase = TransientPhase::Written;
                debug!(
                    target: "snapstore::store",
                    snapshot_id = %self.inner.id,
                    "Snapshot written to staging directory"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    target: "snapstore::store",
                    snapshot_id = %self.inner.id,
                    error = %e,
                    "Snapshot writer failed, aborting"
                );
                self.abort_on_actor(store)?;
                Err(SnapshotError::Io(e))
            }
        }
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
        match state.phase {
            TransientPhase::Persisted | TransientPhase::Aborted => Ok(()),
            _ => {
                state.phase = TransientPhase::Aborted;
                drop(state);
                remove_dir_if_exists(&self.inner.directory)?;
                store.unregister_pending(&self.inner.id);
                debug!(
                    target: "snapstore::store",
                    snapshot_id = %self.inner.id,
                    "Aborted transient snapshot"
                );
                Ok(())
            }
        }
    }

    /// Commit the snapshot.
    ///
    /// Writes the metadata file, checksums the directory, and atomically
    /// moves it into the committed root. Persisting again returns the same
    /// snapshot. If a newer snapshot was committed in the meantime this one
    /// is dropped and the newer one is returned.
    pub fn persist(&self) -> ActorFuture<PersistedSnapshot> {
        let this = self.clone();
        StoreInner::submit_weak(&self.inner.store, move |store| this.persist_on_actor(store))
    }

    fn persist_on_actor(&self, store: &Arc<StoreInner>) -> Result<PersistedSnapshot> {
        let mut state = self.inner.state.lock();
        match state.phase {
            TransientPhase::Persisted => {
                if let Some(persisted) = &state.persisted {
                    return Ok(persisted.clone());
                }
                Err(SnapshotError::illegal_state("persisted snapshot handle missing"))
            }
            TransientPhase::Written => {
                let metadata = state.metadata;
                let outcome = match store.commit(
                    &self.inner.id,
                    &self.inner.directory,
                    Some(&metadata),
                    None,
                ) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        state.phase = TransientPhase::Aborted;
                        drop(state);
                        remove_dir_if_exists(&self.inner.directory)?;
                        store.unregister_pending(&self.inner.id);
                        return Err(e);
                    }
                };
                let persisted = outcome.snapshot().clone();
                state.phase = TransientPhase::Persisted;
                state.persisted = Some(persisted.clone());
                drop(state);
                store.notify_listeners(&outcome);
                Ok(persisted)
            }
            phase => Err(SnapshotError::illegal_state(format!(
                "snapshot {} cannot be persisted in phase {:?}",
                self.inner.id, phase
            ))),
        }
    }
}

impl std::fmt::Debug for TransientSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientSnapshot")
            .field("id", &self.inner.id)
            .field("directory", &self.inner.directory)
            .field("phase", &self.phase())
            .finish()
    }
}
