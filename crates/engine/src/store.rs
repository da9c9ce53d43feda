//! Snapshot store
//!
//! Owns one store root on disk:
//!
//! ```text
//! <root>/snapshots/<id>/...        committed snapshots
//! <root>/snapshots/<id>.checksum   their SFV checksum files
//! <root>/pending/<id>/...          staging directories
//! <root>/reservations/<n>          durable reservation records
//! ```
//!
//! All mutations run on the store's actor, one at a time. The latest
//! snapshot is published through a lock-protected immutable handle so reads
//! never wait for the actor.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use snapstore_core::{Result, SnapshotError, SnapshotId, SnapshotMetadata, METADATA_FILE_NAME};
use snapstore_durability::files::{remove_dir_if_exists, sync_dir, sync_dir_contents};
use snapstore_durability::{
    ChecksumProvider, ChecksumSet, DurableReservations, ReservationRecord, StorePaths,
};
use tracing::{debug, error, info, warn};

use crate::actor::{ActorFuture, ActorStats, SnapshotActor};
use crate::config::SnapshotStoreConfig;
use crate::listener::{same_listener, SnapshotListener};
use crate::metrics::{SnapshotCounters, SnapshotMetrics};
use crate::persisted::PersistedSnapshot;
use crate::received::ReceivedSnapshot;
use crate::recovery::{delete_snapshot_files, purge_pending, read_metadata, recover};
use crate::reservation::{Reservation, ReservationId, ReservationTable};
use crate::transient::TransientSnapshot;

/// Replicated snapshot store for one partition. Cheap to clone.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<StoreInner>,
}

impl SnapshotStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Runs startup recovery before returning: leftover staging directories
    /// are removed and committed snapshots that fail verification are
    /// deleted.
    pub fn open(root: impl AsRef<Path>, config: SnapshotStoreConfig) -> Result<Self> {
        Self::open_inner(root.as_ref(), config, None)
    }

    /// Open a store whose per-file checksums come from `provider` where it
    /// has them.
    pub fn open_with_checksum_provider(
        root: impl AsRef<Path>,
        config: SnapshotStoreConfig,
        provider: Arc<dyn ChecksumProvider>,
    ) -> Result<Self> {
        Self::open_inner(root.as_ref(), config, Some(provider))
    }

    fn open_inner(
        root: &Path,
        config: SnapshotStoreConfig,
        checksum_provider: Option<Arc<dyn ChecksumProvider>>,
    ) -> Result<Self> {
        config.validate()?;

        let paths = StorePaths::from_root(root);
        let durable_reservations = DurableReservations::new(paths.clone());
        let recovery = recover(
            &paths,
            &durable_reservations,
            checksum_provider.as_deref(),
            config.checksum_block_size,
        )?;

        let actor = SnapshotActor::spawn(&config.actor_name)?;
        let metrics = SnapshotMetrics::default();
        metrics.record_corrupted(recovery.corrupted);
        let reservations = ReservationTable::from_records(&recovery.reservations);

        let inner = Arc::new_cyclic(|store: &Weak<StoreInner>| {
            let available: BTreeMap<SnapshotId, PersistedSnapshot> = recovery
                .snapshots
                .into_iter()
                .map(|s| {
                    let snapshot = PersistedSnapshot::new(
                        s.id,
                        s.path,
                        s.checksum_path,
                        s.metadata,
                        s.checksums,
                        store.clone(),
                    );
                    (s.id, snapshot)
                })
                .collect();
            let latest = available.values().next_back().cloned();

            StoreInner {
                paths,
                config,
                actor,
                state: Mutex::new(StoreState {
                    available,
                    pending: BTreeSet::new(),
                    reservations,
                    deferred_deletes: BTreeSet::new(),
                }),
                latest: RwLock::new(latest),
                listeners: Mutex::new(Vec::new()),
                checksum_provider,
                durable_reservations,
                metrics,
            }
        });

        info!(
            target: "snapstore::store",
            root = %root.display(),
            latest = ?inner.latest.read().as_ref().map(|s| s.id().encode()),
            "Opened snapshot store"
        );

        Ok(SnapshotStore { inner })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        self.inner.paths.root()
    }

    /// Configuration the store was opened with
    pub fn config(&self) -> &SnapshotStoreConfig {
        &self.inner.config
    }

    /// Start a local snapshot at the given log position.
    ///
    /// Resolves to `None` if the latest snapshot or one already in flight
    /// covers the same index at the same or a later position.
    pub fn new_transient_snapshot(
        &self,
        index: u64,
        term: u64,
        processed_position: i64,
        exported_position: i64,
    ) -> ActorFuture<Option<TransientSnapshot>> {
        let id = SnapshotId::new(
            index,
            term,
            processed_position,
            exported_position,
            self.inner.config.node_ordinal,
        );
        self.inner
            .submit(move |store| store.new_transient_snapshot(id))
    }

    /// Start receiving the snapshot with the encoded id `id`
    pub fn new_received_snapshot(&self, id: &str) -> ActorFuture<ReceivedSnapshot> {
        let id = match SnapshotId::parse(id) {
            Ok(id) => id,
            Err(e) => return ActorFuture::ready(Err(e.into())),
        };
        self.inner
            .submit(move |store| store.new_received_snapshot(id))
    }

    /// Newest committed snapshot
    pub fn latest_snapshot(&self) -> Option<PersistedSnapshot> {
        self.inner.latest_snapshot()
    }

    /// Every committed snapshot not yet deleted, oldest first.
    ///
    /// Holds more than one entry only while older snapshots are reserved.
    pub fn available_snapshots(&self) -> Vec<PersistedSnapshot> {
        self.inner.state.lock().available.values().cloned().collect()
    }

    /// Newest committed snapshot at `index`
    pub fn snapshot(&self, index: u64) -> Option<PersistedSnapshot> {
        self.inner
            .state
            .lock()
            .available
            .values()
            .rev()
            .find(|snapshot| snapshot.index() == index)
            .cloned()
    }

    /// Index of the latest snapshot, 0 if there is none
    pub fn current_snapshot_index(&self) -> u64 {
        self.latest_snapshot().map(|s| s.index()).unwrap_or(0)
    }

    /// Abort every transient and received snapshot in flight and remove the
    /// pending root's contents. Committed snapshots are untouched.
    pub fn purge_pending_snapshots(&self) -> ActorFuture<()> {
        self.inner.submit(|store| store.purge_pending_snapshots())
    }

    /// Register a listener for newly committed snapshots
    pub fn add_snapshot_listener(&self, listener: Arc<dyn SnapshotListener>) -> ActorFuture<()> {
        self.inner.submit(move |store| {
            store.listeners.lock().push(listener);
            Ok(())
        })
    }

    /// Unregister a listener previously passed to
    /// [`add_snapshot_listener`](Self::add_snapshot_listener)
    pub fn remove_snapshot_listener(
        &self,
        listener: &Arc<dyn SnapshotListener>,
    ) -> ActorFuture<()> {
        let listener = Arc::clone(listener);
        self.inner.submit(move |store| {
            store
                .listeners
                .lock()
                .retain(|registered| !same_listener(registered, &listener));
            Ok(())
        })
    }

    /// Look up a live reservation by id, e.g. a durable one taken before a
    /// restart
    pub fn persisted_snapshot_reservation(&self, id: ReservationId) -> Option<Reservation> {
        let entry = self.inner.state.lock().reservations.get(id)?;
        Some(Reservation::new(
            id,
            entry.snapshot_id,
            entry.durable,
            Arc::downgrade(&self.inner),
        ))
    }

    /// Remove the whole store from disk: committed snapshots, staging
    /// directories and reservation records.
    pub fn delete(&self) -> ActorFuture<()> {
        self.inner.submit(|store| store.delete_all())
    }

    /// Store counters
    pub fn metrics(&self) -> SnapshotCounters {
        self.inner.metrics.counters()
    }

    /// Actor queue statistics
    pub fn actor_stats(&self) -> ActorStats {
        self.inner.actor.stats()
    }

    /// Run queued operations and stop the actor.
    ///
    /// Later operations resolve to `SnapshotError::Closed`.
    pub fn close(&self) {
        self.inner.actor.shutdown();
        debug!(target: "snapstore::store", root = %self.root().display(), "Closed snapshot store");
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("root", &self.inner.paths.root())
            .field("latest", &self.latest_snapshot().map(|s| *s.id()))
            .finish()
    }
}

/// Result of committing a staging snapshot
pub(crate) enum CommitOutcome {
    /// The staging snapshot is now the latest
    Committed(PersistedSnapshot),
    /// An equal or newer snapshot already existed; the staging snapshot was
    /// dropped and this is the existing latest
    Superseded(PersistedSnapshot),
}

impl CommitOutcome {
    pub(crate) fn snapshot(&self) -> &PersistedSnapshot {
        match self {
            CommitOutcome::Committed(snapshot) | CommitOutcome::Superseded(snapshot) => snapshot,
        }
    }
}

struct StoreState {
    available: BTreeMap<SnapshotId, PersistedSnapshot>,
    pending: BTreeSet<SnapshotId>,
    reservations: ReservationTable,
    /// Snapshots whose explicit delete waits for their last reservation
    deferred_deletes: BTreeSet<SnapshotId>,
}

/// Shared store state. Lock order: `state` before `latest`.
pub(crate) struct StoreInner {
    paths: StorePaths,
    pub(crate) config: SnapshotStoreConfig,
    actor: SnapshotActor,
    state: Mutex<StoreState>,
    latest: RwLock<Option<PersistedSnapshot>>,
    listeners: Mutex<Vec<Arc<dyn SnapshotListener>>>,
    checksum_provider: Option<Arc<dyn ChecksumProvider>>,
    durable_reservations: DurableReservations,
    pub(crate) metrics: SnapshotMetrics,
}

impl StoreInner {
    /// Run `work` on the store's actor
    pub(crate) fn submit<T, F>(self: &Arc<Self>, work: F) -> ActorFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<StoreInner>) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(self);
        self.actor.submit(move || work(&store))
    }

    /// Run `work` on the actor of the store behind `store`, if it still exists
    pub(crate) fn submit_weak<T, F>(store: &Weak<StoreInner>, work: F) -> ActorFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<StoreInner>) -> Result<T> + Send + 'static,
    {
        match store.upgrade() {
            Some(store) => store.submit(work),
            None => ActorFuture::ready(Err(SnapshotError::Closed)),
        }
    }

    fn latest_snapshot(&self) -> Option<PersistedSnapshot> {
        self.latest.read().clone()
    }

    fn refresh_latest(&self, state: &StoreState) {
        *self.latest.write() = state.available.values().next_back().cloned();
    }

    pub(crate) fn is_pending(&self, id: &SnapshotId) -> bool {
        self.state.lock().pending.contains(id)
    }

    pub(crate) fn unregister_pending(&self, id: &SnapshotId) {
        let mut state = self.state.lock();
        state.pending.remove(id);
        self.metrics.set_pending(state.pending.len());
    }

    pub(crate) fn is_reserved(&self, id: &SnapshotId) -> bool {
        self.state.lock().reservations.count(id) > 0
    }

    fn new_transient_snapshot(self: &Arc<Self>, id: SnapshotId) -> Result<Option<TransientSnapshot>> {
        let mut state = self.state.lock();

        let covered_by_latest = self
            .latest
            .read()
            .as_ref()
            .map(|latest| latest.index() == id.index() && *latest.id() >= id)
            .unwrap_or(false);
        let covered_by_pending = state
            .pending
            .iter()
            .any(|pending| pending.index() == id.index() && *pending >= id);
        if covered_by_latest || covered_by_pending {
            debug!(
                target: "snapstore::store",
                snapshot_id = %id,
                "Snapshot for this index already exists or is in flight"
            );
            return Ok(None);
        }

        state.pending.insert(id);
        self.metrics.set_pending(state.pending.len());
        debug!(target: "snapstore::store", snapshot_id = %id, "Created transient snapshot");

        Ok(Some(TransientSnapshot::new(
            id,
            self.paths.pending_snapshot_dir(&id),
            Arc::downgrade(self),
        )))
    }

    fn new_received_snapshot(self: &Arc<Self>, id: SnapshotId) -> Result<ReceivedSnapshot> {
        let mut state = self.state.lock();
        if !state.pending.insert(id) {
            return Err(SnapshotError::illegal_state(format!(
                "snapshot {} is already in flight",
                id
            )));
        }
        self.metrics.set_pending(state.pending.len());
        debug!(target: "snapstore::received", snapshot_id = %id, "Created received snapshot");

        Ok(ReceivedSnapshot::new(
            id,
            self.paths.pending_snapshot_dir(&id),
            Arc::downgrade(self),
        ))
    }

    /// Promote a staging directory to the latest committed snapshot.
    ///
    /// `metadata` is written into the directory first when given. With
    /// `expected_checksum` the rebuilt directory must reproduce that combined
    /// checksum. The rename into the committed root is the commit point.
    pub(crate) fn commit(
        self: &Arc<Self>,
        id: &SnapshotId,
        directory: &Path,
        metadata: Option<&SnapshotMetadata>,
        expected_checksum: Option<u64>,
    ) -> Result<CommitOutcome> {
        let started = Instant::now();

        if let Some(latest) = self.latest_snapshot() {
            if latest.id().same_position(id) || latest.id() > id {
                debug!(
                    target: "snapstore::store",
                    snapshot_id = %id,
                    latest = %latest.id(),
                    "Dropping snapshot not newer than the latest"
                );
                remove_dir_if_exists(directory)?;
                self.unregister_pending(id);
                return Ok(CommitOutcome::Superseded(latest));
            }
        }

        if !self.is_pending(id) {
            return Err(SnapshotError::illegal_state(format!(
                "snapshot {} is no longer pending",
                id
            )));
        }
        if !directory.is_dir() {
            return Err(SnapshotError::illegal_state(format!(
                "snapshot {} was never written",
                id
            )));
        }

        let mut checksums = ChecksumSet::calculate_with_provider(
            directory,
            self.checksum_provider.as_deref(),
            self.config.checksum_block_size,
        )?;
        // subdirectories are not snapshot content
        if checksums.is_empty() {
            return Err(SnapshotError::illegal_state(format!(
                "snapshot {} contains no files",
                id
            )));
        }
        if let Some(metadata) = metadata {
            let path = directory.join(METADATA_FILE_NAME);
            fs::write(&path, metadata.encode()?)?;
            checksums.update_from_file(&path)?;
        }
        if let Some(expected) = expected_checksum {
            let actual = checksums.combined_checksum();
            if actual != expected {
                return Err(SnapshotError::corruption(format!(
                    "snapshot {} has combined checksum {:016x}, expected {:016x}",
                    id, actual, expected
                )));
            }
        }
        let metadata = match metadata {
            Some(metadata) => *metadata,
            None => read_metadata(directory, id)?,
        };

        sync_dir_contents(directory)?;
        let size = dir_size(directory)?;

        let snapshot_dir = self.paths.snapshot_dir(id);
        let checksum_path = self.paths.checksum_path(id);
        checksums.set_snapshot_directory(&snapshot_dir);
        checksums.persist(&checksum_path)?;
        remove_dir_if_exists(&snapshot_dir)?;
        fs::rename(directory, &snapshot_dir)?;
        sync_dir(&self.paths.snapshots_dir())?;
        sync_dir(&self.paths.pending_dir())?;

        let file_count = checksums.len();
        let persisted = PersistedSnapshot::new(
            *id,
            snapshot_dir,
            checksum_path,
            metadata,
            checksums,
            Arc::downgrade(self),
        );

        let mut state = self.state.lock();
        state.pending.remove(id);
        state.available.insert(*id, persisted.clone());
        *self.latest.write() = Some(persisted.clone());

        let older: Vec<SnapshotId> = state.available.range(..*id).map(|(old, _)| *old).collect();
        for old in older {
            if state.reservations.count(&old) > 0 {
                info!(
                    target: "snapstore::store",
                    snapshot_id = %old,
                    "Superseded snapshot is reserved, deferring deletion"
                );
                continue;
            }
            if let Some(snapshot) = state.available.remove(&old) {
                if let Err(e) = self.remove_committed(&snapshot) {
                    warn!(
                        target: "snapstore::store",
                        snapshot_id = %old,
                        error = %e,
                        "Failed to delete superseded snapshot"
                    );
                }
            }
            state.deferred_deletes.remove(&old);
        }

        let older_pending: Vec<SnapshotId> = state.pending.range(..*id).copied().collect();
        for pending in older_pending {
            state.pending.remove(&pending);
            if let Err(e) = remove_dir_if_exists(&self.paths.pending_snapshot_dir(&pending)) {
                warn!(
                    target: "snapstore::store",
                    snapshot_id = %pending,
                    error = %e,
                    "Failed to remove superseded pending snapshot"
                );
            }
        }
        self.metrics.set_pending(state.pending.len());
        drop(state);

        let elapsed = started.elapsed();
        self.metrics
            .record_persist(elapsed, size, expected_checksum.is_some());
        info!(
            target: "snapstore::store",
            snapshot_id = %id,
            files = file_count,
            bytes = size,
            elapsed_us = elapsed.as_micros() as u64,
            "Committed snapshot"
        );

        Ok(CommitOutcome::Committed(persisted))
    }

    /// Invoke every listener for a newly committed snapshot
    pub(crate) fn notify_listeners(&self, outcome: &CommitOutcome) {
        let snapshot = match outcome {
            CommitOutcome::Committed(snapshot) => snapshot,
            CommitOutcome::Superseded(_) => return,
        };
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            let notified = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_new_snapshot(snapshot)
            }));
            if notified.is_err() {
                error!(
                    target: "snapstore::store",
                    snapshot_id = %snapshot.id(),
                    "Snapshot listener panicked"
                );
            }
        }
    }

    pub(crate) fn reserve(self: &Arc<Self>, id: SnapshotId, durable: bool) -> Result<Reservation> {
        let mut state = self.state.lock();
        if !state.available.contains_key(&id) {
            return Err(SnapshotError::illegal_state(format!(
                "snapshot {} was deleted and cannot be reserved",
                id
            )));
        }

        let reservation_id = state.reservations.allocate(id, durable);
        if durable {
            let record = ReservationRecord {
                reservation_id: reservation_id.value(),
                snapshot_id: id,
            };
            if let Err(e) = self.durable_reservations.write(&record) {
                state.reservations.release(reservation_id);
                return Err(e);
            }
        }

        debug!(
            target: "snapstore::store",
            snapshot_id = %id,
            reservation_id = reservation_id.value(),
            durable,
            "Reserved snapshot"
        );
        Ok(Reservation::new(reservation_id, id, durable, Arc::downgrade(self)))
    }

    pub(crate) fn release(&self, reservation_id: ReservationId) -> Result<()> {
        let mut state = self.state.lock();
        let entry = match state.reservations.get(reservation_id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        // the record stays reserved until its file is gone
        if entry.durable {
            self.durable_reservations.remove(reservation_id.value())?;
        }
        state.reservations.release(reservation_id);

        let id = entry.snapshot_id;
        debug!(
            target: "snapstore::store",
            snapshot_id = %id,
            reservation_id = reservation_id.value(),
            "Released reservation"
        );
        if state.reservations.count(&id) > 0 {
            return Ok(());
        }

        let is_latest = self
            .latest
            .read()
            .as_ref()
            .map(|latest| *latest.id() == id)
            .unwrap_or(false);
        let delete_requested = state.deferred_deletes.remove(&id);
        if delete_requested || !is_latest {
            if let Some(snapshot) = state.available.remove(&id) {
                self.remove_committed(&snapshot)?;
            }
            if is_latest {
                self.refresh_latest(&state);
            }
        }
        Ok(())
    }

    pub(crate) fn delete_snapshot(&self, id: &SnapshotId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.available.contains_key(id) {
            return Ok(());
        }
        if state.reservations.count(id) > 0 {
            state.deferred_deletes.insert(*id);
            warn!(
                target: "snapstore::store",
                snapshot_id = %id,
                "Snapshot is reserved, deletion deferred until released"
            );
            return Err(SnapshotError::Reserved(*id));
        }

        if let Some(snapshot) = state.available.remove(id) {
            self.remove_committed(&snapshot)?;
        }
        self.refresh_latest(&state);
        Ok(())
    }

    fn remove_committed(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        delete_snapshot_files(snapshot.path(), snapshot.checksum_path())?;
        self.metrics.record_deleted();
        info!(target: "snapstore::store", snapshot_id = %snapshot.id(), "Deleted snapshot");
        Ok(())
    }

    fn purge_pending_snapshots(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.pending.clear();
        self.metrics.set_pending(0);
        let purged = purge_pending(&self.paths)?;
        info!(target: "snapstore::store", count = purged, "Purged pending snapshots");
        Ok(())
    }

    fn delete_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.available.clear();
        state.pending.clear();
        state.reservations.clear();
        state.deferred_deletes.clear();
        *self.latest.write() = None;
        self.metrics.set_pending(0);

        remove_dir_if_exists(&self.paths.snapshots_dir())?;
        remove_dir_if_exists(&self.paths.pending_dir())?;
        remove_dir_if_exists(&self.paths.reservations_dir())?;
        sync_dir(self.paths.root())?;
        info!(target: "snapstore::store", root = %self.paths.root().display(), "Deleted snapshot store");
        Ok(())
    }
}

/// Total size of the regular files directly inside `dir`
fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let mut size = 0;
    for entry in fs::read_dir(dir)? {
        let metadata = entry?.metadata()?;
        if metadata.is_file() {
            size += metadata.len();
        }
    }
    Ok(size)
}
