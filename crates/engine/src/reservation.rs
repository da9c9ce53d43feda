//! Reservations keeping persisted snapshots alive
//!
//! A reservation is a counted claim on a committed snapshot. While any
//! reservation on a snapshot is held, neither supersession nor an explicit
//! delete removes its files. Durable reservations are also recorded on disk
//! and survive a restart.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Weak;

use snapstore_core::SnapshotId;
use snapstore_durability::ReservationRecord;

use crate::actor::ActorFuture;
use crate::store::StoreInner;

/// Store-unique reservation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId(u64);

impl ReservationId {
    /// Wrap a raw id, e.g. one handed back by a caller after a restart
    pub fn new(value: u64) -> Self {
        ReservationId(value)
    }

    /// Raw value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a held reservation.
///
/// Dropping the handle does not release the reservation; call
/// [`Reservation::release`].
#[derive(Debug, Clone)]
pub struct Reservation {
    id: ReservationId,
    snapshot_id: SnapshotId,
    durable: bool,
    store: Weak<StoreInner>,
}

impl Reservation {
    pub(crate) fn new(
        id: ReservationId,
        snapshot_id: SnapshotId,
        durable: bool,
        store: Weak<StoreInner>,
    ) -> Self {
        Reservation {
            id,
            snapshot_id,
            durable,
            store,
        }
    }

    /// Id of this reservation
    pub fn id(&self) -> ReservationId {
        self.id
    }

    /// Snapshot this reservation keeps alive
    pub fn snapshot_id(&self) -> &SnapshotId {
        &self.snapshot_id
    }

    /// True if the reservation is recorded on disk
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Release the reservation.
    ///
    /// Releasing the last reservation of a superseded or delete-pending
    /// snapshot removes it. Releasing twice is a no-op.
    pub fn release(&self) -> ActorFuture<()> {
        let id = self.id;
        StoreInner::submit_weak(&self.store, move |store| store.release(id))
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ReservationEntry {
    pub(crate) snapshot_id: SnapshotId,
    pub(crate) durable: bool,
}

/// In-memory reservation bookkeeping, owned by the store state
#[derive(Debug, Default)]
pub(crate) struct ReservationTable {
    entries: BTreeMap<ReservationId, ReservationEntry>,
    next_id: u64,
}

impl ReservationTable {
    /// Table seeded from durable records; new ids continue after the highest
    /// loaded one.
    pub(crate) fn from_records(records: &[ReservationRecord]) -> Self {
        let mut table = ReservationTable::default();
        for record in records {
            table.entries.insert(
                ReservationId(record.reservation_id),
                ReservationEntry {
                    snapshot_id: record.snapshot_id,
                    durable: true,
                },
            );
            table.next_id = table.next_id.max(record.reservation_id.saturating_add(1));
        }
        table
    }

    pub(crate) fn allocate(&mut self, snapshot_id: SnapshotId, durable: bool) -> ReservationId {
        let id = ReservationId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            ReservationEntry {
                snapshot_id,
                durable,
            },
        );
        id
    }

    pub(crate) fn get(&self, id: ReservationId) -> Option<ReservationEntry> {
        self.entries.get(&id).copied()
    }

    pub(crate) fn release(&mut self, id: ReservationId) -> Option<ReservationEntry> {
        self.entries.remove(&id)
    }

    /// Number of reservations held on a snapshot
    pub(crate) fn count(&self, snapshot_id: &SnapshotId) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.snapshot_id == *snapshot_id)
            .count()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
