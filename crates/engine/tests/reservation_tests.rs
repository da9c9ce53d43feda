//! Reservation Tests
//!
//! Reserved snapshots must survive supersession and explicit deletion until
//! their last reservation is released. Durable reservations must also
//! survive a restart.

use snapstore_core::SnapshotError;
use snapstore_engine::{PersistedSnapshot, ReservationId, SnapshotStore, SnapshotStoreConfig};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn open(path: &Path) -> SnapshotStore {
    SnapshotStore::open(path, SnapshotStoreConfig::for_testing()).unwrap()
}

fn take_snapshot(store: &SnapshotStore, index: u64) -> PersistedSnapshot {
    let transient = store
        .new_transient_snapshot(index, 0, index as i64, 0)
        .join()
        .unwrap()
        .unwrap();
    transient
        .take(move |dir| fs::write(dir.join("state"), index.to_string()))
        .join()
        .unwrap();
    transient.persist().join().unwrap()
}

#[test]
fn test_reserved_snapshot_survives_supersession() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path());
    let first = take_snapshot(&store, 1);
    let reservation = first.reserve().join().unwrap();
    assert!(first.is_reserved());

    let second = take_snapshot(&store, 2);
    assert!(first.path().exists());
    assert!(first.checksum_path().exists());
    assert_eq!(store.available_snapshots(), vec![first.clone(), second.clone()]);
    assert_eq!(store.latest_snapshot().unwrap(), second);

    // still readable while reserved
    let read: Vec<_> = first
        .new_chunk_reader()
        .unwrap()
        .map(|c| c.unwrap())
        .collect();
    assert!(!read.is_empty());

    reservation.release().join().unwrap();
    assert!(!first.is_reserved());
    assert!(!first.path().exists());
    assert!(!first.checksum_path().exists());
    assert_eq!(store.available_snapshots(), vec![second]);
}

#[test]
fn test_released_latest_is_kept() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path());
    let snapshot = take_snapshot(&store, 1);

    let reservation = snapshot.reserve().join().unwrap();
    reservation.release().join().unwrap();

    assert!(snapshot.path().exists());
    assert_eq!(store.latest_snapshot().unwrap(), snapshot);
}

#[test]
fn test_multiple_reservations() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path());
    let first = take_snapshot(&store, 1);
    let a = first.reserve().join().unwrap();
    let b = first.reserve_with_persistence().join().unwrap();
    assert_ne!(a.id(), b.id());
    assert!(b.is_durable());

    take_snapshot(&store, 2);

    // release order does not matter
    b.release().join().unwrap();
    assert!(first.is_reserved());
    assert!(first.path().exists());

    a.release().join().unwrap();
    assert!(!first.is_reserved());
    assert!(!first.path().exists());
}

#[test]
fn test_double_release_is_noop() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path());
    let first = take_snapshot(&store, 1);
    let a = first.reserve().join().unwrap();
    let b = first.reserve().join().unwrap();

    a.release().join().unwrap();
    a.release().join().unwrap();
    assert!(first.is_reserved());
    b.release().join().unwrap();
    assert!(!first.is_reserved());
}

#[test]
fn test_delete_reserved_snapshot_is_deferred() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path());
    let snapshot = take_snapshot(&store, 1);
    let reservation = snapshot.reserve().join().unwrap();

    let err = snapshot.delete().join().unwrap_err();
    assert!(matches!(err, SnapshotError::Reserved(id) if id == *snapshot.id()));
    assert!(snapshot.path().exists());
    assert_eq!(store.latest_snapshot().unwrap(), snapshot);

    reservation.release().join().unwrap();
    assert!(!snapshot.path().exists());
    assert!(store.latest_snapshot().is_none());
}

#[test]
fn test_delete_unreserved_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path());
    let snapshot = take_snapshot(&store, 1);

    snapshot.delete().join().unwrap();
    assert!(!snapshot.path().exists());
    assert!(!snapshot.checksum_path().exists());
    assert!(store.latest_snapshot().is_none());

    // deleting again is harmless
    snapshot.delete().join().unwrap();
}

#[test]
fn test_reserving_deleted_snapshot_fails() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path());
    let first = take_snapshot(&store, 1);
    take_snapshot(&store, 2);

    let err = first.reserve().join().unwrap_err();
    assert!(matches!(err, SnapshotError::IllegalState(_)));
}

#[test]
fn test_lookup_reservation_by_id() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path());
    let snapshot = take_snapshot(&store, 1);
    let reservation = snapshot.reserve_with_persistence().join().unwrap();

    let found = store.persisted_snapshot_reservation(reservation.id()).unwrap();
    assert_eq!(found.snapshot_id(), snapshot.id());
    assert!(found.is_durable());
    assert!(store
        .persisted_snapshot_reservation(ReservationId::new(999))
        .is_none());

    found.release().join().unwrap();
    assert!(store.persisted_snapshot_reservation(reservation.id()).is_none());
}

#[test]
fn test_failed_durable_release_keeps_reservation() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path());
    let first = take_snapshot(&store, 1);
    let reservation = first.reserve_with_persistence().join().unwrap();
    take_snapshot(&store, 2);

    // a directory in place of the record file cannot be removed as a file
    let record = temp_dir
        .path()
        .join("reservations")
        .join(reservation.id().value().to_string());
    fs::remove_file(&record).unwrap();
    fs::create_dir(&record).unwrap();
    fs::write(record.join("blocker"), b"x").unwrap();

    assert!(reservation.release().join().is_err());
    assert!(store.persisted_snapshot_reservation(reservation.id()).is_some());
    assert!(first.is_reserved());
    assert!(first.path().exists());

    fs::remove_dir_all(&record).unwrap();
    reservation.release().join().unwrap();
    assert!(store.persisted_snapshot_reservation(reservation.id()).is_none());
    assert!(!first.path().exists());
}

// ============================================================================
// Restart
// ============================================================================

#[test]
fn test_durable_reservation_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path());
    let first = take_snapshot(&store, 1);
    let durable = first.reserve_with_persistence().join().unwrap();
    let durable_id = durable.id();
    take_snapshot(&store, 2);
    store.close();

    let store = open(temp_dir.path());
    let available = store.available_snapshots();
    assert_eq!(available.len(), 2);
    let reopened_first = store.snapshot(1).unwrap();
    assert!(reopened_first.is_reserved());

    // new ids never collide with reservations taken before the restart
    let fresh = reopened_first.reserve().join().unwrap();
    assert!(fresh.id() > durable_id);
    fresh.release().join().unwrap();
    assert!(reopened_first.path().exists());

    let loaded = store.persisted_snapshot_reservation(durable_id).unwrap();
    loaded.release().join().unwrap();
    assert!(!reopened_first.path().exists());
    assert_eq!(store.available_snapshots().len(), 1);
    assert!(fs::read_dir(temp_dir.path().join("reservations"))
        .unwrap()
        .next()
        .is_none());
}

#[test]
fn test_in_memory_reservation_lost_on_restart() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(temp_dir.path());
    let first = take_snapshot(&store, 1);
    let _reservation = first.reserve().join().unwrap();
    take_snapshot(&store, 2);
    assert!(first.path().exists());
    store.close();

    let store = open(temp_dir.path());
    assert_eq!(store.available_snapshots().len(), 1);
    assert_eq!(store.latest_snapshot().unwrap().index(), 2);
    assert!(!first.path().exists());
}
