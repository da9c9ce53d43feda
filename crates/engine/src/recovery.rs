//! Startup recovery of the committed snapshot root
//!
//! Recovery runs once when a store is opened, before its actor accepts work:
//!
//! 1. Remove every staging directory left under `pending/`
//! 2. Remove temp files and checksum files without a snapshot directory
//! 3. Verify each committed snapshot against its checksum file, newest first
//! 4. Keep the newest valid snapshot plus older valid snapshots that still
//!    hold durable reservations; delete everything else
//!
//! A snapshot that fails verification is logged and deleted. It never fails
//! the open.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use snapstore_core::{Result, SnapshotError, SnapshotId, SnapshotMetadata, METADATA_FILE_NAME};
use snapstore_durability::files::{remove_dir_if_exists, remove_file_if_exists, sync_dir};
use snapstore_durability::{
    checksum_file_snapshot_id, ChecksumProvider, ChecksumSet, DurableReservations,
    ReservationRecord, StorePaths, TEMP_SUFFIX,
};
use tracing::{info, warn};

/// A committed snapshot that passed verification
#[derive(Debug)]
pub(crate) struct RecoveredSnapshot {
    pub(crate) id: SnapshotId,
    pub(crate) path: PathBuf,
    pub(crate) checksum_path: PathBuf,
    pub(crate) metadata: SnapshotMetadata,
    pub(crate) checksums: ChecksumSet,
}

/// Outcome of recovery
#[derive(Debug, Default)]
pub(crate) struct Recovery {
    /// Kept snapshots, oldest first; the last one is the latest
    pub(crate) snapshots: Vec<RecoveredSnapshot>,
    /// Durable reservations on kept snapshots
    pub(crate) reservations: Vec<ReservationRecord>,
    /// Snapshots dropped because they failed verification
    pub(crate) corrupted: u64,
}

/// Bring the store root into a consistent state and load what survives.
pub(crate) fn recover(
    paths: &StorePaths,
    reservations: &DurableReservations,
    provider: Option<&dyn ChecksumProvider>,
    block_size: usize,
) -> Result<Recovery> {
    paths.create_directories()?;

    let purged = purge_pending(paths)?;
    if purged > 0 {
        info!(
            target: "snapstore::recovery",
            count = purged,
            "Removed leftover pending snapshots"
        );
    }

    let snapshots_dir = paths.snapshots_dir();
    let mut candidates = Vec::new();
    let mut checksum_files = Vec::new();
    for entry in fs::read_dir(&snapshots_dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if name.ends_with(TEMP_SUFFIX) {
            remove_any(&path)?;
            continue;
        }
        if entry.file_type()?.is_dir() {
            match SnapshotId::parse(&name) {
                Ok(id) => candidates.push(id),
                Err(e) => warn!(
                    target: "snapstore::recovery",
                    path = %path.display(),
                    error = %e,
                    "Ignoring unknown directory in snapshot root"
                ),
            }
            continue;
        }
        match checksum_file_snapshot_id(&path) {
            Some(id) => checksum_files.push((id, path)),
            None => warn!(
                target: "snapstore::recovery",
                path = %path.display(),
                "Ignoring unknown file in snapshot root"
            ),
        }
    }

    let directories: BTreeSet<SnapshotId> = candidates.iter().copied().collect();
    for (id, path) in checksum_files {
        if !directories.contains(&id) {
            info!(
                target: "snapstore::recovery",
                path = %path.display(),
                "Removing orphaned checksum file"
            );
            remove_file_if_exists(&path)?;
        }
    }

    let records = reservations.load()?;
    let reserved: BTreeSet<SnapshotId> = records.iter().map(|r| r.snapshot_id).collect();

    // Newest first: the first valid snapshot becomes the latest
    candidates.sort_unstable_by(|a, b| b.cmp(a));

    let mut recovery = Recovery::default();
    for id in candidates {
        let snapshot_path = paths.snapshot_dir(&id);
        let checksum_path = paths.checksum_path(&id);

        match verify(id, snapshot_path.clone(), checksum_path.clone(), provider, block_size) {
            Ok(snapshot) => {
                if recovery.snapshots.is_empty() || reserved.contains(&id) {
                    recovery.snapshots.push(snapshot);
                } else {
                    info!(
                        target: "snapstore::recovery",
                        snapshot_id = %id,
                        "Deleting superseded snapshot"
                    );
                    delete_snapshot_files(&snapshot_path, &checksum_path)?;
                }
            }
            Err(reason) => {
                warn!(
                    target: "snapstore::recovery",
                    snapshot_id = %id,
                    path = %snapshot_path.display(),
                    reason = %reason,
                    "Deleting corrupted snapshot"
                );
                delete_snapshot_files(&snapshot_path, &checksum_path)?;
                recovery.corrupted += 1;
            }
        }
    }
    recovery.snapshots.reverse();

    let kept: BTreeSet<SnapshotId> = recovery.snapshots.iter().map(|s| s.id).collect();
    for record in records {
        if kept.contains(&record.snapshot_id) {
            recovery.reservations.push(record);
        } else {
            info!(
                target: "snapstore::recovery",
                reservation_id = record.reservation_id,
                snapshot_id = %record.snapshot_id,
                "Removing reservation of missing snapshot"
            );
            reservations.remove(record.reservation_id)?;
        }
    }

    match recovery.snapshots.last() {
        Some(latest) => info!(
            target: "snapstore::recovery",
            latest = %latest.id,
            kept = recovery.snapshots.len(),
            reservations = recovery.reservations.len(),
            corrupted = recovery.corrupted,
            "Recovered snapshot store"
        ),
        None => info!(
            target: "snapstore::recovery",
            corrupted = recovery.corrupted,
            "Recovered empty snapshot store"
        ),
    }

    Ok(recovery)
}

/// Check a committed directory against its checksum file.
///
/// Returns the reason on failure. I/O errors while reading count as
/// corruption: the snapshot cannot be served either way.
fn verify(
    id: SnapshotId,
    path: PathBuf,
    checksum_path: PathBuf,
    provider: Option<&dyn ChecksumProvider>,
    block_size: usize,
) -> std::result::Result<RecoveredSnapshot, String> {
    if !checksum_path.exists() {
        return Err("missing checksum file".to_string());
    }
    let expected = ChecksumSet::read(&checksum_path).map_err(|e| e.to_string())?;
    let actual = ChecksumSet::calculate_with_provider(&path, provider, block_size)
        .map_err(|e| e.to_string())?;
    if !expected.same_checksums(&actual) {
        return Err(format!(
            "checksum mismatch: expected combined {:016x}, computed {:016x}",
            expected.combined_checksum(),
            actual.combined_checksum()
        ));
    }
    let metadata = read_metadata(&path, &id).map_err(|e| e.to_string())?;

    Ok(RecoveredSnapshot {
        id,
        path,
        checksum_path,
        metadata,
        checksums: expected,
    })
}

/// Read the metadata file of a snapshot directory, or derive metadata from
/// the id when the snapshot carries none.
pub(crate) fn read_metadata(dir: &std::path::Path, id: &SnapshotId) -> Result<SnapshotMetadata> {
    match fs::read(dir.join(METADATA_FILE_NAME)) {
        Ok(bytes) => SnapshotMetadata::decode(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SnapshotMetadata::from_id(id)),
        Err(e) => Err(SnapshotError::Io(e)),
    }
}

/// Remove a committed snapshot: checksum file first, so a crash in between
/// leaves a directory that fails verification rather than a valid-looking one.
pub(crate) fn delete_snapshot_files(
    path: &std::path::Path,
    checksum_path: &std::path::Path,
) -> Result<()> {
    remove_file_if_exists(checksum_path)?;
    remove_dir_if_exists(path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Remove everything under the pending root
pub(crate) fn purge_pending(paths: &StorePaths) -> Result<usize> {
    let pending_dir = paths.pending_dir();
    let mut purged = 0;
    for entry in fs::read_dir(&pending_dir)? {
        remove_any(&entry?.path())?;
        purged += 1;
    }
    if purged > 0 {
        sync_dir(&pending_dir)?;
    }
    Ok(purged)
}

fn remove_any(path: &std::path::Path) -> Result<()> {
    if path.is_dir() {
        remove_dir_if_exists(path)?;
    } else {
        remove_file_if_exists(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn commit(paths: &StorePaths, id: &SnapshotId, files: &[(&str, &[u8])]) {
        let dir = paths.snapshot_dir(id);
        fs::create_dir_all(&dir).unwrap();
        for (name, content) in files {
            fs::write(dir.join(name), content).unwrap();
        }
        ChecksumSet::calculate(&dir)
            .unwrap()
            .persist(&paths.checksum_path(id))
            .unwrap();
    }

    fn setup() -> (tempfile::TempDir, StorePaths, DurableReservations) {
        let dir = tempdir().unwrap();
        let paths = StorePaths::from_root(dir.path());
        paths.create_directories().unwrap();
        let reservations = DurableReservations::new(paths.clone());
        (dir, paths, reservations)
    }

    fn id(index: u64) -> SnapshotId {
        SnapshotId::new(index, 1, index as i64, 0, 0)
    }

    #[test]
    fn test_empty_root() {
        let (_dir, paths, reservations) = setup();
        let recovery = recover(&paths, &reservations, None, 16).unwrap();
        assert!(recovery.snapshots.is_empty());
        assert_eq!(recovery.corrupted, 0);
    }

    #[test]
    fn test_keeps_newest_and_deletes_older() {
        let (_dir, paths, reservations) = setup();
        commit(&paths, &id(1), &[("file1", b"one")]);
        commit(&paths, &id(2), &[("file1", b"two")]);

        let recovery = recover(&paths, &reservations, None, 16).unwrap();
        assert_eq!(recovery.snapshots.len(), 1);
        assert_eq!(recovery.snapshots[0].id, id(2));
        assert!(!paths.snapshot_dir(&id(1)).exists());
        assert!(!paths.checksum_path(&id(1)).exists());
    }

    #[test]
    fn test_corrupted_newest_falls_back_to_older() {
        let (_dir, paths, reservations) = setup();
        commit(&paths, &id(1), &[("file1", b"one")]);
        commit(&paths, &id(2), &[("file1", b"two")]);
        fs::write(paths.snapshot_dir(&id(2)).join("file1"), b"tampered").unwrap();

        let recovery = recover(&paths, &reservations, None, 16).unwrap();
        assert_eq!(recovery.corrupted, 1);
        assert_eq!(recovery.snapshots.len(), 1);
        assert_eq!(recovery.snapshots[0].id, id(1));
        assert!(!paths.snapshot_dir(&id(2)).exists());
    }

    #[test]
    fn test_missing_checksum_file_is_corruption() {
        let (_dir, paths, reservations) = setup();
        commit(&paths, &id(1), &[("file1", b"one")]);
        fs::remove_file(paths.checksum_path(&id(1))).unwrap();

        let recovery = recover(&paths, &reservations, None, 16).unwrap();
        assert!(recovery.snapshots.is_empty());
        assert_eq!(recovery.corrupted, 1);
        assert!(!paths.snapshot_dir(&id(1)).exists());
    }

    #[test]
    fn test_purges_pending_and_garbage() {
        let (_dir, paths, reservations) = setup();
        let pending = paths.pending_snapshot_dir(&id(3));
        fs::create_dir_all(&pending).unwrap();
        fs::write(pending.join("file1"), b"partial").unwrap();
        fs::write(paths.checksum_path(&id(9)), b"; orphan\n").unwrap();
        let temp = paths.snapshots_dir().join(format!("x{}", TEMP_SUFFIX));
        fs::write(&temp, b"partial").unwrap();

        recover(&paths, &reservations, None, 16).unwrap();
        assert!(!pending.exists());
        assert!(!paths.checksum_path(&id(9)).exists());
        assert!(!temp.exists());
    }

    #[test]
    fn test_durably_reserved_older_snapshot_survives() {
        let (_dir, paths, reservations) = setup();
        commit(&paths, &id(1), &[("file1", b"one")]);
        commit(&paths, &id(2), &[("file1", b"two")]);
        reservations
            .write(&ReservationRecord {
                reservation_id: 0,
                snapshot_id: id(1),
            })
            .unwrap();
        reservations
            .write(&ReservationRecord {
                reservation_id: 1,
                snapshot_id: id(7),
            })
            .unwrap();

        let recovery = recover(&paths, &reservations, None, 16).unwrap();
        let ids: Vec<SnapshotId> = recovery.snapshots.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![id(1), id(2)]);
        assert_eq!(recovery.reservations.len(), 1);
        assert_eq!(recovery.reservations[0].snapshot_id, id(1));
        // the record for the missing snapshot is gone
        assert_eq!(reservations.load().unwrap().len(), 1);
    }

    #[test]
    fn test_metadata_is_loaded() {
        let (_dir, paths, reservations) = setup();
        let metadata = SnapshotMetadata::new(5, 4, 6).bootstrap();
        let encoded = metadata.encode().unwrap();
        commit(
            &paths,
            &id(5),
            &[("file1", &b"x"[..]), (METADATA_FILE_NAME, encoded.as_slice())],
        );

        let recovery = recover(&paths, &reservations, None, 16).unwrap();
        assert_eq!(recovery.snapshots[0].metadata, metadata);
    }
}
