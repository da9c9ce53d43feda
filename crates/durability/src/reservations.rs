//! Durable reservation records
//!
//! A durable reservation is a marker file named after the reservation id,
//! containing the encoded id of the reserved snapshot. Records are reloaded
//! when the store reopens so that reservations taken before a restart keep
//! their snapshot alive until released.

use std::fs;
use std::path::PathBuf;

use snapstore_core::{Result, SnapshotId};
use tracing::warn;

use crate::files::{remove_file_if_exists, sync_dir, write_atomically};
use crate::paths::{StorePaths, TEMP_SUFFIX};

/// One durable reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationRecord {
    /// Id of the reservation
    pub reservation_id: u64,
    /// Snapshot kept alive by the reservation
    pub snapshot_id: SnapshotId,
}

/// Reservation marker files under `<root>/reservations`
#[derive(Debug, Clone)]
pub struct DurableReservations {
    paths: StorePaths,
}

impl DurableReservations {
    /// Records stored under the given store layout
    pub fn new(paths: StorePaths) -> Self {
        DurableReservations { paths }
    }

    fn record_path(&self, reservation_id: u64) -> PathBuf {
        self.paths.reservation_path(reservation_id)
    }

    /// Durably write a record
    pub fn write(&self, record: &ReservationRecord) -> Result<()> {
        write_atomically(
            &self.record_path(record.reservation_id),
            record.snapshot_id.encode().as_bytes(),
        )?;
        Ok(())
    }

    /// Durably remove a record. Removing a missing record is not an error.
    pub fn remove(&self, reservation_id: u64) -> Result<()> {
        if remove_file_if_exists(&self.record_path(reservation_id))? {
            sync_dir(&self.paths.reservations_dir())?;
        }
        Ok(())
    }

    /// Load every record.
    ///
    /// Leftover temp files and records that cannot be parsed are removed.
    pub fn load(&self) -> Result<Vec<ReservationRecord>> {
        let dir = self.paths.reservations_dir();
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();

            if name.ends_with(TEMP_SUFFIX) {
                remove_file_if_exists(&path)?;
                continue;
            }

            // u64::MAX is never allocated: the next id would overflow
            let reservation_id = match name.parse::<u64>() {
                Ok(id) if id < u64::MAX => id,
                _ => {
                    warn!(path = %path.display(), "Ignoring unknown file in reservations directory");
                    continue;
                }
            };

            let content = fs::read_to_string(&path)?;
            match SnapshotId::parse(content.trim()) {
                Ok(snapshot_id) => records.push(ReservationRecord {
                    reservation_id,
                    snapshot_id,
                }),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Removing unreadable reservation record"
                    );
                    remove_file_if_exists(&path)?;
                }
            }
        }
        records.sort_by_key(|record| record.reservation_id);
        Ok(records)
    }
}
