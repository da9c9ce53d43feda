//! Snapshot store directory structure
//!
//! A store owns a directory containing all of its state:
//!
//! ```text
//! partition-1/
//! ├── snapshots/                      # Committed snapshots
//! │   ├── 00000000000000000042-3-120-118-0/
//! │   │   ├── <state machine files>
//! │   │   └── snapshot.metadata
//! │   └── 00000000000000000042-3-120-118-0.checksum
//! ├── pending/                        # Transient and received snapshots
//! │   └── 00000000000000000043-3-125-118-0/
//! └── reservations/                   # Durable reservation markers
//!     └── 7
//! ```

use std::path::{Path, PathBuf};

use snapstore_core::SnapshotId;

/// Suffix of the checksum file that sits next to a committed snapshot
pub const CHECKSUM_SUFFIX: &str = ".checksum";

/// Suffix of files that are being written and not yet renamed into place
pub const TEMP_SUFFIX: &str = ".tmp";

/// Snapshot store directory paths
#[derive(Debug, Clone)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    /// Create paths from root directory
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        StorePaths {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the committed snapshots directory
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Get the staging directory for transient and received snapshots
    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    /// Get the durable reservations directory
    pub fn reservations_dir(&self) -> PathBuf {
        self.root.join("reservations")
    }

    /// Directory of a committed snapshot
    pub fn snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.snapshots_dir().join(id.encode())
    }

    /// Checksum file of a committed snapshot
    pub fn checksum_path(&self, id: &SnapshotId) -> PathBuf {
        self.snapshots_dir()
            .join(format!("{}{}", id.encode(), CHECKSUM_SUFFIX))
    }

    /// Staging directory of a snapshot that is not committed yet
    pub fn pending_snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.pending_dir().join(id.encode())
    }

    /// Marker file of a durable reservation
    pub fn reservation_path(&self, reservation_id: u64) -> PathBuf {
        self.reservations_dir().join(reservation_id.to_string())
    }

    /// Create the full directory structure
    pub fn create_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.snapshots_dir())?;
        std::fs::create_dir_all(self.pending_dir())?;
        std::fs::create_dir_all(self.reservations_dir())?;
        Ok(())
    }
}

/// Id of the snapshot a checksum file belongs to
pub fn checksum_file_snapshot_id(path: &Path) -> Option<SnapshotId> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(CHECKSUM_SUFFIX)?;
    SnapshotId::parse(stem).ok()
}
