//! Snapshot metadata record
//!
//! Stored as a small JSON document inside every snapshot directory. The file
//! is written after the state machine's own files and is covered by the
//! snapshot's checksum set like any other file.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SnapshotError};
use crate::id::SnapshotId;

/// File name of the metadata record inside a snapshot directory
pub const METADATA_FILE_NAME: &str = "snapshot.metadata";

/// Current metadata format version
pub const METADATA_VERSION: u32 = 1;

/// Position value meaning "no position"
pub const NO_POSITION: i64 = -1;

/// Positions captured alongside a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Format version of this record
    pub version: u32,
    /// Last position processed by the state machine
    pub processed_position: i64,
    /// Last position acknowledged by exporters
    pub exported_position: i64,
    /// Highest position of a follow-up event written by processing
    pub last_followup_event_position: i64,
    /// Snapshot was created to bootstrap a new partition.
    ///
    /// Absent in records written before the flag existed.
    #[serde(default)]
    pub is_bootstrap: bool,
}

impl SnapshotMetadata {
    /// Metadata for a regular snapshot
    pub fn new(
        processed_position: i64,
        exported_position: i64,
        last_followup_event_position: i64,
    ) -> Self {
        SnapshotMetadata {
            version: METADATA_VERSION,
            processed_position,
            exported_position,
            last_followup_event_position,
            is_bootstrap: false,
        }
    }

    /// Metadata derived from an id alone, for snapshots received without a
    /// metadata file.
    pub fn from_id(id: &SnapshotId) -> Self {
        SnapshotMetadata::new(
            id.processed_position(),
            id.exported_position(),
            id.processed_position(),
        )
    }

    /// Mark as a bootstrap snapshot
    pub fn bootstrap(mut self) -> Self {
        self.is_bootstrap = true;
        self
    }

    /// Serialize to the on-disk representation
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SnapshotError::Metadata(e.to_string()))
    }

    /// Deserialize from the on-disk representation
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SnapshotError::Metadata(e.to_string()))
    }
}
