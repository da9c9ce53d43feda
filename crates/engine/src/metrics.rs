//! Snapshot store counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of the store's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotCounters {
    /// Snapshots committed, locally taken or received
    pub snapshots_persisted: u64,
    /// Of those, snapshots that arrived through replication
    pub snapshots_received: u64,
    /// Chunks written to received snapshots, duplicates excluded
    pub chunks_applied: u64,
    /// Content bytes written from applied chunks
    pub bytes_received: u64,
    /// Committed snapshots removed from disk
    pub snapshots_deleted: u64,
    /// Snapshots dropped at startup because they failed verification
    pub corrupted_snapshots: u64,
    /// Total nanoseconds spent committing snapshots
    pub persist_nanos: u64,
    /// Duration of the most recent commit, in nanoseconds
    pub last_persist_nanos: u64,
    /// Total size in bytes of the most recently committed snapshot
    pub last_snapshot_bytes: u64,
    /// Staging snapshots currently open
    pub pending_snapshots: u64,
}

/// Live counters updated by the store's actor
#[derive(Debug, Default)]
pub(crate) struct SnapshotMetrics {
    snapshots_persisted: AtomicU64,
    snapshots_received: AtomicU64,
    chunks_applied: AtomicU64,
    bytes_received: AtomicU64,
    snapshots_deleted: AtomicU64,
    corrupted_snapshots: AtomicU64,
    persist_nanos: AtomicU64,
    last_persist_nanos: AtomicU64,
    last_snapshot_bytes: AtomicU64,
    pending_snapshots: AtomicU64,
}

impl SnapshotMetrics {
    pub(crate) fn record_persist(&self, elapsed: Duration, size: u64, received: bool) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.snapshots_persisted.fetch_add(1, Ordering::Relaxed);
        if received {
            self.snapshots_received.fetch_add(1, Ordering::Relaxed);
        }
        self.persist_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.last_persist_nanos.store(nanos, Ordering::Relaxed);
        self.last_snapshot_bytes.store(size, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk(&self, bytes: usize) {
        self.chunks_applied.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_deleted(&self) {
        self.snapshots_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_corrupted(&self, count: u64) {
        self.corrupted_snapshots.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn set_pending(&self, count: usize) {
        self.pending_snapshots
            .store(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn counters(&self) -> SnapshotCounters {
        SnapshotCounters {
            snapshots_persisted: self.snapshots_persisted.load(Ordering::Relaxed),
            snapshots_received: self.snapshots_received.load(Ordering::Relaxed),
            chunks_applied: self.chunks_applied.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            snapshots_deleted: self.snapshots_deleted.load(Ordering::Relaxed),
            corrupted_snapshots: self.corrupted_snapshots.load(Ordering::Relaxed),
            persist_nanos: self.persist_nanos.load(Ordering::Relaxed),
            last_persist_nanos: self.last_persist_nanos.load(Ordering::Relaxed),
            last_snapshot_bytes: self.last_snapshot_bytes.load(Ordering::Relaxed),
            pending_snapshots: self.pending_snapshots.load(Ordering::Relaxed),
        }
    }
}
