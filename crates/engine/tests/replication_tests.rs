//! Snapshot Replication Tests
//!
//! A committed snapshot is streamed chunk by chunk from one store into a
//! received snapshot on another. Covers:
//! - Byte-identical reconstruction from small chunks
//! - Chunk validation (id, count, checksum, name, ordering)
//! - Resuming a transfer on a fresh reader
//! - Verification of the rebuilt snapshot's combined checksum

use snapstore_core::{ChunkId, ChunkWriteError, SnapshotChunk, SnapshotError, SnapshotId};
use snapstore_engine::{
    PersistedSnapshot, ReceivedPhase, ReceivedSnapshot, SnapshotStore, SnapshotStoreConfig,
};
use std::fs;
use tempfile::TempDir;

struct Pair {
    sender: SnapshotStore,
    receiver: SnapshotStore,
    _sender_dir: TempDir,
    _receiver_dir: TempDir,
}

fn setup() -> Pair {
    let sender_dir = TempDir::new().unwrap();
    let receiver_dir = TempDir::new().unwrap();
    Pair {
        sender: SnapshotStore::open(
            sender_dir.path(),
            SnapshotStoreConfig::for_testing().with_actor_name("sender"),
        )
        .unwrap(),
        receiver: SnapshotStore::open(
            receiver_dir.path(),
            SnapshotStoreConfig::for_testing().with_actor_name("receiver"),
        )
        .unwrap(),
        _sender_dir: sender_dir,
        _receiver_dir: receiver_dir,
    }
}

fn take_snapshot(store: &SnapshotStore, index: u64, files: &[(&'static str, &'static str)]) -> PersistedSnapshot {
    let transient = store
        .new_transient_snapshot(index, 1, index as i64, 0)
        .join()
        .unwrap()
        .unwrap();
    let files = files.to_vec();
    transient
        .take(move |dir| {
            for (name, content) in files {
                fs::write(dir.join(name), content)?;
            }
            Ok(())
        })
        .join()
        .unwrap();
    transient.persist().join().unwrap()
}

fn three_files(store: &SnapshotStore) -> PersistedSnapshot {
    take_snapshot(
        store,
        1,
        &[
            ("file1", "file1 contents"),
            ("file2", "file2 has somewhat longer contents"),
            ("file3", "3"),
        ],
    )
}

fn receive(store: &SnapshotStore, source: &PersistedSnapshot) -> ReceivedSnapshot {
    store
        .new_received_snapshot(&source.id().encode())
        .join()
        .unwrap()
}

fn chunks(source: &PersistedSnapshot, max_chunk_size: Option<u64>) -> Vec<SnapshotChunk> {
    source
        .new_chunk_reader_with_max_size(max_chunk_size)
        .unwrap()
        .map(|chunk| chunk.unwrap())
        .collect()
}

fn assert_same_files(a: &PersistedSnapshot, b: &PersistedSnapshot) {
    let names: Vec<String> = a.checksums().iter().map(|(name, _)| name.to_string()).collect();
    let other: Vec<String> = b.checksums().iter().map(|(name, _)| name.to_string()).collect();
    assert_eq!(names, other);
    for name in names {
        assert_eq!(
            fs::read(a.path().join(&name)).unwrap(),
            fs::read(b.path().join(&name)).unwrap(),
            "file {} differs",
            name
        );
    }
}

fn chunk_for(id: &SnapshotId, name: &str, content: &[u8], total_count: u32) -> SnapshotChunk {
    SnapshotChunk {
        snapshot_id: id.encode(),
        chunk_name: name.to_string(),
        total_count,
        content: content.to_vec(),
        checksum: crc32c::crc32c(content),
        snapshot_checksum: 1,
        file_block_position: 0,
        total_file_size: content.len() as u64,
    }
}

// ============================================================================
// Reconstruction
// ============================================================================

#[test]
fn test_replicate_whole_files() {
    let pair = setup();
    let source = three_files(&pair.sender);

    let received = receive(&pair.receiver, &source);
    for chunk in chunks(&source, None) {
        received.apply(chunk).join().unwrap();
    }
    assert_eq!(received.phase(), ReceivedPhase::Complete);
    let persisted = received.persist().join().unwrap();

    assert_eq!(persisted.id(), source.id());
    assert_eq!(persisted.checksum(), source.checksum());
    assert_eq!(persisted.metadata(), source.metadata());
    assert_same_files(&source, &persisted);
    assert_eq!(pair.receiver.latest_snapshot().unwrap(), persisted);
}

#[test]
fn test_replicate_two_byte_chunks() {
    let pair = setup();
    let source = three_files(&pair.sender);

    let chunks = chunks(&source, Some(2));
    assert!(chunks.len() > 20);

    let received = receive(&pair.receiver, &source);
    assert!(!received.path().exists(), "nothing touches disk before the first chunk");
    for chunk in chunks {
        received.apply(chunk).join().unwrap();
    }
    let persisted = received.persist().join().unwrap();

    assert_same_files(&source, &persisted);
    assert_eq!(persisted.checksum(), source.checksum());

    let counters = pair.receiver.metrics();
    assert_eq!(counters.snapshots_received, 1);
    assert!(counters.chunks_applied > 20);
}

#[test]
fn test_store_chunk_size_applies_to_readers() {
    let pair = setup();
    let content = "x".repeat(200);
    let content: &'static str = Box::leak(content.into_boxed_str());
    let source = take_snapshot(&pair.sender, 1, &[("big", content)]);

    // for_testing() caps chunks at 64 bytes
    let reader = source.new_chunk_reader().unwrap();
    let sizes: Vec<usize> = reader
        .filter(|c| c.as_ref().unwrap().chunk_name == "big")
        .map(|c| c.unwrap().content.len())
        .collect();
    assert_eq!(sizes, vec![64, 64, 64, 8]);
}

#[test]
fn test_resume_transfer_on_new_reader() {
    let pair = setup();
    let source = three_files(&pair.sender);
    let received = receive(&pair.receiver, &source);

    let mut reader = source.new_chunk_reader_with_max_size(Some(4)).unwrap();
    for _ in 0..3 {
        received.apply(reader.next_chunk().unwrap()).join().unwrap();
    }
    let token = reader.next_id().unwrap().to_bytes();
    drop(reader);

    let mut resumed = source.new_chunk_reader_with_max_size(Some(4)).unwrap();
    resumed.seek(&ChunkId::from_bytes(&token).unwrap());
    assert!(received.is_expected_chunk(&resumed.next_id().unwrap()));
    for chunk in resumed {
        received.apply(chunk.unwrap()).join().unwrap();
    }

    let persisted = received.persist().join().unwrap();
    assert_same_files(&source, &persisted);
}

#[test]
fn test_seek_to_file_yields_remaining_files() {
    let pair = setup();
    let source = three_files(&pair.sender);

    let mut reader = source.new_chunk_reader_with_max_size(None).unwrap();
    reader.seek(&ChunkId::from("file2"));
    let names: Vec<String> = reader.map(|c| c.unwrap().chunk_name).collect();
    // the metadata file sorts after the data files
    assert_eq!(names, vec!["file2", "file3", "snapshot.metadata"]);
}

#[test]
fn test_duplicate_chunk_is_skipped() {
    let pair = setup();
    let source = three_files(&pair.sender);
    let received = receive(&pair.receiver, &source);

    let chunks = chunks(&source, Some(4));
    let total = chunks.len() as u64;
    received.apply(chunks[0].clone()).join().unwrap();
    received.apply(chunks[1].clone()).join().unwrap();
    assert!(received.contains_chunk(&chunks[0].id()));
    // resent after a lost acknowledgement
    received.apply(chunks[0].clone()).join().unwrap();
    for chunk in &chunks[2..] {
        received.apply(chunk.clone()).join().unwrap();
    }

    let persisted = received.persist().join().unwrap();
    assert_same_files(&source, &persisted);
    assert_eq!(pair.receiver.metrics().chunks_applied, total);
}

#[test]
fn test_receiving_already_committed_snapshot_returns_existing() {
    let pair = setup();
    let source = three_files(&pair.sender);

    let first = receive(&pair.receiver, &source);
    for chunk in chunks(&source, None) {
        first.apply(chunk).join().unwrap();
    }
    let committed = first.persist().join().unwrap();

    let second = receive(&pair.receiver, &source);
    for chunk in chunks(&source, None) {
        second.apply(chunk).join().unwrap();
    }
    assert_eq!(second.persist().join().unwrap(), committed);
    assert!(pair.receiver.snapshot(1).is_some());
}

// ============================================================================
// Chunk validation
// ============================================================================

#[test]
fn test_chunk_checksum_mismatch_rejected() {
    let pair = setup();
    let id = SnapshotId::new(1, 0, 1, 0, 0);
    let received = pair.receiver.new_received_snapshot(&id.encode()).join().unwrap();

    let mut chunk = chunk_for(&id, "file1", b"file1 contents", 1);
    chunk.checksum = 0xCAFE;

    let err = received.apply(chunk).join().unwrap_err();
    match err {
        SnapshotError::Write(ChunkWriteError::ChecksumMismatch {
            expected, actual, ..
        }) => {
            assert_eq!(expected, 0xCAFE);
            assert_eq!(actual, crc32c::crc32c(b"file1 contents"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!received.path().exists());
    assert_eq!(received.phase(), ReceivedPhase::Empty);
}

#[test]
fn test_chunk_for_other_snapshot_rejected() {
    let pair = setup();
    let id = SnapshotId::new(1, 0, 1, 0, 0);
    let other = SnapshotId::new(2, 0, 2, 0, 0);
    let received = pair.receiver.new_received_snapshot(&id.encode()).join().unwrap();

    let err = received
        .apply(chunk_for(&other, "file1", b"a", 1))
        .join()
        .unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::Write(ChunkWriteError::SnapshotIdMismatch { .. })
    ));
}

#[test]
fn test_total_count_mismatch_keeps_earlier_chunks() {
    let pair = setup();
    let id = SnapshotId::new(1, 0, 1, 0, 0);
    let received = pair.receiver.new_received_snapshot(&id.encode()).join().unwrap();

    received.apply(chunk_for(&id, "file1", b"a", 2)).join().unwrap();
    let err = received
        .apply(chunk_for(&id, "file2", b"b", 3))
        .join()
        .unwrap_err();

    assert!(matches!(
        err,
        SnapshotError::Write(ChunkWriteError::TotalCountMismatch {
            expected: 2,
            actual: 3,
            ..
        })
    ));
    assert_eq!(fs::read(received.path().join("file1")).unwrap(), b"a");
    assert!(!received.path().join("file2").exists());
    assert_eq!(received.phase(), ReceivedPhase::Receiving);

    // the right chunk still goes through
    received.apply(chunk_for(&id, "file2", b"b", 2)).join().unwrap();
    assert_eq!(received.phase(), ReceivedPhase::Complete);
}

#[test]
fn test_snapshot_checksum_change_rejected() {
    let pair = setup();
    let id = SnapshotId::new(1, 0, 1, 0, 0);
    let received = pair.receiver.new_received_snapshot(&id.encode()).join().unwrap();

    received.apply(chunk_for(&id, "file1", b"a", 2)).join().unwrap();
    let mut chunk = chunk_for(&id, "file2", b"b", 2);
    chunk.snapshot_checksum = 2;

    let err = received.apply(chunk).join().unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::Write(ChunkWriteError::SnapshotChecksumMismatch { .. })
    ));
}

#[test]
fn test_chunk_name_escaping_directory_rejected() {
    let pair = setup();
    let id = SnapshotId::new(1, 0, 1, 0, 0);
    let received = pair.receiver.new_received_snapshot(&id.encode()).join().unwrap();

    let err = received
        .apply(chunk_for(&id, "../escape", b"a", 1))
        .join()
        .unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::Write(ChunkWriteError::InvalidChunkName(_))
    ));
}

#[test]
fn test_gap_in_file_rejected() {
    let pair = setup();
    let source = three_files(&pair.sender);
    let received = receive(&pair.receiver, &source);

    let chunks = chunks(&source, Some(4));
    assert_eq!(chunks[1].chunk_name, chunks[0].chunk_name);
    assert!(!received.is_expected_chunk(&chunks[1].id()));

    let err = received.apply(chunks[1].clone()).join().unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::Write(ChunkWriteError::OutOfOrder {
            position: 4,
            written: 0,
            ..
        })
    ));
    // nothing was accepted, so nothing was staged
    assert!(!received.path().exists());
    assert_eq!(received.phase(), ReceivedPhase::Empty);

    // the transfer can still start from the first chunk
    received.apply(chunks[0].clone()).join().unwrap();
    assert!(received.path().join(&chunks[0].chunk_name).exists());
}

// ============================================================================
// Persist
// ============================================================================

#[test]
fn test_persist_incomplete_snapshot_fails() {
    let pair = setup();
    let source = three_files(&pair.sender);
    let received = receive(&pair.receiver, &source);

    let err = received.persist().join().unwrap_err();
    assert!(matches!(err, SnapshotError::IllegalState(_)));

    let chunks = chunks(&source, None);
    received.apply(chunks[0].clone()).join().unwrap();
    let err = received.persist().join().unwrap_err();
    assert!(matches!(err, SnapshotError::IllegalState(_)));

    // still usable
    for chunk in &chunks[1..] {
        received.apply(chunk.clone()).join().unwrap();
    }
    received.persist().join().unwrap();
}

#[test]
fn test_combined_checksum_mismatch_aborts() {
    let pair = setup();
    let source = three_files(&pair.sender);
    let received = receive(&pair.receiver, &source);

    for mut chunk in chunks(&source, None) {
        chunk.snapshot_checksum = source.checksum() ^ 1;
        received.apply(chunk).join().unwrap();
    }

    let err = received.persist().join().unwrap_err();
    assert!(matches!(err, SnapshotError::Corruption(_)));
    assert_eq!(received.phase(), ReceivedPhase::Aborted);
    assert!(!received.path().exists());
    assert!(pair.receiver.latest_snapshot().is_none());
}

#[test]
fn test_received_persist_is_idempotent() {
    let pair = setup();
    let source = three_files(&pair.sender);
    let received = receive(&pair.receiver, &source);
    for chunk in chunks(&source, Some(2)) {
        received.apply(chunk).join().unwrap();
    }

    let first = received.persist().join().unwrap();
    let second = received.persist().join().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.checksum(), second.checksum());
}

#[test]
fn test_abort_received_snapshot() {
    let pair = setup();
    let source = three_files(&pair.sender);
    let received = receive(&pair.receiver, &source);
    let chunks = chunks(&source, None);
    received.apply(chunks[0].clone()).join().unwrap();

    received.abort().join().unwrap();
    assert_eq!(received.phase(), ReceivedPhase::Aborted);
    assert!(!received.path().exists());
    assert!(received.apply(chunks[1].clone()).join().is_err());

    // the same snapshot can be received again from scratch
    let again = receive(&pair.receiver, &source);
    for chunk in chunks {
        again.apply(chunk).join().unwrap();
    }
    again.persist().join().unwrap();
}
