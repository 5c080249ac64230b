//! In-memory store behavior the scheduler tests rely on.

use super::memory::MemoryPieceStore;
use super::{PieceStore, StoreError, StoreEvent};
use crate::torrent::{InfoHash, PieceIndex, Priority};

#[tokio::test]
async fn test_pieces_readable_only_after_completion() {
    let store = MemoryPieceStore::new();
    let info_hash = store.add_torrent("movie", 10, &[("movie.mkv", 25)]);
    let mut events = store.subscribe();

    let result = store.read_piece(info_hash, PieceIndex::new(2)).await;
    assert!(matches!(result, Err(StoreError::PieceUnavailable { .. })));

    store.complete_piece(info_hash, PieceIndex::new(2));
    let data = store.read_piece(info_hash, PieceIndex::new(2)).await.unwrap();
    assert_eq!(data.len(), 5);
    assert_eq!(data[0], 20);
    assert_eq!(
        events.recv().await.unwrap(),
        StoreEvent::PieceCompleted {
            info_hash,
            piece: PieceIndex::new(2)
        }
    );
}

#[test]
fn test_unknown_torrent_is_reported() {
    let store = MemoryPieceStore::new();
    let unknown = InfoHash::new([99u8; 20]);
    assert!(matches!(
        store.layout(unknown),
        Err(StoreError::UnknownTorrent { .. })
    ));
}

#[test]
fn test_wanted_pieces_respects_skipped_files_and_urgency() {
    let store = MemoryPieceStore::new();
    let info_hash = store.add_torrent("pair", 10, &[("a", 20), ("b", 20)]);

    store
        .set_file_priorities(info_hash, &[Priority::Blackholed, Priority::Normal])
        .unwrap();
    store
        .set_piece_priority(info_hash, PieceIndex::new(3), Priority::Critical)
        .unwrap();
    store
        .set_piece_priority(info_hash, PieceIndex::new(2), Priority::Blackholed)
        .unwrap();

    let wanted = store.wanted_pieces(info_hash);
    assert_eq!(wanted, vec![(PieceIndex::new(3), Priority::Critical)]);
    assert_eq!(store.write_count(info_hash), 3);
}

#[test]
fn test_fail_writes_leaves_state_untouched() {
    let store = MemoryPieceStore::new();
    let info_hash = store.add_torrent("flaky", 10, &[("a", 10)]);
    store.fail_writes(true);

    let result = store.set_piece_priority(info_hash, PieceIndex::new(0), Priority::Critical);
    assert!(matches!(result, Err(StoreError::Backend { .. })));
    assert_eq!(
        store.priority(info_hash, PieceIndex::new(0)),
        Some(Priority::Normal)
    );
}
