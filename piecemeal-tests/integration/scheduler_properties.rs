//! Scheduling properties observed through the registry.

use std::sync::Arc;

use piecemeal_core::store::MemoryPieceStore;
use piecemeal_core::{InfoHash, PieceIndex, PiecemealConfig, Priority, Registry};
use piecemeal_sim::InvariantChecker;
use proptest::prelude::*;

const PIECE: u64 = 1_000;

fn setup(pieces: u64) -> (Arc<MemoryPieceStore>, Arc<Registry>, InfoHash) {
    let store = Arc::new(MemoryPieceStore::new());
    let info_hash = store.add_torrent("properties", PIECE, &[("movie.mkv", pieces * PIECE)]);
    let registry = Registry::new(store.clone(), PiecemealConfig::for_testing());
    (store, registry, info_hash)
}

fn piece(index: u32) -> PieceIndex {
    PieceIndex::new(index)
}

#[tokio::test]
async fn test_every_reader_head_critical_after_open() {
    let (store, registry, info_hash) = setup(20);
    store.complete_piece(info_hash, piece(12));

    let _readers: Vec<_> = [0, 7_500, 12_100, 19_999]
        .into_iter()
        .map(|offset| registry.open_reader(info_hash, 0usize, offset).unwrap())
        .collect();

    for head in [0, 7, 19] {
        assert_eq!(store.priority(info_hash, piece(head)), Some(Priority::Critical));
    }
    // Already downloaded, so left as it was.
    assert_eq!(store.priority(info_hash, piece(12)), Some(Priority::Normal));
    assert_eq!(store.priority(info_hash, piece(13)), Some(Priority::Normal));
}

#[tokio::test]
async fn test_in_flight_pieces_behind_head_stay_nonzero() {
    let (store, registry, info_hash) = setup(10);
    store.set_in_flight(info_hash, piece(1), true);
    store.set_in_flight(info_hash, piece(3), true);

    let _reader = registry.open_reader(info_hash, 0usize, 6 * PIECE).unwrap();

    assert_eq!(store.priority(info_hash, piece(0)), Some(Priority::Blackholed));
    assert_ne!(store.priority(info_hash, piece(1)), Some(Priority::Blackholed));
    assert_eq!(store.priority(info_hash, piece(2)), Some(Priority::Blackholed));
    assert_ne!(store.priority(info_hash, piece(3)), Some(Priority::Blackholed));
    assert!(
        InvariantChecker::standard()
            .check(&store, info_hash, 0)
            .is_ok()
    );
}

#[tokio::test]
async fn test_cycle_twice_no_state_change_no_writes() {
    let (store, registry, info_hash) = setup(10);
    let _first = registry.open_reader(info_hash, 0usize, 0).unwrap();
    let _second = registry.open_reader(info_hash, 0usize, 5 * PIECE).unwrap();
    let torrent = registry.get(info_hash).unwrap();
    let before: Vec<_> = (0..10).map(|i| store.priority(info_hash, piece(i))).collect();
    let writes = store.write_count(info_hash);

    torrent.cycle();
    torrent.cycle();

    let after: Vec<_> = (0..10).map(|i| store.priority(info_hash, piece(i))).collect();
    assert_eq!(before, after);
    assert_eq!(store.write_count(info_hash), writes);
}

#[tokio::test]
async fn test_reader_advance_window_covers_new_head() {
    let (store, registry, info_hash) = setup(12);
    let mut reader = registry.open_reader(info_hash, 0usize, 0).unwrap();
    store.set_in_flight(info_hash, piece(1), true);

    reader.seek(4 * PIECE + 10).unwrap();

    assert_eq!(store.priority(info_hash, piece(4)), Some(Priority::Critical));
    for index in 5..=6 {
        assert_eq!(store.priority(info_hash, piece(index)), Some(Priority::Critical));
    }
    for index in 7..=8 {
        assert_eq!(store.priority(info_hash, piece(index)), Some(Priority::Elevated));
    }
    for index in [0, 2, 3] {
        assert_eq!(
            store.priority(info_hash, piece(index)),
            Some(Priority::Blackholed)
        );
    }
    assert_ne!(store.priority(info_hash, piece(1)), Some(Priority::Blackholed));
}

#[tokio::test]
async fn test_window_pieces_past_range_stay_blackholed() {
    let (store, registry, info_hash) = setup(10);

    let _reader = registry.open_reader(info_hash, 0usize, 0).unwrap();

    for index in 5..10 {
        assert_eq!(
            store.priority(info_hash, piece(index)),
            Some(Priority::Blackholed)
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_open_readers_keep_invariants(
        offsets in proptest::collection::vec(0u64..30 * PIECE, 1..4),
        in_flight in proptest::collection::vec(0u32..30, 0..6),
        complete in proptest::collection::vec(0u32..30, 0..10),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (store, registry, info_hash) = setup(30);
            for index in &complete {
                store.complete_piece_silently(info_hash, piece(*index));
            }
            for index in &in_flight {
                store.set_in_flight(info_hash, piece(*index), true);
            }

            let _readers: Vec<_> = offsets
                .iter()
                .map(|offset| registry.open_reader(info_hash, 0usize, *offset).unwrap())
                .collect();
            let bitmap: Vec<bool> = (0..30)
                .map(|i| complete.contains(&i))
                .collect();

            for offset in &offsets {
                let head = (offset / PIECE) as u32;
                if !bitmap[head as usize] {
                    prop_assert_eq!(
                        store.priority(info_hash, piece(head)),
                        Some(Priority::Critical)
                    );
                }
            }
            prop_assert!(InvariantChecker::standard().check(&store, info_hash, 0).is_ok());

            let writes = store.write_count(info_hash);
            registry.get(info_hash).unwrap().cycle();
            prop_assert_eq!(store.write_count(info_hash), writes);
            Ok(())
        })?;
    }
}
