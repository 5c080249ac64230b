//! End-to-end streaming scenarios
//!
//! A 10 MB file in 1 MB pieces, read the way a media player would: from the
//! start, from two offsets at once, after checking both ends or buffering
//! the start, and with a scrub into the middle.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use piecemeal_core::store::MemoryPieceStore;
use piecemeal_core::{
    InfoHash, PieceIndex, PieceStore, PiecemealConfig, Priority, Reader, Registry,
};
use piecemeal_sim::{InvariantChecker, SwarmConfig, SwarmSimulator};

const PIECE: u64 = 1_000_000;
const FILE_SIZE: u64 = 10 * PIECE;
const FILE: &str = "movie.mkv";

fn setup() -> (Arc<MemoryPieceStore>, Arc<Registry>, InfoHash) {
    let store = Arc::new(MemoryPieceStore::new());
    let info_hash = store.add_torrent("e2e", PIECE, &[(FILE, FILE_SIZE)]);
    let registry = Registry::new(store.clone(), PiecemealConfig::for_testing());
    (store, registry, info_hash)
}

fn piece(index: u32) -> PieceIndex {
    PieceIndex::new(index)
}

fn swarm(store: &Arc<MemoryPieceStore>, info_hash: InfoHash, seed: u64) -> SwarmSimulator {
    SwarmSimulator::new(store.clone(), info_hash, SwarmConfig::with_seed(seed))
        .unwrap()
        .with_invariants(InvariantChecker::standard())
}

async fn read_to_end(reader: Reader, chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunks = Box::pin(reader.into_stream(chunk));
    while let Some(bytes) = chunks.next().await {
        out.extend_from_slice(&bytes.unwrap());
    }
    out
}

#[tokio::test]
async fn test_reader_at_start_reads_first_piece_then_elevates_next() {
    let (store, registry, info_hash) = setup();
    let mut reader = registry.open_reader(info_hash, FILE, 0).unwrap();

    assert_eq!(store.priority(info_hash, piece(0)), Some(Priority::Critical));
    assert_eq!(store.deadline(info_hash, piece(0)), Some(Duration::ZERO));
    assert_eq!(
        store.deadline(info_hash, piece(1)),
        Some(Duration::from_millis(700))
    );

    store.complete_piece(info_hash, piece(0));
    let bytes = reader.read(PIECE as usize).await.unwrap();

    assert_eq!(bytes.len() as u64, PIECE);
    assert_eq!(reader.position(), PIECE);
    assert_eq!(store.priority(info_hash, piece(1)), Some(Priority::Critical));
    assert_eq!(store.deadline(info_hash, piece(1)), Some(Duration::ZERO));
}

#[tokio::test]
async fn test_two_readers_same_file_both_heads_elevated() {
    let (store, registry, info_hash) = setup();

    let _start = registry.open_reader(info_hash, FILE, 0).unwrap();
    let _middle = registry.open_reader(info_hash, FILE, 5_000_000).unwrap();

    assert_eq!(store.priority(info_hash, piece(0)), Some(Priority::Critical));
    assert_eq!(store.priority(info_hash, piece(5)), Some(Priority::Critical));
    for index in 1..=4 {
        assert_eq!(store.priority(info_hash, piece(index)), Some(Priority::Normal));
    }
}

#[tokio::test]
async fn test_boundary_wait_complete_file_issues_no_writes() {
    let (store, registry, info_hash) = setup();
    store.complete_piece(info_hash, piece(0));
    store.complete_piece(info_hash, piece(9));
    registry.get_or_create(info_hash).unwrap();
    let writes = store.write_count(info_hash);

    registry
        .wait_for_boundary_pieces(info_hash, FILE)
        .await
        .unwrap();

    assert_eq!(store.write_count(info_hash), writes);
}

#[tokio::test(start_paused = true)]
async fn test_boundary_wait_resolves_when_swarm_delivers() {
    let (store, registry, info_hash) = setup();
    let torrent = registry.get_or_create(info_hash).unwrap();
    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.wait_for_boundary_pieces(info_hash, FILE).await })
    };
    tokio::task::yield_now().await;

    assert_eq!(store.priority(info_hash, piece(9)), Some(Priority::Critical));
    assert_eq!(
        store.deadline(info_hash, piece(9)),
        Some(Duration::from_millis(700))
    );

    let swarm = swarm(&store, info_hash, 11).spawn();
    waiter.await.unwrap().unwrap();

    let bitmap = store.piece_bitmap(info_hash).unwrap();
    assert!(bitmap[0] && bitmap[9]);
    assert!(torrent.snapshot().pinned_pieces.is_empty());
    swarm.abort();
}

#[tokio::test(start_paused = true)]
async fn test_start_buffer_wait_resolves_with_prefix_and_tail() {
    let (store, registry, info_hash) = setup();
    let torrent = registry.get_or_create(info_hash).unwrap();
    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.wait_for_start_buffer(info_hash, FILE).await })
    };
    tokio::task::yield_now().await;

    // 5 MiB of 1 MB pieces is six pieces, plus the last two.
    assert_eq!(torrent.snapshot().pinned_pieces, vec![0, 1, 2, 3, 4, 5, 8, 9]);
    assert_eq!(store.priority(info_hash, piece(3)), Some(Priority::Elevated));

    let swarm = swarm(&store, info_hash, 17).spawn();
    waiter.await.unwrap().unwrap();

    let bitmap = store.piece_bitmap(info_hash).unwrap();
    assert!((0..6).chain(8..10).all(|index| bitmap[index]));
    assert!(torrent.snapshot().pinned_pieces.is_empty());
    swarm.abort();
}

#[tokio::test(start_paused = true)]
async fn test_stream_whole_file_matches_store_contents() {
    let (store, registry, info_hash) = setup();
    let expected = store.contents(info_hash).unwrap();
    let reader = registry.open_reader(info_hash, FILE, 0).unwrap();
    let swarm = swarm(&store, info_hash, 1).spawn();

    let streamed = read_to_end(reader, 256 * 1024).await;
    let report = swarm.await.unwrap().unwrap();

    assert_eq!(&streamed[..], &expected[..]);
    assert!(report.finished);
    assert_eq!(report.completion_order.len(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_two_concurrent_readers_both_complete() {
    let (store, registry, info_hash) = setup();
    let expected = store.contents(info_hash).unwrap();
    let start = registry.open_reader(info_hash, FILE, 0).unwrap();
    let middle = registry.open_reader(info_hash, FILE, 5_000_000).unwrap();
    let swarm = swarm(&store, info_hash, 5).spawn();

    let (from_start, from_middle) = tokio::join!(
        read_to_end(start, 300_000),
        read_to_end(middle, 300_000)
    );
    swarm.await.unwrap().unwrap();

    assert_eq!(&from_start[..], &expected[..]);
    assert_eq!(&from_middle[..], &expected[5_000_000..]);
}

#[tokio::test(start_paused = true)]
async fn test_scrub_forward_blackholes_skipped_region() {
    let (store, registry, info_hash) = setup();
    let expected = store.contents(info_hash).unwrap();
    let mut reader = registry.open_reader(info_hash, FILE, 0).unwrap();
    let mut swarm = swarm(&store, info_hash, 8);

    while !store.piece_bitmap(info_hash).unwrap()[0] {
        swarm.step().unwrap();
    }
    let first = reader.read(PIECE as usize).await.unwrap();
    assert_eq!(&first[..], &expected[..PIECE as usize]);

    reader.seek(7 * PIECE + 1).unwrap();
    let in_flight = store.pieces_in_flight(info_hash).unwrap();
    let bitmap = store.piece_bitmap(info_hash).unwrap();
    assert_eq!(store.priority(info_hash, piece(7)), Some(Priority::Critical));
    for index in 1..7 {
        let skipped = piece(index);
        if !in_flight.contains(&skipped) && !bitmap[skipped.as_usize()] {
            assert_eq!(
                store.priority(info_hash, skipped),
                Some(Priority::Blackholed)
            );
        }
    }

    let handle = swarm.spawn();
    let tail = read_to_end(reader, 500_000).await;
    handle.abort();

    assert_eq!(&tail[..], &expected[7 * PIECE as usize + 1..]);
}

#[tokio::test(start_paused = true)]
async fn test_two_torrents_stream_independently() {
    let store = Arc::new(MemoryPieceStore::new());
    let first = store.add_torrent("first", 100_000, &[("a.mkv", 1_000_000)]);
    let second = store.add_torrent("second", 100_000, &[("b.mkv", 700_000)]);
    let registry = Registry::new(store.clone(), PiecemealConfig::for_testing());
    let first_reader = registry.open_reader(first, "a.mkv", 0).unwrap();
    let second_reader = registry.open_reader(second, "b.mkv", 0).unwrap();
    let swarms = [
        swarm(&store, first, 21).spawn(),
        swarm(&store, second, 22).spawn(),
    ];

    let (a, b) = tokio::join!(
        read_to_end(first_reader, 64 * 1024),
        read_to_end(second_reader, 64 * 1024)
    );
    for handle in swarms {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(a.len(), 1_000_000);
    assert_eq!(b.len(), 700_000);
    assert_eq!(registry.len(), 2);
    assert_eq!(&a[..], &store.contents(first).unwrap()[..]);
}
