//! Multi-part filesets streamed through the registry.

use std::sync::Arc;

use futures::StreamExt;
use piecemeal_core::store::MemoryPieceStore;
use piecemeal_core::{InfoHash, PieceIndex, PieceStore, PiecemealConfig, Priority, Registry};
use piecemeal_sim::{InvariantChecker, SwarmConfig, SwarmSimulator};

const PARTS: [&str; 3] = ["cd1.rar", "cd1.r00", "cd1.r01"];

fn setup() -> (Arc<MemoryPieceStore>, Arc<Registry>, InfoHash) {
    let store = Arc::new(MemoryPieceStore::new());
    let info_hash = store.add_torrent(
        "fileset",
        100,
        &[
            ("cd1.rar", 300),
            ("cd1.r00", 300),
            ("cd1.r01", 300),
            ("extra.nfo", 100),
        ],
    );
    let registry = Registry::new(store.clone(), PiecemealConfig::for_testing());
    (store, registry, info_hash)
}

#[tokio::test]
async fn test_register_fileset_first_part_leads() {
    let (store, registry, info_hash) = setup();

    let key = registry.register_fileset(info_hash, &PARTS).unwrap();

    assert_eq!(
        store.file_priorities(info_hash),
        vec![
            Priority::Critical,
            Priority::Background,
            Priority::Background,
            Priority::Blackholed
        ]
    );
    assert_eq!(
        store.priority(info_hash, PieceIndex::new(0)),
        Some(Priority::Critical)
    );
    assert_eq!(registry.register_fileset(info_hash, &PARTS).unwrap(), key);
    assert_eq!(registry.get(info_hash).unwrap().fileset_count(), 1);
}

#[tokio::test]
async fn test_register_fileset_unknown_part_rejected() {
    let (_store, registry, info_hash) = setup();

    let result = registry.register_fileset(info_hash, &["cd1.rar", "cd1.r99"]);

    assert!(result.is_err());
    assert_eq!(registry.get(info_hash).unwrap().fileset_count(), 0);
}

#[tokio::test]
async fn test_reading_second_part_drops_first_part() {
    let (store, registry, info_hash) = setup();
    registry.register_fileset(info_hash, &PARTS).unwrap();

    let _reader = registry.open_reader(info_hash, "cd1.r00", 0).unwrap();

    assert_eq!(
        store.file_priorities(info_hash),
        vec![
            Priority::Blackholed,
            Priority::Critical,
            Priority::Background,
            Priority::Blackholed
        ]
    );
    assert_eq!(
        store.priority(info_hash, PieceIndex::new(3)),
        Some(Priority::Critical)
    );
}

#[tokio::test(start_paused = true)]
async fn test_stream_fileset_parts_in_order_skips_extras() {
    let (store, registry, info_hash) = setup();
    let contents = store.contents(info_hash).unwrap();
    registry.register_fileset(info_hash, &PARTS).unwrap();
    let swarm = SwarmSimulator::new(store.clone(), info_hash, SwarmConfig::with_seed(3))
        .unwrap()
        .spawn();

    let mut streamed = Vec::new();
    for part in PARTS {
        let reader = registry.open_reader(info_hash, part, 0).unwrap();
        let mut chunks = Box::pin(reader.into_stream(64));
        while let Some(chunk) = chunks.next().await {
            streamed.extend_from_slice(&chunk.unwrap());
        }
    }
    swarm.abort();

    assert_eq!(&streamed[..], &contents[..900]);
    let bitmap = store.piece_bitmap(info_hash).unwrap();
    assert!(!bitmap[9], "extra.nfo is outside the fileset");
    assert!(
        InvariantChecker::standard()
            .check(&store, info_hash, 0)
            .is_ok()
    );
}
