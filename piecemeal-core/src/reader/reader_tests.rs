//! Blocking reads, cancellation and streaming against the in-memory store.

use std::time::Duration;

use futures::StreamExt;
use tokio_test::task;
use tokio_test::{assert_pending, assert_ready};

use super::*;
use crate::config::PiecemealConfig;
use crate::store::{MemoryPieceStore, PieceStore};
use crate::torrent::{InfoHash, Priority, TorrentDescriptor};

struct Fixture {
    store: Arc<MemoryPieceStore>,
    torrent: Arc<Torrent>,
    config: PiecemealConfig,
}

impl Fixture {
    fn new(files: &[(&str, u64)]) -> Self {
        let store = Arc::new(MemoryPieceStore::new());
        let info_hash = store.add_torrent("reader-test", 100, files);
        let layout = store.layout(info_hash).unwrap();
        let descriptor = TorrentDescriptor::from_layout(info_hash, &layout).unwrap();
        let config = PiecemealConfig::for_testing();
        let torrent = Torrent::new(descriptor, store.clone(), config.scheduler.clone());
        Self {
            store,
            torrent,
            config,
        }
    }

    fn info_hash(&self) -> InfoHash {
        self.torrent.info_hash()
    }

    fn open(&self, from_byte: u64) -> Reader {
        Reader::open(
            self.torrent.clone(),
            0,
            from_byte,
            u64::MAX,
            self.config.reader.clone(),
        )
        .unwrap()
    }

    fn complete(&self, piece: u32) {
        self.store.complete_piece(self.info_hash(), PieceIndex::new(piece));
        self.torrent.on_piece_complete(PieceIndex::new(piece));
    }

    fn expected(&self, range: std::ops::Range<usize>) -> Bytes {
        self.store.contents(self.info_hash()).unwrap().slice(range)
    }
}

#[tokio::test]
async fn test_read_waits_for_piece_completion() {
    let fixture = Fixture::new(&[("movie.mkv", 1000)]);
    let mut reader = fixture.open(0);

    let mut read = task::spawn(reader.read(4096));
    assert_pending!(read.poll());
    assert_eq!(fixture.torrent.waiters().len(), 1);

    fixture.complete(0);
    assert!(read.is_woken());
    let data = assert_ready!(read.poll()).unwrap();
    drop(read);

    assert_eq!(data, fixture.expected(0..100));
    assert_eq!(reader.position(), 100);
    assert!(fixture.torrent.waiters().is_empty());
    assert_eq!(
        fixture.store.priority(fixture.info_hash(), PieceIndex::new(1)),
        Some(Priority::Critical)
    );
}

#[tokio::test]
async fn test_reads_stop_at_piece_and_range_end() {
    let fixture = Fixture::new(&[("movie.mkv", 1000)]);
    for piece in 0..10 {
        fixture.complete(piece);
    }
    let mut reader = Reader::open(
        fixture.torrent.clone(),
        0,
        50,
        180,
        fixture.config.reader.clone(),
    )
    .unwrap();

    assert_eq!(reader.read(1000).await.unwrap(), fixture.expected(50..100));
    assert_eq!(reader.read(30).await.unwrap(), fixture.expected(100..130));
    assert_eq!(reader.read(1000).await.unwrap(), fixture.expected(130..180));
    assert!(reader.read(1000).await.unwrap().is_empty());
    assert_eq!(reader.remaining(), 0);
}

#[tokio::test]
async fn test_close_handle_fails_pending_read() {
    let fixture = Fixture::new(&[("movie.mkv", 1000)]);
    let mut reader = fixture.open(0);
    let handle = reader.close_handle();

    let mut read = task::spawn(reader.read(100));
    assert_pending!(read.poll());

    handle.close();
    assert!(read.is_woken());
    assert!(matches!(
        assert_ready!(read.poll()),
        Err(StreamError::StreamClosed)
    ));
    drop(read);

    assert!(fixture.torrent.waiters().is_empty());
    assert!(matches!(reader.seek(0), Err(StreamError::StreamClosed)));
}

#[tokio::test]
async fn test_closing_one_reader_leaves_other_waiting() {
    let fixture = Fixture::new(&[("movie.mkv", 1000)]);
    let mut leaving = fixture.open(0);
    let mut staying = fixture.open(10);
    let handle = leaving.close_handle();

    let mut leaving_read = task::spawn(leaving.read(100));
    let mut staying_read = task::spawn(staying.read(100));
    assert_pending!(leaving_read.poll());
    assert_pending!(staying_read.poll());
    assert_eq!(fixture.torrent.waiters().len(), 2);

    handle.close();
    assert!(assert_ready!(leaving_read.poll()).is_err());
    drop(leaving_read);
    assert_pending!(staying_read.poll());
    assert_eq!(fixture.torrent.waiters().len(), 1);

    fixture.complete(0);
    let data = assert_ready!(staying_read.poll()).unwrap();
    assert_eq!(data, fixture.expected(10..100));
}

#[tokio::test]
async fn test_shutdown_fails_pending_read() {
    let fixture = Fixture::new(&[("movie.mkv", 1000)]);
    let mut reader = fixture.open(0);

    let mut read = task::spawn(reader.read(100));
    assert_pending!(read.poll());

    fixture.torrent.shutdown();
    assert!(matches!(
        assert_ready!(read.poll()),
        Err(StreamError::StreamClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_stall_timeout_after_retry_limit() {
    let fixture = Fixture::new(&[("movie.mkv", 1000)]);
    let mut config = fixture.config.reader.clone();
    config.max_wait_retries = Some(2);
    let mut reader = Reader::open(fixture.torrent.clone(), 0, 0, 1000, config).unwrap();

    let result = reader.read(100).await;

    match result {
        Err(StreamError::StallTimeout {
            piece,
            attempts,
            waited,
        }) => {
            assert_eq!(piece, PieceIndex::new(0));
            assert_eq!(attempts, 3);
            assert_eq!(waited, Duration::from_millis(60));
        }
        other => panic!("expected stall timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_rearm_recovers_from_lost_event() {
    let fixture = Fixture::new(&[("movie.mkv", 1000)]);
    let mut reader = fixture.open(0);

    let store = fixture.store.clone();
    let info_hash = fixture.info_hash();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.complete_piece_silently(info_hash, PieceIndex::new(0));
    });

    let data = reader.read(100).await.unwrap();
    assert_eq!(data.len(), 100);
}

#[tokio::test]
async fn test_seek_moves_interest() {
    let fixture = Fixture::new(&[("movie.mkv", 1000)]);
    let mut reader = fixture.open(0);

    reader.seek(550).unwrap();

    assert_eq!(
        fixture.store.priority(fixture.info_hash(), PieceIndex::new(5)),
        Some(Priority::Critical)
    );
    assert_eq!(
        fixture.store.priority(fixture.info_hash(), PieceIndex::new(0)),
        Some(Priority::Blackholed)
    );
    assert!(matches!(
        reader.seek(1001),
        Err(StreamError::SeekOutOfRange {
            offset: 1001,
            size: 1000
        })
    ));
}

#[tokio::test]
async fn test_stream_yields_whole_file() {
    let fixture = Fixture::new(&[("intro.mkv", 130), ("movie.mkv", 870)]);
    for piece in 0..10 {
        fixture.complete(piece);
    }
    let reader = Reader::open(
        fixture.torrent.clone(),
        1,
        0,
        u64::MAX,
        fixture.config.reader.clone(),
    )
    .unwrap();

    let chunks: Vec<Bytes> = reader
        .into_stream(64)
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;

    assert!(chunks.iter().all(|chunk| chunk.len() <= 64));
    assert_eq!(chunks.concat(), fixture.expected(130..1000).to_vec());
    assert_eq!(fixture.torrent.reader_count(), 0);
}

#[tokio::test]
async fn test_drop_unregisters_reader() {
    let fixture = Fixture::new(&[("movie.mkv", 1000)]);
    let reader = fixture.open(0);
    assert_eq!(fixture.torrent.reader_count(), 1);

    drop(reader);
    assert_eq!(fixture.torrent.reader_count(), 0);
    assert!(matches!(
        Reader::open(fixture.torrent.clone(), 0, 2000, 3000, fixture.config.reader.clone()),
        Err(StreamError::SeekOutOfRange { .. })
    ));
}
