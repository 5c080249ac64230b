//! CLI command implementations

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Subcommand;
use futures::StreamExt;
use piecemeal_core::store::MemoryPieceStore;
use piecemeal_core::{
    InfoHash, PieceIndex, PieceStore, PiecemealConfig, Priority, Reader, Registry,
    TorrentSnapshot,
};
use piecemeal_sim::{InvariantChecker, SwarmConfig, SwarmReport, SwarmSimulator};
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

const FILE_NAME: &str = "movie.mkv";

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a file from a simulated swarm and print a JSON summary
    Stream {
        /// File size in MiB
        #[arg(long, default_value = "10")]
        size_mib: u64,
        /// Piece length in KiB
        #[arg(long, default_value = "1024")]
        piece_kib: u64,
        /// Concurrent readers, spread evenly over the file
        #[arg(short, long, default_value = "1")]
        readers: usize,
        /// Swarm RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Pieces the swarm downloads at once
        #[arg(long, default_value = "4")]
        slots: usize,
        /// Milliseconds per swarm tick
        #[arg(long, default_value = "20")]
        tick_ms: u64,
        /// Read chunk in KiB
        #[arg(long, default_value = "256")]
        chunk_kib: usize,
    },
    /// Open one reader, run one cycle and print every piece's priority
    Inspect {
        /// File size in MiB
        #[arg(long, default_value = "10")]
        size_mib: u64,
        /// Piece length in KiB
        #[arg(long, default_value = "1024")]
        piece_kib: u64,
        /// Byte offset the reader opens at
        #[arg(long, default_value = "0")]
        from: u64,
        /// Pieces to mark downloaded before the cycle
        #[arg(long, value_delimiter = ',')]
        complete: Vec<u32>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the first error raised by the selected command
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Stream {
            size_mib,
            piece_kib,
            readers,
            seed,
            slots,
            tick_ms,
            chunk_kib,
        } => {
            let swarm = SwarmConfig {
                seed,
                download_slots: slots,
                tick_interval: Duration::from_millis(tick_ms),
                ..SwarmConfig::default()
            };
            let summary = stream(
                size_mib << 20,
                piece_kib << 10,
                readers,
                swarm,
                chunk_kib << 10,
            )
            .await?;
            print_json(&summary)
        }
        Commands::Inspect {
            size_mib,
            piece_kib,
            from,
            complete,
        } => {
            let report = inspect(size_mib << 20, piece_kib << 10, from, &complete)?;
            print_json(&report)
        }
    }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn setup(size: u64, piece_length: u64) -> anyhow::Result<(Arc<MemoryPieceStore>, InfoHash)> {
    if size == 0 || piece_length == 0 {
        bail!("file size and piece length must be nonzero");
    }
    let store = Arc::new(MemoryPieceStore::new());
    let info_hash = store.add_torrent("piecemeal-cli", piece_length, &[(FILE_NAME, size)]);
    Ok((store, info_hash))
}

/// Outcome of one streamed reader.
#[derive(Debug, Serialize)]
pub struct ReaderSummary {
    pub from: u64,
    pub bytes: u64,
    pub matched: bool,
    pub elapsed_ms: u128,
}

/// JSON printed by `stream`.
#[derive(Debug, Serialize)]
pub struct StreamSummary {
    pub info_hash: String,
    pub readers: Vec<ReaderSummary>,
    pub swarm: SwarmReport,
    pub torrent: Option<TorrentSnapshot>,
}

async fn stream(
    size: u64,
    piece_length: u64,
    readers: usize,
    swarm: SwarmConfig,
    chunk: usize,
) -> anyhow::Result<StreamSummary> {
    let (store, info_hash) = setup(size, piece_length)?;
    let expected = store
        .contents(info_hash)
        .context("simulated torrent has no content")?;
    let registry = Registry::new(store.clone(), PiecemealConfig::from_env());

    let readers = readers.max(1);
    let mut opened = Vec::with_capacity(readers);
    for slot in 0..readers {
        let from = size / readers as u64 * slot as u64;
        opened.push(registry.open_reader(info_hash, FILE_NAME, from)?);
    }
    info!("Opened {} readers on {}", opened.len(), info_hash);

    let swarm = SwarmSimulator::new(store.clone(), info_hash, swarm)?
        .with_invariants(InvariantChecker::standard())
        .spawn();

    let tasks = opened.into_iter().map(|reader| {
        let expected = expected.clone();
        tokio::spawn(async move { drain(reader, chunk.max(1), &expected).await })
    });
    let mut summaries = Vec::with_capacity(readers);
    for task in futures::future::join_all(tasks).await {
        summaries.push(task??);
    }

    let swarm = swarm.await??;
    let torrent = registry.get(info_hash).map(|torrent| torrent.snapshot());
    registry.shutdown_all();

    Ok(StreamSummary {
        info_hash: info_hash.to_string(),
        readers: summaries,
        swarm,
        torrent,
    })
}

async fn drain(reader: Reader, chunk: usize, expected: &[u8]) -> anyhow::Result<ReaderSummary> {
    let started = Instant::now();
    let from = reader.position();
    let mut offset = usize::try_from(from)?;
    let mut matched = true;

    let mut chunks = Box::pin(reader.into_stream(chunk));
    while let Some(bytes) = chunks.next().await {
        let bytes = bytes?;
        let end = offset + bytes.len();
        matched &= expected.get(offset..end) == Some(&bytes[..]);
        offset = end;
    }

    Ok(ReaderSummary {
        from,
        bytes: offset as u64 - from,
        matched,
        elapsed_ms: started.elapsed().as_millis(),
    })
}

/// One piece as the store sees it after a cycle.
#[derive(Debug, Serialize)]
pub struct PieceReport {
    pub index: u32,
    pub complete: bool,
    pub in_flight: bool,
    pub priority: Priority,
    pub deadline_ms: Option<u128>,
}

/// JSON printed by `inspect`.
#[derive(Debug, Serialize)]
pub struct InspectReport {
    pub torrent: TorrentSnapshot,
    pub pieces: Vec<PieceReport>,
}

fn inspect(
    size: u64,
    piece_length: u64,
    from: u64,
    complete: &[u32],
) -> anyhow::Result<InspectReport> {
    let (store, info_hash) = setup(size, piece_length)?;
    for index in complete {
        store.complete_piece_silently(info_hash, PieceIndex::new(*index));
    }

    let registry = Registry::new(store.clone(), PiecemealConfig::from_env());
    let reader = registry.open_reader(info_hash, FILE_NAME, from)?;
    let torrent = registry
        .get(info_hash)
        .context("torrent vanished after opening a reader")?;

    let bitmap = store.piece_bitmap(info_hash)?;
    let in_flight = store.pieces_in_flight(info_hash)?;
    let pieces = store
        .piece_priorities(info_hash)?
        .into_iter()
        .enumerate()
        .map(|(index, priority)| {
            let piece = PieceIndex::new(index as u32);
            PieceReport {
                index: piece.as_u32(),
                complete: bitmap.get(index).copied().unwrap_or(false),
                in_flight: in_flight.contains(&piece),
                priority,
                deadline_ms: store.deadline(info_hash, piece).map(|d| d.as_millis()),
            }
        })
        .collect();

    let report = InspectReport {
        torrent: torrent.snapshot(),
        pieces,
    };
    drop(reader);
    registry.shutdown_all();
    Ok(report)
}
