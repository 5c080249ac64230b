//! Simulated peers for one torrent.
//!
//! Each tick, downloads in progress count down and complete; free slots are
//! then refilled from the store's wanted list, most urgent first. A piece
//! that was already handed to a peer keeps downloading even if the scheduler
//! later blackholes it, as a real engine would.

use std::sync::Arc;
use std::time::Duration;

use piecemeal_core::store::MemoryPieceStore;
use piecemeal_core::{InfoHash, PieceIndex, PieceStore};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::SimulationError;
use crate::invariants::InvariantChecker;

/// Swarm behavior for one simulated torrent.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// RNG seed; equal seeds give equal completion orders
    pub seed: u64,
    /// Pieces downloading concurrently
    pub download_slots: usize,
    /// Ticks a piece spends in flight before completing
    pub ticks_per_piece: u32,
    /// Up to this many extra ticks, drawn per piece
    pub jitter_ticks: u32,
    /// Wall-clock length of one tick when running on the runtime
    pub tick_interval: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            download_slots: 4,
            ticks_per_piece: 2,
            jitter_ticks: 2,
            tick_interval: Duration::from_millis(10),
        }
    }
}

impl SwarmConfig {
    /// Default swarm with a specific seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), SimulationError> {
        if self.download_slots == 0 {
            return Err(SimulationError::InvalidConfig {
                reason: "download_slots must be at least 1".to_string(),
            });
        }
        if self.ticks_per_piece == 0 {
            return Err(SimulationError::InvalidConfig {
                reason: "ticks_per_piece must be at least 1".to_string(),
            });
        }
        if self.tick_interval.is_zero() {
            return Err(SimulationError::InvalidConfig {
                reason: "tick_interval must be nonzero".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Download {
    piece: PieceIndex,
    remaining: u32,
}

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub completed: Vec<PieceIndex>,
    pub started: Vec<PieceIndex>,
}

/// Summary of a finished or interrupted run.
#[derive(Debug, Clone, Serialize)]
pub struct SwarmReport {
    pub ticks: u64,
    pub completion_order: Vec<u32>,
    pub finished: bool,
}

/// Deterministic stand-in for the peers of one torrent.
pub struct SwarmSimulator {
    store: Arc<MemoryPieceStore>,
    info_hash: InfoHash,
    config: SwarmConfig,
    rng: ChaCha8Rng,
    downloads: Vec<Download>,
    completion_order: Vec<PieceIndex>,
    ticks: u64,
    checker: Option<InvariantChecker>,
}

impl SwarmSimulator {
    /// Creates a swarm for a torrent already present in `store`.
    ///
    /// # Errors
    ///
    /// - `SimulationError::UnknownTorrent` - If the store has no such torrent
    /// - `SimulationError::InvalidConfig` - If a config value is out of range
    pub fn new(
        store: Arc<MemoryPieceStore>,
        info_hash: InfoHash,
        config: SwarmConfig,
    ) -> Result<Self, SimulationError> {
        config.validate()?;
        store
            .layout(info_hash)
            .map_err(|_| SimulationError::UnknownTorrent { info_hash })?;

        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            store,
            info_hash,
            config,
            downloads: Vec::new(),
            completion_order: Vec::new(),
            ticks: 0,
            checker: None,
        })
    }

    /// Checks `checker` after every tick; a violation aborts the run.
    pub fn with_invariants(mut self, checker: InvariantChecker) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Torrent this swarm serves.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Ticks executed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Pieces currently held by a simulated peer.
    pub fn in_flight(&self) -> Vec<PieceIndex> {
        self.downloads.iter().map(|download| download.piece).collect()
    }

    /// Pieces completed by this swarm, in order.
    pub fn completion_order(&self) -> &[PieceIndex] {
        &self.completion_order
    }

    /// Whether every piece of the torrent is downloaded.
    ///
    /// # Errors
    ///
    /// - `SimulationError::TorrentRemoved` - If the torrent left the store
    pub fn is_finished(&self) -> Result<bool, SimulationError> {
        let bitmap = self
            .store
            .piece_bitmap(self.info_hash)
            .map_err(|_| SimulationError::TorrentRemoved {
                info_hash: self.info_hash,
            })?;
        Ok(bitmap.iter().all(|have| *have))
    }

    /// Advances the swarm by one tick.
    ///
    /// Completions raise store events, so waiting readers are woken through
    /// the same path a real engine would use.
    ///
    /// # Errors
    ///
    /// - `SimulationError::TorrentRemoved` - If the torrent left the store
    /// - `SimulationError::Invariant` - If an attached invariant fails
    pub fn step(&mut self) -> Result<TickReport, SimulationError> {
        self.ticks += 1;
        let mut report = TickReport {
            tick: self.ticks,
            ..TickReport::default()
        };

        for download in &mut self.downloads {
            download.remaining = download.remaining.saturating_sub(1);
        }
        let (done, pending): (Vec<Download>, Vec<Download>) = self
            .downloads
            .drain(..)
            .partition(|download| download.remaining == 0);
        self.downloads = pending;

        for download in done {
            self.store.complete_piece(self.info_hash, download.piece);
            self.completion_order.push(download.piece);
            report.completed.push(download.piece);
        }

        // Completing into a removed torrent is a silent no-op, so check here.
        self.is_finished()?;
        let wanted = self.store.wanted_pieces(self.info_hash);
        for (piece, priority) in wanted {
            if self.downloads.len() >= self.config.download_slots {
                break;
            }
            if self.downloads.iter().any(|download| download.piece == piece) {
                continue;
            }
            let remaining =
                self.config.ticks_per_piece + self.rng.random_range(0..=self.config.jitter_ticks);
            self.store.set_in_flight(self.info_hash, piece, true);
            self.downloads.push(Download { piece, remaining });
            report.started.push(piece);
            debug!(
                "Swarm tick {}: started {} at {:?}, {} ticks",
                self.ticks, piece, priority, remaining
            );
        }

        if let Some(checker) = &self.checker {
            checker.check(&self.store, self.info_hash, self.ticks)?;
        }
        Ok(report)
    }

    /// Steps synchronously until the torrent completes or `max_ticks` ran.
    ///
    /// # Errors
    ///
    /// - `SimulationError::TorrentRemoved` - If the torrent left the store
    /// - `SimulationError::Invariant` - If an attached invariant fails
    pub fn run_for_ticks(&mut self, max_ticks: u64) -> Result<SwarmReport, SimulationError> {
        for _ in 0..max_ticks {
            if self.is_finished()? {
                break;
            }
            self.step()?;
        }
        self.report()
    }

    /// Steps once per `tick_interval` until the torrent completes.
    ///
    /// Yields to the runtime between ticks so the registry can deliver
    /// completion events to readers.
    ///
    /// # Errors
    ///
    /// - `SimulationError::TorrentRemoved` - If the torrent left the store
    /// - `SimulationError::Invariant` - If an attached invariant fails
    pub async fn run(mut self) -> Result<SwarmReport, SimulationError> {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.is_finished()? {
            interval.tick().await;
            self.step()?;
        }
        info!(
            "Swarm for {} finished after {} ticks",
            self.info_hash, self.ticks
        );
        self.report()
    }

    /// Runs the swarm as a background task on the current runtime.
    pub fn spawn(self) -> JoinHandle<Result<SwarmReport, SimulationError>> {
        tokio::spawn(self.run())
    }

    fn report(&self) -> Result<SwarmReport, SimulationError> {
        Ok(SwarmReport {
            ticks: self.ticks,
            completion_order: self
                .completion_order
                .iter()
                .map(|piece| piece.as_u32())
                .collect(),
            finished: self.is_finished()?,
        })
    }
}
