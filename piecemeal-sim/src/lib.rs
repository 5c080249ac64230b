//! Piecemeal Simulation - deterministic swarms for exercising the scheduler.

#![warn(clippy::missing_errors_doc)]
//!
//! The scheduler only ever talks to a piece store: it writes priorities and
//! reads back completion. This crate plays the other side of that contract.
//! A [`SwarmSimulator`] stands in for the peers of one torrent, fetching
//! whatever the store currently says is most urgent and completing pieces
//! after a seeded, reproducible delay.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use piecemeal_core::store::MemoryPieceStore;
//! use piecemeal_sim::{SwarmConfig, SwarmSimulator};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryPieceStore::new());
//! let info_hash = store.add_torrent("movie", 1 << 20, &[("movie.mkv", 10 << 20)]);
//!
//! let mut swarm = SwarmSimulator::new(store, info_hash, SwarmConfig::with_seed(7))?;
//! let report = swarm.run_for_ticks(500)?;
//! println!("finished after {} ticks", report.ticks);
//! # Ok(())
//! # }
//! ```
//!
//! # Determinism
//!
//! Every random choice comes from a `ChaCha8Rng` seeded by
//! [`SwarmConfig::seed`]. Two simulators with the same seed, store state and
//! priority writes complete the same pieces in the same order.

pub mod invariants;
pub mod swarm;

pub use invariants::{
    CompleteFilesKept, InFlightNeverBlackholed, Invariant, InvariantChecker, InvariantViolation,
};
pub use swarm::{SwarmConfig, SwarmReport, SwarmSimulator, TickReport};

use piecemeal_core::InfoHash;

/// Errors raised while driving a simulated swarm.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// The store has no torrent under this hash
    #[error("Torrent {info_hash} is not in the simulated store")]
    UnknownTorrent { info_hash: InfoHash },

    /// The torrent disappeared between ticks
    #[error("Torrent {info_hash} was removed while the swarm was running")]
    TorrentRemoved { info_hash: InfoHash },

    /// A swarm parameter is out of range
    #[error("Invalid swarm configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A checked invariant failed after a tick
    #[error("Invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),
}
