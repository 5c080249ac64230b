//! Serializable views of a torrent's scheduling state.

use serde::Serialize;

use crate::torrent::Priority;

/// Lifecycle of a streamed torrent.
///
/// `Initializing -> Streaming <-> Idle -> ShutDown`. `ShutDown` is terminal;
/// a torrent that is streamed again gets a fresh registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    /// Registered, first cycle not yet applied.
    Initializing,
    /// At least one reader or fileset is driving priorities.
    Streaming,
    /// No readers; eligible for the idle reaper.
    Idle,
    ShutDown,
}

impl TorrentState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        self == TorrentState::ShutDown
    }
}

/// Point-in-time view of one torrent, as printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentSnapshot {
    pub info_hash: String,
    pub state: TorrentState,
    pub readers: usize,
    pub filesets: usize,
    pub pinned_pieces: Vec<u32>,
    pub waiting_pieces: Vec<u32>,
    pub pieces_complete: usize,
    pub piece_count: u32,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub idle_secs: u64,
    pub files: Vec<FileSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
/// Per-file progress and priority.
pub struct FileSnapshot {
    pub index: usize,
    pub path: String,
    pub size: u64,
    pub progress: f64,
    /// Last file priority this torrent applied, if any.
    pub priority: Option<Priority>,
}
