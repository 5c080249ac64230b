//! Centralized configuration for Piecemeal.
//!
//! Window sizes, deadlines and timeouts are tuned empirically for player
//! compatibility, so every one of them is a tunable here rather than a
//! constant in the scheduler.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::torrent::Priority;

/// Central configuration for all Piecemeal components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PiecemealConfig {
    pub scheduler: SchedulerConfig,
    pub reader: ReaderConfig,
    pub reaper: ReaperConfig,
}

/// Piece prioritization behavior of the cycle engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Minimum read-ahead window, in incomplete pieces past each head
    pub readahead_pieces: u32,
    /// Minimum read-ahead window in bytes; converted to pieces per torrent
    pub readahead_bytes: u64,
    /// Window pieces this close to the last head are critical, the rest elevated
    pub readahead_critical_pieces: u32,
    /// Deadline added per piece of distance from the head
    pub readahead_deadline_step: Duration,
    /// Start buffer as a percentage of the file's pieces
    pub start_buffer_percent: f64,
    /// Start buffer in bytes; the larger of the two thresholds wins
    pub start_buffer_bytes: u64,
    /// Period of the per-torrent cycle ticker
    pub cycle_interval: Duration,
    /// Deadline given to the piece a reader is sitting on
    pub head_deadline: Duration,
    /// Deadline given to pinned first/last pieces
    pub boundary_deadline: Duration,
    /// Keep unrequested pieces blackholed once streaming stops
    pub download_only_streamed: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            readahead_pieces: 6,
            readahead_bytes: 5 * 1024 * 1024, // 5 MiB
            readahead_critical_pieces: 5,
            readahead_deadline_step: Duration::from_millis(700),
            start_buffer_percent: 0.3,
            start_buffer_bytes: 5 * 1024 * 1024,
            cycle_interval: Duration::from_secs(2),
            head_deadline: Duration::ZERO,
            boundary_deadline: Duration::from_millis(700),
            download_only_streamed: false,
        }
    }
}

impl SchedulerConfig {
    /// Read-ahead window in pieces for a given piece length.
    pub fn window_pieces(&self, piece_length: u64) -> u32 {
        let by_bytes = self.readahead_bytes.div_ceil(piece_length.max(1));
        let by_bytes = u32::try_from(by_bytes).unwrap_or(u32::MAX);
        self.readahead_pieces.max(by_bytes)
    }

    /// Priority and deadline of a read-ahead piece `distance` pieces past
    /// its head, counting from zero.
    pub fn readahead_target(&self, distance: u32) -> (Priority, Duration) {
        let priority = if distance < self.readahead_critical_pieces {
            Priority::Critical
        } else {
            Priority::Elevated
        };
        (priority, self.readahead_deadline_step * distance.saturating_add(1))
    }

    /// Pieces that must be present at the start of a file of `file_pieces`
    /// pieces before playback is worth starting.
    ///
    /// Never less than one piece and never more than the file has.
    pub fn start_buffer_pieces(&self, file_pieces: u32, piece_length: u64) -> u32 {
        let by_percent = (f64::from(file_pieces) * self.start_buffer_percent / 100.0).ceil() as u32;
        let by_bytes = self.start_buffer_bytes.div_ceil(piece_length.max(1));
        let by_bytes = u32::try_from(by_bytes).unwrap_or(u32::MAX).min(file_pieces);
        by_percent.max(by_bytes).clamp(1, file_pieces.max(1))
    }
}

/// Blocking read behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Safety re-arm interval for a read waiting on a piece
    pub poll_interval: Duration,
    /// Give up with a stall error after this many re-arms (None = never)
    pub max_wait_retries: Option<u32>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_wait_retries: None,
        }
    }
}

/// Idle sweep behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// How often the reaper scans the registry
    pub sweep_interval: Duration,
    /// Reader-less inactivity after which a torrent is shut down
    pub torrent_idle_timeout: Duration,
    /// Inactivity after which a single reader is force-closed
    pub reader_idle_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            torrent_idle_timeout: Duration::from_secs(12 * 60 * 60), // 12 hours
            reader_idle_timeout: Duration::from_secs(12 * 60 * 60),
        }
    }
}

impl PiecemealConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Zero periods and timeouts are ignored;
    /// timers cannot tick at a zero interval.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(pieces) = env_parse::<u32>("PIECEMEAL_READAHEAD_PIECES") {
            config.scheduler.readahead_pieces = pieces;
        }

        if let Some(bytes) = env_parse::<u64>("PIECEMEAL_READAHEAD_BYTES") {
            config.scheduler.readahead_bytes = bytes;
        }

        if let Some(millis) = env_nonzero("PIECEMEAL_CYCLE_INTERVAL_MS") {
            config.scheduler.cycle_interval = Duration::from_millis(millis);
        }

        if let Some(only_streamed) = env_parse::<bool>("PIECEMEAL_DOWNLOAD_ONLY_STREAMED") {
            config.scheduler.download_only_streamed = only_streamed;
        }

        if let Some(millis) = env_nonzero("PIECEMEAL_POLL_INTERVAL_MS") {
            config.reader.poll_interval = Duration::from_millis(millis);
        }

        if let Some(retries) = env_parse::<u32>("PIECEMEAL_MAX_WAIT_RETRIES") {
            config.reader.max_wait_retries = Some(retries);
        }

        if let Some(seconds) = env_nonzero("PIECEMEAL_IDLE_TIMEOUT") {
            config.reaper.torrent_idle_timeout = Duration::from_secs(seconds);
            config.reaper.reader_idle_timeout = Duration::from_secs(seconds);
        }

        config
    }

    /// Creates a configuration with short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            scheduler: SchedulerConfig {
                readahead_pieces: 4,
                readahead_bytes: 0,
                readahead_critical_pieces: 2,
                cycle_interval: Duration::from_millis(50),
                ..Default::default()
            },
            reader: ReaderConfig {
                poll_interval: Duration::from_millis(20),
                max_wait_retries: None,
            },
            reaper: ReaperConfig {
                sweep_interval: Duration::from_secs(1),
                torrent_idle_timeout: Duration::from_secs(10),
                reader_idle_timeout: Duration::from_secs(10),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_nonzero(name: &str) -> Option<u64> {
    env_parse::<u64>(name).filter(|value| *value > 0)
}
