//! Torrent identifiers, piece priorities and the file table.

pub mod descriptor;

use std::fmt;
use std::str::FromStr;

pub use descriptor::{FileEntry, TorrentDescriptor};

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary. Used as the content id by
/// every public entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for InfoHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(s, &mut hash)?;
        Ok(Self(hash))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a slice position.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named priority levels the scheduler reasons in.
///
/// The piece store speaks a native 0..=7 integer scale; conversion happens
/// only at the store boundary. The same scale is used for file priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum Priority {
    /// Do not fetch.
    Blackholed,
    /// Fetch eventually, behind everything else.
    Background,
    /// Read-ahead window, no deadline.
    Normal,
    /// Prefetch slightly ahead of normal traffic.
    Elevated,
    /// Needed right now by a reader or a boundary wait.
    Critical,
}

impl Priority {
    /// Maps to the store's native integer scale.
    pub fn as_native(self) -> u8 {
        match self {
            Priority::Blackholed => 0,
            Priority::Background => 1,
            Priority::Normal => 4,
            Priority::Elevated => 6,
            Priority::Critical => 7,
        }
    }

    /// Maps a native value back, bucketing to the nearest lower level.
    pub fn from_native(value: u8) -> Self {
        match value {
            0 => Priority::Blackholed,
            1..=3 => Priority::Background,
            4..=5 => Priority::Normal,
            6 => Priority::Elevated,
            _ => Priority::Critical,
        }
    }
}

/// Names a file inside a torrent, either by path or by file-table index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileSelector {
    Path(String),
    Index(usize),
}

impl fmt::Display for FileSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSelector::Path(path) => write!(f, "{path}"),
            FileSelector::Index(index) => write!(f, "#{index}"),
        }
    }
}

impl From<&str> for FileSelector {
    fn from(path: &str) -> Self {
        FileSelector::Path(path.to_string())
    }
}

impl From<usize> for FileSelector {
    fn from(index: usize) -> Self {
        FileSelector::Index(index)
    }
}
