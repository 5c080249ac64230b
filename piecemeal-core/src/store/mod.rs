//! Piece store capability consumed by the scheduler.
//!
//! The BitTorrent engine itself (peers, hashing, disk) lives behind this
//! trait. The scheduler only issues priority commands through it and reads
//! back whatever state the engine reports at call time.

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
#[cfg(test)]
mod memory_tests;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryPieceStore;

use crate::scheduler::CyclePlan;
use crate::torrent::{InfoHash, PieceIndex, Priority};

/// Errors reported by a piece store implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Torrent {info_hash} not found")]
    UnknownTorrent { info_hash: InfoHash },

    #[error("Piece {piece} out of range (torrent has {piece_count} pieces)")]
    PieceOutOfRange { piece: PieceIndex, piece_count: u32 },

    #[error("Piece {piece} is not downloaded")]
    PieceUnavailable { piece: PieceIndex },

    #[error("Piece store backend failure: {reason}")]
    Backend { reason: String },
}

/// One file in the store's file table, in torrent order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub path: String,
    pub size: u64,
}

/// Piece geometry and file table as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentLayout {
    pub piece_length: u64,
    pub piece_count: u32,
    pub files: Vec<FileSpan>,
}

/// Push notifications raised by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    PieceCompleted {
        info_hash: InfoHash,
        piece: PieceIndex,
    },
    TorrentRemoved {
        info_hash: InfoHash,
    },
    TorrentFinished {
        info_hash: InfoHash,
    },
}

/// Abstract interface over the underlying torrent engine.
///
/// Every query is a snapshot as of call time; peers may complete pieces or
/// drop connections between calls and callers must tolerate that.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Returns piece geometry and file table.
    ///
    /// # Errors
    ///
    /// - `StoreError::UnknownTorrent` - If unknown info hash
    fn layout(&self, info_hash: InfoHash) -> Result<TorrentLayout, StoreError>;

    /// Returns which pieces are downloaded and verified.
    ///
    /// # Errors
    ///
    /// - `StoreError::UnknownTorrent` - If unknown info hash
    fn piece_bitmap(&self, info_hash: InfoHash) -> Result<Vec<bool>, StoreError>;

    /// Returns the current priority of every piece.
    ///
    /// # Errors
    ///
    /// - `StoreError::UnknownTorrent` - If unknown info hash
    fn piece_priorities(&self, info_hash: InfoHash) -> Result<Vec<Priority>, StoreError>;

    /// Returns pieces peers are downloading right now, best effort.
    ///
    /// # Errors
    ///
    /// - `StoreError::UnknownTorrent` - If unknown info hash
    fn pieces_in_flight(&self, info_hash: InfoHash) -> Result<HashSet<PieceIndex>, StoreError>;

    /// Replaces the file priority vector.
    ///
    /// # Errors
    ///
    /// - `StoreError::UnknownTorrent` - If unknown info hash
    /// - `StoreError::Backend` - If the vector length does not match the file table
    fn set_file_priorities(
        &self,
        info_hash: InfoHash,
        priorities: &[Priority],
    ) -> Result<(), StoreError>;

    /// Sets one piece's priority.
    ///
    /// # Errors
    ///
    /// - `StoreError::UnknownTorrent` - If unknown info hash
    /// - `StoreError::PieceOutOfRange` - If invalid piece index
    fn set_piece_priority(
        &self,
        info_hash: InfoHash,
        piece: PieceIndex,
        priority: Priority,
    ) -> Result<(), StoreError>;

    /// Asks the store to have a piece within `deadline` from now.
    ///
    /// # Errors
    ///
    /// - `StoreError::UnknownTorrent` - If unknown info hash
    /// - `StoreError::PieceOutOfRange` - If invalid piece index
    fn set_piece_deadline(
        &self,
        info_hash: InfoHash,
        piece: PieceIndex,
        deadline: Duration,
    ) -> Result<(), StoreError>;

    /// Drops every outstanding piece deadline.
    ///
    /// # Errors
    ///
    /// - `StoreError::UnknownTorrent` - If unknown info hash
    fn reset_piece_deadlines(&self, info_hash: InfoHash) -> Result<(), StoreError>;

    /// Reads a downloaded piece's payload.
    ///
    /// # Errors
    ///
    /// - `StoreError::UnknownTorrent` - If unknown info hash
    /// - `StoreError::PieceOutOfRange` - If invalid piece index
    /// - `StoreError::PieceUnavailable` - If the piece is not downloaded yet
    async fn read_piece(&self, info_hash: InfoHash, piece: PieceIndex)
    -> Result<Bytes, StoreError>;

    /// Subscribes to completion and lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Checks if the torrent is paused in the engine.
    fn is_paused(&self, info_hash: InfoHash) -> bool;

    /// Resumes a paused torrent.
    ///
    /// # Errors
    ///
    /// - `StoreError::UnknownTorrent` - If unknown info hash
    fn resume(&self, info_hash: InfoHash) -> Result<(), StoreError>;

    /// Applies one scheduling cycle's writes.
    ///
    /// File priorities go first so piece writes land on files the engine
    /// is willing to fetch. Implementations with a native batch call can
    /// override this to make the whole plan atomic.
    ///
    /// # Errors
    ///
    /// - Any error from the individual setters; the remaining writes are skipped
    fn apply_plan(&self, info_hash: InfoHash, plan: &CyclePlan) -> Result<(), StoreError> {
        if let Some(files) = &plan.file_priorities {
            self.set_file_priorities(info_hash, files)?;
        }
        for (&piece, &priority) in &plan.pieces {
            self.set_piece_priority(info_hash, piece, priority)?;
        }
        for (&piece, &deadline) in &plan.deadlines {
            self.set_piece_deadline(info_hash, piece, deadline)?;
        }
        Ok(())
    }
}
