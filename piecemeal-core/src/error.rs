//! Error taxonomy for stream scheduling.

use std::time::Duration;

use crate::store::StoreError;
use crate::torrent::{InfoHash, PieceIndex};

/// Errors surfaced to whoever opened a stream.
///
/// Scheduling failures never show up here: a failed cycle is logged and
/// retried on the next tick. Only reader-level problems propagate.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Content {info_hash} is not known to the piece store")]
    UnknownContent { info_hash: InfoHash },

    #[error("File {file} not found in torrent {info_hash}")]
    UnknownFile { info_hash: InfoHash, file: String },

    #[error("Stream closed")]
    StreamClosed,

    #[error("Piece {piece} still missing after {attempts} attempts ({waited:?})")]
    StallTimeout {
        piece: PieceIndex,
        attempts: u32,
        waited: Duration,
    },

    #[error("Seek to {offset} is past the end of a {size} byte file")]
    SeekOutOfRange { offset: u64, size: u64 },

    #[error("Invalid torrent layout: {reason}")]
    InvalidLayout { reason: String },

    #[error("Piece store error: {0}")]
    Store(#[from] StoreError),
}

impl StreamError {
    /// Returns a short message suitable for an HTTP error body.
    pub fn user_message(&self) -> String {
        match self {
            StreamError::UnknownContent { .. } => "torrent_not_found".to_string(),
            StreamError::UnknownFile { .. } => "file_not_found".to_string(),
            StreamError::StreamClosed => "stream_closed".to_string(),
            StreamError::StallTimeout { .. } => "stream_stalled".to_string(),
            StreamError::SeekOutOfRange { .. } => "range_not_satisfiable".to_string(),
            StreamError::InvalidLayout { .. } | StreamError::Store(_) => {
                "internal_error".to_string()
            }
        }
    }

    /// Checks if the caller asked for something that does not exist.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            StreamError::UnknownContent { .. }
                | StreamError::UnknownFile { .. }
                | StreamError::SeekOutOfRange { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
