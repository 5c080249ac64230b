//! Per-torrent file table mapped onto piece ranges.

use super::{FileSelector, InfoHash, PieceIndex};
use crate::error::{Result, StreamError};
use crate::store::TorrentLayout;

/// One file of a torrent and the pieces it touches.
///
/// Files are laid out back to back in the torrent's byte space, so the first
/// and last piece of neighbouring files may be shared. An empty file owns no
/// pieces; its piece bounds only mark where it sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    /// Byte offset of the file within the torrent.
    pub offset: u64,
    pub size: u64,
    /// Position in the file table.
    pub index: usize,
    pub first_piece: PieceIndex,
    pub last_piece: PieceIndex,
}

impl FileEntry {
    /// Whether the file has no bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of pieces the file touches.
    pub fn piece_count(&self) -> u32 {
        if self.is_empty() {
            0
        } else {
            self.last_piece.as_u32() - self.first_piece.as_u32() + 1
        }
    }

    /// Iterates every piece index the file touches; none for an empty file.
    pub fn pieces(&self) -> impl DoubleEndedIterator<Item = PieceIndex> + use<> {
        let first = self.first_piece.as_u32();
        (first..first + self.piece_count()).map(PieceIndex::new)
    }

    /// Checks whether the file's pieces are all present in the bitmap.
    pub fn is_complete(&self, bitmap: &[bool]) -> bool {
        self.pieces()
            .all(|piece| bitmap.get(piece.as_usize()).copied().unwrap_or(false))
    }

    /// Fraction of the file's pieces present in the bitmap.
    ///
    /// An empty file is always complete.
    pub fn progress(&self, bitmap: &[bool]) -> f64 {
        let total = self.piece_count();
        if total == 0 {
            return 1.0;
        }
        let have = self
            .pieces()
            .filter(|piece| bitmap.get(piece.as_usize()).copied().unwrap_or(false))
            .count();
        have as f64 / total as f64
    }
}

/// Static description of a torrent: piece geometry and file table.
///
/// Built once from the piece store when a torrent is first streamed and
/// owned by the registry entry for the torrent's lifetime.
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    info_hash: InfoHash,
    piece_length: u64,
    piece_count: u32,
    total_size: u64,
    files: Vec<FileEntry>,
}

impl TorrentDescriptor {
    /// Builds the file table from the store's layout.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidLayout` - Zero piece length, or file sizes that do
    ///   not fit the advertised piece count
    pub fn from_layout(info_hash: InfoHash, layout: &TorrentLayout) -> Result<Self> {
        if layout.piece_length == 0 {
            return Err(StreamError::InvalidLayout {
                reason: "piece length is zero".to_string(),
            });
        }

        let piece_length = layout.piece_length;
        let max_piece = u64::from(layout.piece_count.saturating_sub(1));
        let mut files = Vec::with_capacity(layout.files.len());
        let mut offset = 0u64;

        for (index, span) in layout.files.iter().enumerate() {
            // An empty file at the very end sits one past the last piece.
            let first_piece = (offset / piece_length).min(max_piece);
            let last_piece = if span.size == 0 {
                first_piece
            } else {
                ((offset + span.size - 1) / piece_length).min(max_piece)
            };

            files.push(FileEntry {
                path: span.path.clone(),
                offset,
                size: span.size,
                index,
                first_piece: PieceIndex::new(first_piece as u32),
                last_piece: PieceIndex::new(last_piece as u32),
            });
            offset += span.size;
        }

        let needed_pieces = offset.div_ceil(piece_length);
        if needed_pieces != u64::from(layout.piece_count) {
            return Err(StreamError::InvalidLayout {
                reason: format!(
                    "{offset} bytes need {needed_pieces} pieces of {piece_length}, store reports {}",
                    layout.piece_count
                ),
            });
        }

        Ok(Self {
            info_hash,
            piece_length,
            piece_count: layout.piece_count,
            total_size: offset,
            files,
        })
    }

    /// Content id this descriptor was built for.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Nominal piece length in bytes; the last piece may be shorter.
    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Sum of all file sizes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// File table in torrent order.
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Looks up a file by path or index.
    ///
    /// # Errors
    ///
    /// - `StreamError::UnknownFile` - No such path or index in the file table
    pub fn resolve(&self, selector: &FileSelector) -> Result<&FileEntry> {
        let found = match selector {
            FileSelector::Path(path) => self.files.iter().find(|file| &file.path == path),
            FileSelector::Index(index) => self.files.get(*index),
        };

        found.ok_or_else(|| StreamError::UnknownFile {
            info_hash: self.info_hash,
            file: selector.to_string(),
        })
    }

    /// Maps a byte position within `file` to its piece and the offset inside it.
    pub fn locate(&self, file: &FileEntry, position: u64) -> (PieceIndex, u64) {
        let absolute = file.offset + position;
        let piece = (absolute / self.piece_length) as u32;
        let piece = piece.min(file.last_piece.as_u32());
        let offset_in_piece = absolute - u64::from(piece) * self.piece_length;
        (PieceIndex::new(piece), offset_in_piece)
    }

    /// Actual byte length of a piece; the final piece may be short.
    pub fn piece_size(&self, piece: PieceIndex) -> u64 {
        let start = u64::from(piece.as_u32()) * self.piece_length;
        self.total_size.saturating_sub(start).min(self.piece_length)
    }
}
