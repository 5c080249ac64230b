//! Pieces held at a fixed target outside any reader's window.

use tracing::debug;

use super::{PinTarget, Torrent};
use crate::store::StoreError;
use crate::torrent::{PieceIndex, Priority};

impl Torrent {
    /// Keeps `pieces` critical until released with [`Torrent::unpin`].
    pub fn pin(&self, pieces: &[PieceIndex]) {
        let target = PinTarget {
            priority: Priority::Critical,
            deadline: self.config.boundary_deadline,
        };
        let targets: Vec<(PieceIndex, PinTarget)> =
            pieces.iter().map(|piece| (*piece, target)).collect();
        self.pin_targets(&targets);
    }

    /// Holds each piece at its own target until released.
    ///
    /// A piece pinned more than once keeps the strongest target until its
    /// last pin is dropped.
    pub fn pin_targets(&self, targets: &[(PieceIndex, PinTarget)]) {
        {
            let mut inner = self.inner.lock();
            for (piece, target) in targets {
                inner
                    .pins
                    .entry(*piece)
                    .and_modify(|(count, held)| {
                        *count += 1;
                        *held = held.merge(*target);
                    })
                    .or_insert((1, *target));
            }
        }
        self.cycle();
    }

    /// Drops one pin reference per piece; pieces are unpinned at zero.
    pub fn unpin(&self, pieces: &[PieceIndex]) {
        let mut inner = self.inner.lock();
        for piece in pieces {
            if let Some((count, _)) = inner.pins.get_mut(piece) {
                *count -= 1;
                if *count == 0 {
                    inner.pins.remove(piece);
                }
            }
        }
    }

    /// Checks the store's bitmap for one piece.
    ///
    /// # Errors
    ///
    /// - `StoreError::UnknownTorrent` - If the store no longer knows the torrent
    pub fn is_piece_complete(&self, piece: PieceIndex) -> std::result::Result<bool, StoreError> {
        let bitmap = self.store.piece_bitmap(self.info_hash())?;
        Ok(bitmap.get(piece.as_usize()).copied().unwrap_or(false))
    }

    /// Pushes a piece a reader has been waiting on back to critical.
    ///
    /// Used when a wait times out, in case the store lost the earlier write.
    pub fn reassert(&self, piece: PieceIndex) {
        let info_hash = self.info_hash();
        let deadline = self.config.head_deadline;
        let result = self
            .store
            .set_piece_priority(info_hash, piece, Priority::Critical)
            .and_then(|()| self.store.set_piece_deadline(info_hash, piece, deadline));
        match result {
            Ok(()) => {
                self.inner.lock().applied_deadlines.insert(piece, deadline);
            }
            Err(e) => debug!("Failed to re-assert piece {} of {}: {}", piece, info_hash, e),
        }
    }
}
