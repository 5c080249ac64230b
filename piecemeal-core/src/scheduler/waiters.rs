//! Per-piece wait registrations.
//!
//! Readers blocked on the same piece share one `Notify`. Each registration
//! is a guard; dropping it releases exactly that reader's interest, and the
//! slot disappears once nobody waits on the piece anymore.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use crate::torrent::PieceIndex;

struct WaitSlot {
    notify: Arc<Notify>,
    waiters: usize,
}

/// Registry of readers waiting for pieces of one torrent.
#[derive(Default)]
pub struct PieceWaiters {
    slots: Mutex<HashMap<PieceIndex, WaitSlot>>,
}

impl PieceWaiters {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `piece`.
    ///
    /// Callers must create and enable the `notified()` future before
    /// checking whether the piece is already available, otherwise a
    /// completion landing in between is missed until the next re-arm.
    pub fn register(self: &Arc<Self>, piece: PieceIndex) -> WaitGuard {
        let mut slots = self.slots.lock();
        let slot = slots.entry(piece).or_insert_with(|| WaitSlot {
            notify: Arc::new(Notify::new()),
            waiters: 0,
        });
        slot.waiters += 1;

        WaitGuard {
            waiters: Arc::clone(self),
            piece,
            notify: Arc::clone(&slot.notify),
        }
    }

    /// Wakes everyone waiting on `piece` and forgets the slot.
    ///
    /// Returns the number of registrations that were woken.
    pub fn wake(&self, piece: PieceIndex) -> usize {
        let Some(slot) = self.slots.lock().remove(&piece) else {
            return 0;
        };
        slot.notify.notify_waiters();
        slot.waiters
    }

    /// Pieces with at least one waiter, in index order.
    pub fn waiting_pieces(&self) -> Vec<PieceIndex> {
        let mut pieces: Vec<PieceIndex> = self.slots.lock().keys().copied().collect();
        pieces.sort();
        pieces
    }

    /// Total registrations across all pieces.
    pub fn len(&self) -> usize {
        self.slots.lock().values().map(|slot| slot.waiters).sum()
    }

    /// Whether no read is waiting.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn release(&self, piece: PieceIndex, notify: &Arc<Notify>) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&piece) else {
            return;
        };
        // A slot recreated after a wake belongs to newer waiters.
        if !Arc::ptr_eq(&slot.notify, notify) {
            return;
        }
        slot.waiters -= 1;
        if slot.waiters == 0 {
            slots.remove(&piece);
        }
    }
}

/// One reader's registration on one piece.
pub struct WaitGuard {
    waiters: Arc<PieceWaiters>,
    piece: PieceIndex,
    notify: Arc<Notify>,
}

impl WaitGuard {
    /// Piece this guard waits on.
    pub fn piece(&self) -> PieceIndex {
        self.piece
    }

    /// Future resolving when the piece is woken.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.waiters.release(self.piece, &self.notify);
    }
}
