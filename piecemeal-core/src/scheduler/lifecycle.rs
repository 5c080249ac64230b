//! Torrent lifecycle: periodic driving, idle detection and teardown.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use super::{
    CyclePlan, FileSnapshot, ReaderId, ReaderSlot, Torrent, TorrentInner, TorrentSnapshot,
    TorrentState,
};
use crate::store::StoreError;
use crate::torrent::{PieceIndex, Priority};

impl Torrent {
    /// Starts the periodic cycle driver.
    ///
    /// The task only holds a weak reference and stops on its own once the
    /// torrent is dropped or shut down.
    pub fn spawn_ticker(self: &Arc<Self>) {
        let torrent = Arc::downgrade(self);
        let period = self.config.cycle_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(torrent) = torrent.upgrade() else {
                    break;
                };
                if torrent.is_shut_down() {
                    break;
                }
                torrent.cycle();
            }
        });

        if let Some(previous) = self.ticker.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Readers with no activity for at least `timeout` as of `now`.
    pub fn idle_readers(&self, now: Instant, timeout: Duration) -> Vec<ReaderId> {
        self.inner
            .lock()
            .readers
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.last_activity) >= timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Checks whether the torrent has had no readers for at least `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        let inner = self.inner.lock();
        !inner.state.is_terminal()
            && inner.readers.is_empty()
            && now.saturating_duration_since(inner.last_activity) >= timeout
    }

    /// Shuts the torrent down if it has been idle for `timeout` as of `now`.
    ///
    /// The idle check and the transition happen under one lock, so a reader
    /// registering concurrently either keeps the torrent alive or is refused
    /// with `StreamClosed`. Returns whether the torrent was shut down.
    pub fn shutdown_if_idle(&self, now: Instant, timeout: Duration) -> bool {
        let readers = {
            let mut inner = self.inner.lock();
            let idle = inner.readers.is_empty()
                && now.saturating_duration_since(inner.last_activity) >= timeout;
            if inner.state.is_terminal() || !idle {
                return false;
            }
            Self::begin_shutdown(&mut inner)
        };
        self.finish_shutdown(readers);
        true
    }

    /// Tears the torrent down and hands its pieces back to the store.
    ///
    /// Closes every reader, fails outstanding waits with `StreamClosed`,
    /// stops the ticker and resets priorities to a neutral state. Calling it
    /// again is a no-op.
    pub fn shutdown(&self) {
        let readers = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            Self::begin_shutdown(&mut inner)
        };
        self.finish_shutdown(readers);
    }

    fn begin_shutdown(inner: &mut TorrentInner) -> HashMap<ReaderId, ReaderSlot> {
        inner.state = TorrentState::ShutDown;
        inner.filesets.clear();
        inner.pins.clear();
        inner.applied_deadlines.clear();
        std::mem::take(&mut inner.readers)
    }

    fn finish_shutdown(&self, readers: HashMap<ReaderId, ReaderSlot>) {
        for slot in readers.values() {
            let _ = slot.close.send(true);
        }
        self.shutdown.send_replace(true);
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }

        match self.release_priorities() {
            Ok(()) => info!(
                "Torrent {} shut down, released {} readers",
                self.info_hash(),
                readers.len()
            ),
            Err(StoreError::UnknownTorrent { .. }) => {
                info!("Torrent {} shut down after leaving the store", self.info_hash());
            }
            Err(e) => warn!(
                "Torrent {} shut down without releasing priorities: {}",
                self.info_hash(),
                e
            ),
        }
    }

    fn release_priorities(&self) -> std::result::Result<(), StoreError> {
        let info_hash = self.info_hash();
        self.store.reset_piece_deadlines(info_hash)?;

        let bitmap = self.store.piece_bitmap(info_hash)?;
        let current = self.store.piece_priorities(info_hash)?;
        let pieces = current
            .iter()
            .enumerate()
            .filter(|(index, priority)| {
                !bitmap.get(*index).copied().unwrap_or(false) && **priority != Priority::Normal
            })
            .map(|(index, _)| (PieceIndex::new(index as u32), Priority::Normal))
            .collect();

        let file_priorities = self
            .descriptor
            .files()
            .iter()
            .map(|file| {
                if !self.config.download_only_streamed {
                    Priority::Normal
                } else if file.is_complete(&bitmap) {
                    Priority::Background
                } else {
                    Priority::Blackholed
                }
            })
            .collect();

        let plan = CyclePlan {
            file_priorities: Some(file_priorities),
            pieces,
            deadlines: BTreeMap::new(),
        };
        self.store.apply_plan(info_hash, &plan)
    }

    /// Serializable view of the torrent for diagnostics.
    pub fn snapshot(&self) -> TorrentSnapshot {
        let bitmap = self
            .store
            .piece_bitmap(self.info_hash())
            .unwrap_or_default();
        let inner = self.inner.lock();

        let files = self
            .descriptor
            .files()
            .iter()
            .map(|file| FileSnapshot {
                index: file.index,
                path: file.path.clone(),
                size: file.size,
                progress: file.progress(&bitmap),
                priority: inner
                    .applied_files
                    .as_ref()
                    .and_then(|files| files.get(file.index).copied()),
            })
            .collect();

        TorrentSnapshot {
            info_hash: self.info_hash().to_string(),
            state: inner.state,
            readers: inner.readers.len(),
            filesets: inner.filesets.len(),
            pinned_pieces: inner.pins.keys().map(|piece| piece.as_u32()).collect(),
            waiting_pieces: self
                .waiters
                .waiting_pieces()
                .into_iter()
                .map(PieceIndex::as_u32)
                .collect(),
            pieces_complete: bitmap.iter().filter(|have| **have).count(),
            piece_count: self.descriptor.piece_count(),
            cycles: inner.cycles,
            failed_cycles: inner.failed_cycles,
            idle_secs: inner.last_activity.elapsed().as_secs(),
            files,
        }
    }
}

impl Drop for Torrent {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.get_mut().take() {
            ticker.abort();
        }
    }
}
