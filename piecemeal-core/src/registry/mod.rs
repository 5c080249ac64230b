//! Registry of streamed torrents keyed by info hash.
//!
//! The registry is the only process-wide state. Each entry owns its own
//! scheduler; entries are created on first use and destroyed on removal,
//! idle reaping or when the store reports the torrent gone.


use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PiecemealConfig;
use crate::error::{Result, StreamError};
use crate::reader::Reader;
use crate::scheduler::{FilesetKey, PinTarget, Torrent, TorrentSnapshot};
use crate::store::{PieceStore, StoreError, StoreEvent};
use crate::torrent::{FileSelector, InfoHash, PieceIndex, Priority, TorrentDescriptor};

/// Owns every torrent currently being streamed.
pub struct Registry {
    store: Arc<dyn PieceStore>,
    config: PiecemealConfig,
    torrents: RwLock<HashMap<InfoHash, Arc<Torrent>>>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Creates a registry and starts listening to store events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn PieceStore>, config: PiecemealConfig) -> Arc<Self> {
        let registry = Arc::new(Self {
            store,
            config,
            torrents: RwLock::new(HashMap::new()),
            event_pump: Mutex::new(None),
        });
        registry.spawn_event_pump();
        registry
    }

    /// Returns the configuration every torrent is created with.
    pub fn config(&self) -> &PiecemealConfig {
        &self.config
    }

    /// Returns the piece store backing this registry.
    pub fn store(&self) -> &Arc<dyn PieceStore> {
        &self.store
    }

    /// Looks up a live torrent without creating it.
    pub fn get(&self, info_hash: InfoHash) -> Option<Arc<Torrent>> {
        self.torrents.read().get(&info_hash).cloned()
    }

    /// Returns every tracked torrent.
    pub fn torrents(&self) -> Vec<Arc<Torrent>> {
        self.torrents.read().values().cloned().collect()
    }

    /// Number of tracked torrents.
    pub fn len(&self) -> usize {
        self.torrents.read().len()
    }

    /// Checks if no torrent is tracked.
    pub fn is_empty(&self) -> bool {
        self.torrents.read().is_empty()
    }

    /// Returns the torrent for `info_hash`, creating its scheduler on first use.
    ///
    /// A new entry resumes the torrent in the store if it was paused and
    /// starts its cycle ticker.
    ///
    /// # Errors
    ///
    /// - `StreamError::UnknownContent` - If the store does not know the info hash
    /// - `StreamError::InvalidLayout` - If the store's file table is inconsistent
    pub fn get_or_create(&self, info_hash: InfoHash) -> Result<Arc<Torrent>> {
        if let Some(torrent) = self.get(info_hash) {
            if !torrent.is_shut_down() {
                return Ok(torrent);
            }
        }

        let layout = self.store.layout(info_hash).map_err(|e| match e {
            StoreError::UnknownTorrent { info_hash } => StreamError::UnknownContent { info_hash },
            other => StreamError::Store(other),
        })?;
        let descriptor = TorrentDescriptor::from_layout(info_hash, &layout)?;

        let torrent = {
            let mut torrents = self.torrents.write();
            if let Some(existing) = torrents.get(&info_hash) {
                if !existing.is_shut_down() {
                    return Ok(Arc::clone(existing));
                }
            }
            let torrent = Torrent::new(
                descriptor,
                Arc::clone(&self.store),
                self.config.scheduler.clone(),
            );
            torrents.insert(info_hash, Arc::clone(&torrent));
            torrent
        };

        if self.store.is_paused(info_hash) {
            match self.store.resume(info_hash) {
                Ok(()) => info!("Resumed paused torrent {} for streaming", info_hash),
                Err(e) => warn!("Failed to resume torrent {}: {}", info_hash, e),
            }
        }
        torrent.spawn_ticker();

        info!(
            "Tracking torrent {} ({} pieces of {} bytes, {} files)",
            info_hash,
            torrent.descriptor().piece_count(),
            torrent.descriptor().piece_length(),
            torrent.descriptor().files().len()
        );
        Ok(torrent)
    }

    /// Shuts a torrent down and forgets it. Returns false if it was not tracked.
    pub fn remove(&self, info_hash: InfoHash) -> bool {
        let Some(torrent) = self.torrents.write().remove(&info_hash) else {
            return false;
        };
        torrent.shutdown();
        true
    }

    /// Forgets `torrent` if it is still the entry for its info hash.
    ///
    /// Leaves a newer entry created after `torrent` shut down in place.
    /// Returns whether an entry was removed.
    pub fn detach(&self, torrent: &Arc<Torrent>) -> bool {
        let mut torrents = self.torrents.write();
        match torrents.get(&torrent.info_hash()) {
            Some(current) if Arc::ptr_eq(current, torrent) => {
                torrents.remove(&torrent.info_hash());
                true
            }
            _ => false,
        }
    }

    /// Shuts down every tracked torrent.
    pub fn shutdown_all(&self) {
        let torrents: Vec<Arc<Torrent>> = self.torrents.write().drain().map(|(_, t)| t).collect();
        for torrent in torrents {
            torrent.shutdown();
        }
    }

    /// Snapshots of every tracked torrent, ordered by info hash.
    pub fn snapshots(&self) -> Vec<TorrentSnapshot> {
        let mut torrents = self.torrents();
        torrents.sort_by_key(|torrent| torrent.info_hash());
        torrents.iter().map(|torrent| torrent.snapshot()).collect()
    }

    /// Opens a reader on a file from `from_byte` to the end of the file.
    ///
    /// # Errors
    ///
    /// - `StreamError::UnknownContent` - If the store does not know the info hash
    /// - `StreamError::UnknownFile` - If the selector matches no file
    /// - `StreamError::SeekOutOfRange` - If `from_byte` is past the end of the file
    pub fn open_reader(
        &self,
        info_hash: InfoHash,
        file: impl Into<FileSelector>,
        from_byte: u64,
    ) -> Result<Reader> {
        self.open_range(info_hash, file, from_byte..u64::MAX)
    }

    /// Opens a reader limited to a byte range of a file.
    ///
    /// If the torrent is shut down between lookup and registration, the
    /// open is retried once on a fresh entry.
    ///
    /// # Errors
    ///
    /// - `StreamError::UnknownContent` - If the store does not know the info hash
    /// - `StreamError::UnknownFile` - If the selector matches no file
    /// - `StreamError::SeekOutOfRange` - If the range starts past the end of the file
    pub fn open_range(
        &self,
        info_hash: InfoHash,
        file: impl Into<FileSelector>,
        range: Range<u64>,
    ) -> Result<Reader> {
        let file = file.into();
        let torrent = self.get_or_create(info_hash)?;
        match self.open_on(Arc::clone(&torrent), &file, &range) {
            Err(StreamError::StreamClosed) if torrent.is_shut_down() => {
                debug!("Torrent {} shut down while opening a reader, retrying", info_hash);
                self.open_on(self.get_or_create(info_hash)?, &file, &range)
            }
            result => result,
        }
    }

    fn open_on(
        &self,
        torrent: Arc<Torrent>,
        file: &FileSelector,
        range: &Range<u64>,
    ) -> Result<Reader> {
        let index = torrent.descriptor().resolve(file)?.index;
        Reader::open(
            torrent,
            index,
            range.start,
            range.end,
            self.config.reader.clone(),
        )
    }

    /// Registers an ordered group of files to be consumed as one stream.
    ///
    /// # Errors
    ///
    /// - `StreamError::UnknownContent` - If the store does not know the info hash
    /// - `StreamError::UnknownFile` - If any path is not in the file table
    pub fn register_fileset<S: AsRef<str>>(
        &self,
        info_hash: InfoHash,
        paths: &[S],
    ) -> Result<FilesetKey> {
        self.get_or_create(info_hash)?.add_fileset(paths)
    }

    /// Resolves once the first and last piece of a file are downloaded.
    ///
    /// Players read both ends of a file before playing it. Missing boundary
    /// pieces are pinned at critical priority for the duration of the wait.
    /// When both are already present, or the file is empty, this returns
    /// without touching any priority.
    ///
    /// # Errors
    ///
    /// - `StreamError::UnknownContent` - If the store does not know the info hash
    /// - `StreamError::UnknownFile` - If the selector matches no file
    /// - `StreamError::StreamClosed` - If the torrent shuts down during the wait
    /// - `StreamError::StallTimeout` - If a piece did not arrive within the retry limit
    pub async fn wait_for_boundary_pieces(
        &self,
        info_hash: InfoHash,
        file: impl Into<FileSelector>,
    ) -> Result<()> {
        let torrent = self.get_or_create(info_hash)?;
        let entry = torrent.descriptor().resolve(&file.into())?.clone();
        if entry.is_empty() {
            return Ok(());
        }

        let target = PinTarget {
            priority: Priority::Critical,
            deadline: self.config.scheduler.boundary_deadline,
        };
        let mut boundary = vec![(entry.first_piece, target)];
        if entry.last_piece != entry.first_piece {
            boundary.push((entry.last_piece, target));
        }
        self.wait_pinned(&torrent, &entry.path, boundary).await
    }

    /// Resolves once enough of a file is present to start playing it.
    ///
    /// The start buffer is the larger of `start_buffer_percent` of the
    /// file's pieces and `start_buffer_bytes`. Its pieces are pinned with
    /// the same graded priorities and deadlines as a read-ahead window,
    /// and the last two pieces of the file are pinned critical because
    /// container indexes often live there.
    ///
    /// # Errors
    ///
    /// - `StreamError::UnknownContent` - If the store does not know the info hash
    /// - `StreamError::UnknownFile` - If the selector matches no file
    /// - `StreamError::StreamClosed` - If the torrent shuts down during the wait
    /// - `StreamError::StallTimeout` - If a piece did not arrive within the retry limit
    pub async fn wait_for_start_buffer(
        &self,
        info_hash: InfoHash,
        file: impl Into<FileSelector>,
    ) -> Result<()> {
        let torrent = self.get_or_create(info_hash)?;
        let entry = torrent.descriptor().resolve(&file.into())?.clone();
        if entry.is_empty() {
            return Ok(());
        }

        let config = &self.config.scheduler;
        let buffer =
            config.start_buffer_pieces(entry.piece_count(), torrent.descriptor().piece_length());
        let mut targets: BTreeMap<PieceIndex, PinTarget> = entry
            .pieces()
            .take(buffer as usize)
            .zip(0u32..)
            .map(|(piece, distance)| {
                let (priority, deadline) = config.readahead_target(distance);
                (piece, PinTarget { priority, deadline })
            })
            .collect();

        let tail = PinTarget {
            priority: Priority::Critical,
            deadline: config.boundary_deadline,
        };
        for piece in entry.pieces().rev().take(2) {
            targets
                .entry(piece)
                .and_modify(|target| *target = target.merge(tail))
                .or_insert(tail);
        }
        self.wait_pinned(&torrent, &entry.path, targets.into_iter().collect())
            .await
    }

    /// Pins whichever of `targets` are missing and waits for all of them.
    async fn wait_pinned(
        &self,
        torrent: &Arc<Torrent>,
        path: &str,
        targets: Vec<(PieceIndex, PinTarget)>,
    ) -> Result<()> {
        let bitmap = self.store.piece_bitmap(torrent.info_hash())?;
        let missing: Vec<(PieceIndex, PinTarget)> = targets
            .into_iter()
            .filter(|(piece, _)| !bitmap.get(piece.as_usize()).copied().unwrap_or(false))
            .collect();
        if missing.is_empty() {
            debug!("Pieces of {} needed to start already present", path);
            return Ok(());
        }

        let pins = PinGuard::new(Arc::clone(torrent), &missing);
        debug!(
            "Waiting for pieces {:?} of {} in {}",
            pins.pieces,
            path,
            torrent.info_hash()
        );
        futures::future::try_join_all(
            pins.pieces
                .iter()
                .map(|piece| wait_until_complete(torrent, *piece, &self.config)),
        )
        .await?;
        Ok(())
    }

    /// Routes one store event to the torrent it concerns.
    pub fn handle_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::PieceCompleted { info_hash, piece } => {
                if let Some(torrent) = self.get(info_hash) {
                    torrent.on_piece_complete(piece);
                }
            }
            StoreEvent::TorrentRemoved { info_hash } => {
                if self.remove(info_hash) {
                    info!("Torrent {} removed from store, scheduler dropped", info_hash);
                }
            }
            StoreEvent::TorrentFinished { info_hash } => {
                if let Some(torrent) = self.get(info_hash) {
                    info!("Torrent {} finished downloading", info_hash);
                    torrent.cycle();
                }
            }
        }
    }

    fn spawn_event_pump(self: &Arc<Self>) {
        let mut events = self.store.subscribe();
        let registry: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                match event {
                    Ok(event) => registry.handle_event(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Store event stream lagged, {} events missed", missed);
                        for torrent in registry.torrents() {
                            torrent.cycle();
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *self.event_pump.lock() = Some(handle);
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(pump) = self.event_pump.get_mut().take() {
            pump.abort();
        }
        for torrent in self.torrents.get_mut().values() {
            torrent.shutdown();
        }
    }
}

/// Keeps pieces pinned until the wait ends or is cancelled.
struct PinGuard {
    torrent: Arc<Torrent>,
    pieces: Vec<PieceIndex>,
}

impl PinGuard {
    fn new(torrent: Arc<Torrent>, targets: &[(PieceIndex, PinTarget)]) -> Self {
        torrent.pin_targets(targets);
        let pieces = targets.iter().map(|(piece, _)| *piece).collect();
        Self { torrent, pieces }
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.torrent.unpin(&self.pieces);
    }
}

async fn wait_until_complete(
    torrent: &Torrent,
    piece: PieceIndex,
    config: &PiecemealConfig,
) -> Result<()> {
    let mut shutdown = torrent.subscribe_shutdown();
    let started = tokio::time::Instant::now();
    let mut attempts = 0u32;

    loop {
        let guard = torrent.waiters().register(piece);
        let notified = guard.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if *shutdown.borrow() {
            return Err(StreamError::StreamClosed);
        }
        if torrent.is_piece_complete(piece)? {
            return Ok(());
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(config.reader.poll_interval) => {
                attempts += 1;
                if config.reader.max_wait_retries.is_some_and(|max| attempts > max) {
                    return Err(StreamError::StallTimeout {
                        piece,
                        attempts,
                        waited: started.elapsed(),
                    });
                }
                torrent.cycle();
            }
        }
    }
}
