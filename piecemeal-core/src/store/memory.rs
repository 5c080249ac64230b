//! In-memory piece store for tests and simulation
//!
//! Keeps piece payloads, completion bitmaps and the native priority tables
//! in memory so scheduling decisions can be inspected directly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use tokio::sync::broadcast;

use super::{FileSpan, PieceStore, StoreError, StoreEvent, TorrentLayout};
use crate::torrent::{InfoHash, PieceIndex, Priority};

/// Native priority a fresh torrent starts with, per piece and per file.
const DEFAULT_NATIVE_PRIORITY: u8 = 4;

type WriteHook = Arc<dyn Fn(InfoHash) + Send + Sync>;

struct MemoryTorrent {
    layout: TorrentLayout,
    data: Bytes,
    have: Vec<bool>,
    in_flight: HashSet<PieceIndex>,
    piece_priorities: Vec<u8>,
    file_priorities: Vec<u8>,
    deadlines: HashMap<PieceIndex, Duration>,
    paused: bool,
    writes: u64,
}

/// In-memory piece store
///
/// Stores the full content of each torrent up front and only hands out
/// pieces that have been marked complete. Every priority write is counted
/// so tests can assert on redundant writes.
pub struct MemoryPieceStore {
    torrents: RwLock<HashMap<InfoHash, MemoryTorrent>>,
    events: broadcast::Sender<StoreEvent>,
    fail_writes: RwLock<bool>,
    write_hook: RwLock<Option<WriteHook>>,
}

impl MemoryPieceStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            torrents: RwLock::new(HashMap::new()),
            events,
            fail_writes: RwLock::new(false),
            write_hook: RwLock::new(None),
        }
    }

    /// Adds a torrent with generated content; nothing is downloaded yet.
    ///
    /// The info hash is the SHA-1 of the name, so the same name always maps
    /// to the same torrent.
    pub fn add_torrent(&self, name: &str, piece_length: u64, files: &[(&str, u64)]) -> InfoHash {
        let total: u64 = files.iter().map(|(_, size)| size).sum();
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        self.add_torrent_with_data(name, piece_length, files, Bytes::from(data))
    }

    /// Adds a torrent whose concatenated file content is `data`.
    pub fn add_torrent_with_data(
        &self,
        name: &str,
        piece_length: u64,
        files: &[(&str, u64)],
        data: Bytes,
    ) -> InfoHash {
        let digest = Sha1::digest(name.as_bytes());
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        let info_hash = InfoHash::new(hash);

        let piece_count = (data.len() as u64).div_ceil(piece_length) as u32;
        let layout = TorrentLayout {
            piece_length,
            piece_count,
            files: files
                .iter()
                .map(|(path, size)| FileSpan {
                    path: (*path).to_string(),
                    size: *size,
                })
                .collect(),
        };

        let torrent = MemoryTorrent {
            have: vec![false; piece_count as usize],
            in_flight: HashSet::new(),
            piece_priorities: vec![DEFAULT_NATIVE_PRIORITY; piece_count as usize],
            file_priorities: vec![DEFAULT_NATIVE_PRIORITY; files.len()],
            deadlines: HashMap::new(),
            paused: false,
            writes: 0,
            layout,
            data,
        };
        self.torrents.write().insert(info_hash, torrent);
        info_hash
    }

    /// Marks a piece downloaded and raises the completion event.
    pub fn complete_piece(&self, info_hash: InfoHash, piece: PieceIndex) {
        let finished = {
            let mut torrents = self.torrents.write();
            let Some(torrent) = torrents.get_mut(&info_hash) else {
                return;
            };
            let Some(slot) = torrent.have.get_mut(piece.as_usize()) else {
                return;
            };
            if *slot {
                return;
            }
            *slot = true;
            torrent.in_flight.remove(&piece);
            torrent.deadlines.remove(&piece);
            torrent.have.iter().all(|have| *have)
        };

        let _ = self
            .events
            .send(StoreEvent::PieceCompleted { info_hash, piece });
        if finished {
            let _ = self.events.send(StoreEvent::TorrentFinished { info_hash });
        }
    }

    /// Marks a piece complete without raising an event, as if the
    /// notification was lost.
    pub fn complete_piece_silently(&self, info_hash: InfoHash, piece: PieceIndex) {
        if let Some(torrent) = self.torrents.write().get_mut(&info_hash) {
            if let Some(slot) = torrent.have.get_mut(piece.as_usize()) {
                *slot = true;
            }
            torrent.in_flight.remove(&piece);
        }
    }

    /// Flags a piece as being downloaded by a peer.
    pub fn set_in_flight(&self, info_hash: InfoHash, piece: PieceIndex, in_flight: bool) {
        if let Some(torrent) = self.torrents.write().get_mut(&info_hash) {
            if in_flight {
                torrent.in_flight.insert(piece);
            } else {
                torrent.in_flight.remove(&piece);
            }
        }
    }

    /// Drops a torrent and raises the removal event.
    pub fn remove_torrent(&self, info_hash: InfoHash) {
        if self.torrents.write().remove(&info_hash).is_some() {
            let _ = self.events.send(StoreEvent::TorrentRemoved { info_hash });
        }
    }

    /// Pauses the torrent as a user would; `resume` undoes it.
    pub fn pause(&self, info_hash: InfoHash) {
        if let Some(torrent) = self.torrents.write().get_mut(&info_hash) {
            torrent.paused = true;
        }
    }

    /// Makes every subsequent write fail with a backend error.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.write() = fail;
    }

    /// Installs a callback invoked after every successful priority write.
    pub fn set_write_hook(&self, hook: impl Fn(InfoHash) + Send + Sync + 'static) {
        *self.write_hook.write() = Some(Arc::new(hook));
    }

    /// Current priority of one piece, `None` for unknown torrents.
    pub fn priority(&self, info_hash: InfoHash, piece: PieceIndex) -> Option<Priority> {
        let torrents = self.torrents.read();
        let native = *torrents.get(&info_hash)?.piece_priorities.get(piece.as_usize())?;
        Some(Priority::from_native(native))
    }

    /// Outstanding deadline of one piece, if any.
    pub fn deadline(&self, info_hash: InfoHash, piece: PieceIndex) -> Option<Duration> {
        self.torrents
            .read()
            .get(&info_hash)?
            .deadlines
            .get(&piece)
            .copied()
    }

    /// Current file priority vector, empty for unknown torrents.
    pub fn file_priorities(&self, info_hash: InfoHash) -> Vec<Priority> {
        self.torrents
            .read()
            .get(&info_hash)
            .map(|torrent| {
                torrent
                    .file_priorities
                    .iter()
                    .map(|native| Priority::from_native(*native))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of priority and deadline writes issued so far.
    pub fn write_count(&self, info_hash: InfoHash) -> u64 {
        self.torrents
            .read()
            .get(&info_hash)
            .map(|torrent| torrent.writes)
            .unwrap_or(0)
    }

    /// Full content of the torrent, for comparing against streamed bytes.
    pub fn contents(&self, info_hash: InfoHash) -> Option<Bytes> {
        self.torrents
            .read()
            .get(&info_hash)
            .map(|torrent| torrent.data.clone())
    }

    /// Incomplete pieces the engine would fetch, most urgent first.
    ///
    /// A piece is wanted when its own priority is nonzero and at least one
    /// file containing it is not skipped. Ties on priority are broken by the
    /// shorter deadline, then by piece index.
    pub fn wanted_pieces(&self, info_hash: InfoHash) -> Vec<(PieceIndex, Priority)> {
        let torrents = self.torrents.read();
        let Some(torrent) = torrents.get(&info_hash) else {
            return Vec::new();
        };
        if torrent.paused {
            return Vec::new();
        }

        let piece_length = torrent.layout.piece_length;
        let mut wanted_by_file = vec![false; torrent.have.len()];
        let mut offset = 0u64;
        for (span, native) in torrent.layout.files.iter().zip(&torrent.file_priorities) {
            if *native > 0 && span.size > 0 {
                let first = (offset / piece_length) as usize;
                let last = ((offset + span.size - 1) / piece_length) as usize;
                for slot in &mut wanted_by_file[first..=last] {
                    *slot = true;
                }
            }
            offset += span.size;
        }

        let mut wanted: Vec<(PieceIndex, Priority, Option<Duration>)> = torrent
            .have
            .iter()
            .enumerate()
            .filter(|(index, have)| {
                !**have && wanted_by_file[*index] && torrent.piece_priorities[*index] > 0
            })
            .map(|(index, _)| {
                let piece = PieceIndex::new(index as u32);
                (
                    piece,
                    Priority::from_native(torrent.piece_priorities[index]),
                    torrent.deadlines.get(&piece).copied(),
                )
            })
            .collect();

        wanted.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| match (a.2, b.2) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.0.cmp(&b.0))
        });
        wanted
            .into_iter()
            .map(|(piece, priority, _)| (piece, priority))
            .collect()
    }

    fn write<T>(
        &self,
        info_hash: InfoHash,
        apply: impl FnOnce(&mut MemoryTorrent) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if *self.fail_writes.read() {
            return Err(StoreError::Backend {
                reason: "simulated write failure".to_string(),
            });
        }

        let result = {
            let mut torrents = self.torrents.write();
            let torrent = torrents
                .get_mut(&info_hash)
                .ok_or(StoreError::UnknownTorrent { info_hash })?;
            let result = apply(torrent)?;
            torrent.writes += 1;
            result
        };

        let hook = self.write_hook.read().clone();
        if let Some(hook) = hook {
            hook(info_hash);
        }
        Ok(result)
    }

    fn read<T>(
        &self,
        info_hash: InfoHash,
        view: impl FnOnce(&MemoryTorrent) -> T,
    ) -> Result<T, StoreError> {
        self.torrents
            .read()
            .get(&info_hash)
            .map(view)
            .ok_or(StoreError::UnknownTorrent { info_hash })
    }
}

impl Default for MemoryPieceStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_piece(torrent: &MemoryTorrent, piece: PieceIndex) -> Result<(), StoreError> {
    if piece.as_u32() >= torrent.layout.piece_count {
        return Err(StoreError::PieceOutOfRange {
            piece,
            piece_count: torrent.layout.piece_count,
        });
    }
    Ok(())
}

#[async_trait]
impl PieceStore for MemoryPieceStore {
    fn layout(&self, info_hash: InfoHash) -> Result<TorrentLayout, StoreError> {
        self.read(info_hash, |torrent| torrent.layout.clone())
    }

    fn piece_bitmap(&self, info_hash: InfoHash) -> Result<Vec<bool>, StoreError> {
        self.read(info_hash, |torrent| torrent.have.clone())
    }

    fn piece_priorities(&self, info_hash: InfoHash) -> Result<Vec<Priority>, StoreError> {
        self.read(info_hash, |torrent| {
            torrent
                .piece_priorities
                .iter()
                .map(|native| Priority::from_native(*native))
                .collect()
        })
    }

    fn pieces_in_flight(&self, info_hash: InfoHash) -> Result<HashSet<PieceIndex>, StoreError> {
        self.read(info_hash, |torrent| torrent.in_flight.clone())
    }

    fn set_file_priorities(
        &self,
        info_hash: InfoHash,
        priorities: &[Priority],
    ) -> Result<(), StoreError> {
        self.write(info_hash, |torrent| {
            if priorities.len() != torrent.file_priorities.len() {
                return Err(StoreError::Backend {
                    reason: format!(
                        "expected {} file priorities, got {}",
                        torrent.file_priorities.len(),
                        priorities.len()
                    ),
                });
            }
            torrent.file_priorities = priorities.iter().map(|p| p.as_native()).collect();
            Ok(())
        })
    }

    fn set_piece_priority(
        &self,
        info_hash: InfoHash,
        piece: PieceIndex,
        priority: Priority,
    ) -> Result<(), StoreError> {
        self.write(info_hash, |torrent| {
            check_piece(torrent, piece)?;
            torrent.piece_priorities[piece.as_usize()] = priority.as_native();
            Ok(())
        })
    }

    fn set_piece_deadline(
        &self,
        info_hash: InfoHash,
        piece: PieceIndex,
        deadline: Duration,
    ) -> Result<(), StoreError> {
        self.write(info_hash, |torrent| {
            check_piece(torrent, piece)?;
            torrent.deadlines.insert(piece, deadline);
            Ok(())
        })
    }

    fn reset_piece_deadlines(&self, info_hash: InfoHash) -> Result<(), StoreError> {
        self.write(info_hash, |torrent| {
            torrent.deadlines.clear();
            Ok(())
        })
    }

    async fn read_piece(
        &self,
        info_hash: InfoHash,
        piece: PieceIndex,
    ) -> Result<Bytes, StoreError> {
        let torrents = self.torrents.read();
        let torrent = torrents
            .get(&info_hash)
            .ok_or(StoreError::UnknownTorrent { info_hash })?;
        check_piece(torrent, piece)?;
        if !torrent.have[piece.as_usize()] {
            return Err(StoreError::PieceUnavailable { piece });
        }

        let start = piece.as_usize() * torrent.layout.piece_length as usize;
        let end = (start + torrent.layout.piece_length as usize).min(torrent.data.len());
        Ok(torrent.data.slice(start..end))
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn is_paused(&self, info_hash: InfoHash) -> bool {
        self.torrents
            .read()
            .get(&info_hash)
            .map(|torrent| torrent.paused)
            .unwrap_or(false)
    }

    fn resume(&self, info_hash: InfoHash) -> Result<(), StoreError> {
        let mut torrents = self.torrents.write();
        let torrent = torrents
            .get_mut(&info_hash)
            .ok_or(StoreError::UnknownTorrent { info_hash })?;
        torrent.paused = false;
        Ok(())
    }
}
