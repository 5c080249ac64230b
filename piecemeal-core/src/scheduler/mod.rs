//! Per-torrent cycle engine.
//!
//! A `Torrent` owns the scheduling intent for one torrent: which readers are
//! where, which filesets are being consumed and which boundary pieces are
//! pinned. Every cycle snapshots that intent together with the store's
//! state, computes a plan and applies it as one batch. Cycles for the same
//! torrent never overlap; a request arriving mid-cycle is coalesced into one
//! follow-up pass.

pub mod fileset;
mod lifecycle;
mod pins;
pub mod plan;
pub mod snapshot;
pub mod waiters;

#[cfg(test)]
mod plan_tests;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use fileset::{FilesetIntent, FilesetKey};
use parking_lot::Mutex;
pub use plan::{CyclePlan, PinTarget, PlanInput, ReaderInterest, compute_plan};
pub use snapshot::{FileSnapshot, TorrentSnapshot, TorrentState};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
pub use waiters::{PieceWaiters, WaitGuard};

use crate::config::SchedulerConfig;
use crate::error::{Result, StreamError};
use crate::store::{PieceStore, StoreError};
use crate::torrent::{InfoHash, PieceIndex, Priority, TorrentDescriptor};

/// Identifies one reader within its torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReaderId(u64);

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reader-{}", self.0)
    }
}

/// Handed to a reader when it registers.
pub struct ReaderRegistration {
    pub id: ReaderId,
    /// Flips to `true` (or closes) when the reader is removed.
    pub closed: watch::Receiver<bool>,
}

struct ReaderSlot {
    interest: ReaderInterest,
    last_activity: Instant,
    close: watch::Sender<bool>,
}

struct TorrentInner {
    state: TorrentState,
    readers: HashMap<ReaderId, ReaderSlot>,
    filesets: BTreeMap<FilesetKey, FilesetIntent>,
    /// Pin reference count and the strongest target asked for.
    pins: BTreeMap<PieceIndex, (usize, PinTarget)>,
    applied_files: Option<Vec<Priority>>,
    applied_deadlines: BTreeMap<PieceIndex, Duration>,
    last_activity: Instant,
    next_reader: u64,
    cycles: u64,
    failed_cycles: u64,
}

#[derive(Default)]
struct CycleGate {
    running: bool,
    pending: bool,
}

/// Scheduling intent captured under the lock for one cycle.
struct CycleInput {
    readers: Vec<ReaderInterest>,
    filesets: Vec<(FilesetKey, FilesetIntent)>,
    pinned: BTreeMap<PieceIndex, PinTarget>,
    applied_files: Option<Vec<Priority>>,
    applied_deadlines: BTreeMap<PieceIndex, Duration>,
}

/// Runtime scheduling state for one streamed torrent.
pub struct Torrent {
    descriptor: TorrentDescriptor,
    store: Arc<dyn PieceStore>,
    config: SchedulerConfig,
    inner: Mutex<TorrentInner>,
    gate: Mutex<CycleGate>,
    waiters: Arc<PieceWaiters>,
    shutdown: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Torrent {
    /// Creates the scheduling state for one torrent.
    ///
    /// No cycle runs until a reader, fileset or pin is added, or the ticker
    /// is started.
    pub fn new(
        descriptor: TorrentDescriptor,
        store: Arc<dyn PieceStore>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            descriptor,
            store,
            config,
            inner: Mutex::new(TorrentInner {
                state: TorrentState::Initializing,
                readers: HashMap::new(),
                filesets: BTreeMap::new(),
                pins: BTreeMap::new(),
                applied_files: None,
                applied_deadlines: BTreeMap::new(),
                last_activity: Instant::now(),
                next_reader: 0,
                cycles: 0,
                failed_cycles: 0,
            }),
            gate: Mutex::new(CycleGate::default()),
            waiters: Arc::new(PieceWaiters::new()),
            shutdown,
            ticker: Mutex::new(None),
        })
    }

    /// Piece geometry and file table.
    pub fn descriptor(&self) -> &TorrentDescriptor {
        &self.descriptor
    }

    /// Content id of the torrent.
    pub fn info_hash(&self) -> InfoHash {
        self.descriptor.info_hash()
    }

    /// Store this torrent issues priority writes to.
    pub fn store(&self) -> &Arc<dyn PieceStore> {
        &self.store
    }

    /// Per-piece wait registrations of blocked reads.
    pub fn waiters(&self) -> &Arc<PieceWaiters> {
        &self.waiters
    }

    /// Scheduler tunables in effect.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Receiver that flips to `true` once the torrent shuts down.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TorrentState {
        self.inner.lock().state
    }

    /// Whether `shutdown` has run.
    pub fn is_shut_down(&self) -> bool {
        self.state().is_terminal()
    }

    /// Last time a reader was added, moved or removed.
    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    /// Number of open readers.
    pub fn reader_count(&self) -> usize {
        self.inner.lock().readers.len()
    }

    /// Number of registered filesets.
    pub fn fileset_count(&self) -> usize {
        self.inner.lock().filesets.len()
    }

    /// Registers a reader and runs a cycle for it.
    ///
    /// # Errors
    ///
    /// - `StreamError::StreamClosed` - If the torrent has shut down
    pub fn add_reader(
        &self,
        file: usize,
        from_byte: u64,
        to_byte: u64,
    ) -> Result<ReaderRegistration> {
        let registration = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return Err(StreamError::StreamClosed);
            }

            let id = ReaderId(inner.next_reader);
            inner.next_reader += 1;
            let now = Instant::now();
            let (close, closed) = watch::channel(false);
            inner.readers.insert(
                id,
                ReaderSlot {
                    interest: ReaderInterest {
                        file,
                        from_byte,
                        to_byte,
                    },
                    last_activity: now,
                    close,
                },
            );
            inner.last_activity = now;
            inner.state = TorrentState::Streaming;
            ReaderRegistration { id, closed }
        };

        info!(
            "Reader {} opened file #{} of {} at byte {}",
            registration.id,
            file,
            self.info_hash(),
            from_byte
        );
        self.cycle();
        Ok(registration)
    }

    /// Moves a reader's position. Returns false if it is no longer registered.
    pub fn update_reader(&self, id: ReaderId, from_byte: u64) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let Some(slot) = inner.readers.get_mut(&id) else {
            return false;
        };
        slot.interest.from_byte = from_byte;
        slot.last_activity = now;
        inner.last_activity = now;
        true
    }

    /// Unregisters a reader, wakes its pending read and re-plans.
    ///
    /// The torrent goes idle with its last reader unless a fileset still
    /// holds interest in it.
    pub fn remove_reader(&self, id: ReaderId) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let Some(slot) = inner.readers.remove(&id) else {
                return false;
            };
            let _ = slot.close.send(true);
            inner.last_activity = Instant::now();
            if inner.readers.is_empty()
                && inner.filesets.is_empty()
                && inner.state == TorrentState::Streaming
            {
                inner.state = TorrentState::Idle;
            }
            slot
        };

        info!(
            "Reader {} closed file #{} of {}",
            id,
            removed.interest.file,
            self.info_hash()
        );
        self.cycle();
        true
    }

    /// Registers an ordered group of files to be consumed as one stream.
    ///
    /// Registering the same path sequence twice is a no-op.
    ///
    /// # Errors
    ///
    /// - `StreamError::UnknownFile` - If any path is not in the file table
    /// - `StreamError::StreamClosed` - If the torrent has shut down
    pub fn add_fileset<S: AsRef<str>>(&self, paths: &[S]) -> Result<FilesetKey> {
        let files = paths
            .iter()
            .map(|path| {
                self.descriptor
                    .resolve(&path.as_ref().into())
                    .map(|file| file.index)
            })
            .collect::<Result<Vec<_>>>()?;
        let key = FilesetKey::from_paths(paths);

        let added = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return Err(StreamError::StreamClosed);
            }
            if inner.filesets.contains_key(&key) {
                false
            } else {
                inner
                    .filesets
                    .insert(key.clone(), FilesetIntent::new(files));
                inner.last_activity = Instant::now();
                inner.state = TorrentState::Streaming;
                true
            }
        };

        if added {
            info!(
                "Fileset {} of {} files registered on {}",
                key,
                paths.len(),
                self.info_hash()
            );
            self.cycle();
        }
        Ok(key)
    }

    /// Reacts to the store reporting a piece complete.
    pub fn on_piece_complete(&self, piece: PieceIndex) {
        let woken = self.waiters.wake(piece);
        if woken > 0 {
            debug!("Piece {} of {} woke {} readers", piece, self.info_hash(), woken);
        }
        self.cycle();
    }

    /// Runs one scheduling cycle, or coalesces into the one already running.
    pub fn cycle(&self) {
        {
            let mut gate = self.gate.lock();
            if gate.running {
                gate.pending = true;
                return;
            }
            gate.running = true;
        }

        loop {
            self.run_cycle();

            let mut gate = self.gate.lock();
            if gate.pending {
                gate.pending = false;
                continue;
            }
            gate.running = false;
            break;
        }
    }

    fn run_cycle(&self) {
        let Some(input) = self.capture() else {
            return;
        };
        let mut filesets: Vec<FilesetIntent> =
            input.filesets.iter().map(|(_, intent)| intent.clone()).collect();

        match self.plan_and_apply(&input, &mut filesets) {
            Ok(plan) => {
                let mut inner = self.inner.lock();
                inner.cycles += 1;
                for ((key, _), intent) in input.filesets.iter().zip(&filesets) {
                    if let Some(tracked) = inner.filesets.get_mut(key) {
                        tracked.started |= intent.started;
                    }
                }
                plan.record_deadlines(&mut inner.applied_deadlines);
                if let Some(files) = plan.file_priorities {
                    inner.applied_files = Some(files);
                }
                if inner.state == TorrentState::Initializing {
                    inner.state = if inner.readers.is_empty() && inner.filesets.is_empty() {
                        TorrentState::Idle
                    } else {
                        TorrentState::Streaming
                    };
                }
            }
            Err(e) => {
                self.inner.lock().failed_cycles += 1;
                warn!("Scheduling cycle for {} abandoned: {}", self.info_hash(), e);
            }
        }
    }

    fn capture(&self) -> Option<CycleInput> {
        let inner = self.inner.lock();
        if inner.state.is_terminal() {
            return None;
        }
        Some(CycleInput {
            readers: inner.readers.values().map(|slot| slot.interest).collect(),
            filesets: inner
                .filesets
                .iter()
                .map(|(key, intent)| (key.clone(), intent.clone()))
                .collect(),
            pinned: inner
                .pins
                .iter()
                .map(|(piece, (_, target))| (*piece, *target))
                .collect(),
            applied_files: inner.applied_files.clone(),
            applied_deadlines: inner.applied_deadlines.clone(),
        })
    }

    fn plan_and_apply(
        &self,
        input: &CycleInput,
        filesets: &mut [FilesetIntent],
    ) -> std::result::Result<CyclePlan, StoreError> {
        let info_hash = self.info_hash();
        let bitmap = self.store.piece_bitmap(info_hash)?;
        let in_flight = self.store.pieces_in_flight(info_hash)?;
        let current = self.store.piece_priorities(info_hash)?;

        // Catch completions whose events never arrived.
        for piece in self.waiters.waiting_pieces() {
            if bitmap.get(piece.as_usize()).copied().unwrap_or(false) {
                self.waiters.wake(piece);
            }
        }

        let plan_input = PlanInput {
            descriptor: &self.descriptor,
            bitmap: &bitmap,
            in_flight: &in_flight,
            current: &current,
            current_deadlines: &input.applied_deadlines,
            current_files: input.applied_files.as_deref(),
            readers: &input.readers,
            pinned: &input.pinned,
            config: &self.config,
        };
        let plan = compute_plan(&plan_input, filesets);

        if !plan.is_empty() && !self.is_shut_down() {
            self.store.apply_plan(info_hash, &plan)?;
            debug!(
                "Applied cycle to {}: {} piece writes, {} deadlines, files {}",
                info_hash,
                plan.pieces.len(),
                plan.deadlines.len(),
                if plan.file_priorities.is_some() { "updated" } else { "unchanged" }
            );
        }
        Ok(plan)
    }
}
