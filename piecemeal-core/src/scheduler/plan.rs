//! One scheduling cycle: snapshot in, priority writes out.
//!
//! `compute_plan` is pure. It reads the completion bitmap, the pieces peers
//! are fetching, the current priorities and everyone's interest, and returns
//! only the writes that differ from what the store already has. Running it
//! twice over unchanged state therefore yields an empty second plan.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use super::fileset::FilesetIntent;
use crate::config::SchedulerConfig;
use crate::torrent::{FileEntry, PieceIndex, Priority, TorrentDescriptor};

/// Byte range of a file one reader is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInterest {
    /// File-table index.
    pub file: usize,
    /// Current position within the file.
    pub from_byte: u64,
    /// Exclusive end of the interesting range.
    pub to_byte: u64,
}

/// Writes one cycle issues to the piece store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CyclePlan {
    /// Replacement file priority vector, when it changed.
    pub file_priorities: Option<Vec<Priority>>,
    pub pieces: BTreeMap<PieceIndex, Priority>,
    pub deadlines: BTreeMap<PieceIndex, Duration>,
}

impl CyclePlan {
    /// Whether the cycle has nothing to write.
    pub fn is_empty(&self) -> bool {
        self.file_priorities.is_none() && self.pieces.is_empty() && self.deadlines.is_empty()
    }

    /// Number of store calls applying this plan takes.
    pub fn write_count(&self) -> usize {
        usize::from(self.file_priorities.is_some()) + self.pieces.len() + self.deadlines.len()
    }

    /// Folds this plan's deadline writes into the set already applied.
    ///
    /// A piece rewritten without a deadline drops out of the set.
    pub fn record_deadlines(&self, applied: &mut BTreeMap<PieceIndex, Duration>) {
        for piece in self.pieces.keys() {
            if !self.deadlines.contains_key(piece) {
                applied.remove(piece);
            }
        }
        applied.extend(self.deadlines.iter().map(|(piece, deadline)| (*piece, *deadline)));
    }
}

/// Priority and deadline a pinned piece is held at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinTarget {
    pub priority: Priority,
    pub deadline: Duration,
}

impl PinTarget {
    /// The stronger of two targets: higher priority, shorter deadline.
    pub fn merge(self, other: Self) -> Self {
        Self {
            priority: self.priority.max(other.priority),
            deadline: self.deadline.min(other.deadline),
        }
    }
}

/// Everything a cycle looks at, captured at one point in time.
pub struct PlanInput<'a> {
    pub descriptor: &'a TorrentDescriptor,
    pub bitmap: &'a [bool],
    pub in_flight: &'a HashSet<PieceIndex>,
    pub current: &'a [Priority],
    /// Deadlines this torrent applied and has not since withdrawn.
    pub current_deadlines: &'a BTreeMap<PieceIndex, Duration>,
    /// File priorities this torrent applied last, if any.
    pub current_files: Option<&'a [Priority]>,
    pub readers: &'a [ReaderInterest],
    pub pinned: &'a BTreeMap<PieceIndex, PinTarget>,
    pub config: &'a SchedulerConfig,
}

/// Target priorities accumulated during a cycle.
///
/// Every write takes the maximum of what is already targeted, so interest
/// from several readers or files is a union and a demotion never beats a
/// raise issued for another head in the same cycle.
struct Targets<'a> {
    input: &'a PlanInput<'a>,
    pieces: BTreeMap<PieceIndex, Priority>,
    deadlines: BTreeMap<PieceIndex, Duration>,
}

impl<'a> Targets<'a> {
    fn new(input: &'a PlanInput<'a>) -> Self {
        Self {
            input,
            pieces: BTreeMap::new(),
            deadlines: BTreeMap::new(),
        }
    }

    fn is_complete(&self, piece: PieceIndex) -> bool {
        self.input
            .bitmap
            .get(piece.as_usize())
            .copied()
            .unwrap_or(false)
    }

    fn current(&self, piece: PieceIndex) -> Priority {
        self.input
            .current
            .get(piece.as_usize())
            .copied()
            .unwrap_or(Priority::Normal)
    }

    fn raise(&mut self, piece: PieceIndex, priority: Priority) {
        if self.is_complete(piece) {
            return;
        }
        let slot = self.pieces.entry(piece).or_insert(priority);
        *slot = (*slot).max(priority);
    }

    fn urgent(&mut self, piece: PieceIndex, deadline: Duration) {
        self.scheduled(piece, Priority::Critical, deadline);
    }

    fn scheduled(&mut self, piece: PieceIndex, priority: Priority, deadline: Duration) {
        if self.is_complete(piece) {
            return;
        }
        self.raise(piece, priority);
        let slot = self.deadlines.entry(piece).or_insert(deadline);
        *slot = (*slot).min(deadline);
    }

    /// Blackholes a piece unless it is complete or a peer is fetching it.
    fn demote(&mut self, piece: PieceIndex) {
        if self.input.in_flight.contains(&piece) {
            return;
        }
        self.raise(piece, Priority::Blackholed);
    }

    fn into_plan(self, file_priorities: Option<Vec<Priority>>) -> CyclePlan {
        let mut plan = CyclePlan {
            file_priorities,
            ..Default::default()
        };

        for (&piece, &target) in &self.pieces {
            if self.current(piece) != target {
                plan.pieces.insert(piece, target);
            }
        }
        // A priority write carries its deadline along even when unchanged.
        for (&piece, &deadline) in &self.deadlines {
            if plan.pieces.contains_key(&piece)
                || self.input.current_deadlines.get(&piece) != Some(&deadline)
            {
                plan.deadlines.insert(piece, deadline);
            }
        }
        plan
    }
}

/// Computes the writes for one cycle.
///
/// Un-started filesets in `filesets` are activated (their `started` flag is
/// set) as a side effect; the caller decides whether to keep that change
/// depending on whether the plan could be applied.
pub fn compute_plan(input: &PlanInput<'_>, filesets: &mut [FilesetIntent]) -> CyclePlan {
    let descriptor = input.descriptor;
    let files = descriptor.files();
    let mut targets = Targets::new(input);
    let mut heads: BTreeMap<usize, BTreeSet<PieceIndex>> = BTreeMap::new();

    for reader in input.readers {
        let Some(file) = files.get(reader.file) else {
            continue;
        };
        if file.is_complete(input.bitmap) {
            continue;
        }
        let position = reader.from_byte.min(file.size.saturating_sub(1));
        let (piece, _) = descriptor.locate(file, position);
        heads.entry(file.index).or_default().insert(piece);
        targets.urgent(piece, input.config.head_deadline);
    }

    for intent in filesets.iter_mut().filter(|intent| !intent.started) {
        intent.started = true;
        let first_open = intent
            .files
            .iter()
            .filter_map(|index| files.get(*index))
            .find(|file| !file.is_complete(input.bitmap));
        if let Some(file) = first_open {
            heads.entry(file.index).or_default().insert(file.first_piece);
            targets.urgent(file.first_piece, input.config.head_deadline);
        }
    }

    for (&piece, target) in input.pinned {
        targets.scheduled(piece, target.priority, target.deadline);
    }

    for (&file_index, file_heads) in &heads {
        sweep_file(&mut targets, &files[file_index], file_heads);
    }

    let file_priorities = plan_file_priorities(input, filesets, &mut targets);
    let file_priorities =
        file_priorities.filter(|planned| Some(planned.as_slice()) != input.current_files);
    targets.into_plan(file_priorities)
}

/// Blackholes behind the earliest head, keeps the span between heads and a
/// read-ahead window past each head, and blackholes the rest of the file.
///
/// The window past the last head is graded by distance: the nearest pieces
/// are critical, the rest elevated, each with a deadline that grows with
/// its distance.
fn sweep_file(targets: &mut Targets<'_>, file: &FileEntry, heads: &BTreeSet<PieceIndex>) {
    let (Some(&first_head), Some(&last_head)) = (heads.first(), heads.last()) else {
        return;
    };
    let config = targets.input.config;
    let window = config.window_pieces(targets.input.descriptor.piece_length());

    for index in file.first_piece.as_u32()..first_head.as_u32() {
        targets.demote(PieceIndex::new(index));
    }

    let mut budget = window;
    for index in first_head.as_u32() + 1..=file.last_piece.as_u32() {
        let piece = PieceIndex::new(index);
        if heads.contains(&piece) {
            budget = window;
            continue;
        }
        if targets.is_complete(piece) {
            continue;
        }

        if piece < last_head {
            targets.raise(piece, Priority::Normal);
        } else if budget > 0 {
            let (priority, deadline) = config.readahead_target(index - last_head.as_u32() - 1);
            targets.scheduled(piece, priority, deadline);
            budget -= 1;
        } else {
            targets.demote(piece);
        }
    }
}

/// Derives the whole file priority vector from current interest.
///
/// Returns `None` when nothing is being streamed and the torrent should be
/// left alone.
fn plan_file_priorities(
    input: &PlanInput<'_>,
    filesets: &[FilesetIntent],
    targets: &mut Targets<'_>,
) -> Option<Vec<Priority>> {
    let files = input.descriptor.files();

    let mut interested: HashSet<usize> = input
        .readers
        .iter()
        .filter(|reader| files.get(reader.file).is_some_and(|file| !file.is_empty()))
        .map(|reader| reader.file)
        .collect();
    for &piece in input.pinned.keys() {
        interested.extend(
            files
                .iter()
                .filter(|file| !file.is_empty())
                .filter(|file| file.first_piece <= piece && piece <= file.last_piece)
                .map(|file| file.index),
        );
    }

    if interested.is_empty() && filesets.is_empty() {
        if input.config.download_only_streamed {
            return None;
        }
        for (index, priority) in input.current.iter().enumerate() {
            if *priority == Priority::Blackholed {
                targets.raise(PieceIndex::new(index as u32), Priority::Background);
            }
        }
        return Some(vec![Priority::Background; files.len()]);
    }

    let protected: HashSet<usize> = filesets
        .iter()
        .flat_map(|intent| intent.files.iter().copied())
        .collect();
    let complete: Vec<bool> = files
        .iter()
        .map(|file| file.is_complete(input.bitmap))
        .collect();

    let mut priorities: Vec<Priority> = files
        .iter()
        .map(|file| {
            if complete[file.index] {
                Priority::Background
            } else if interested.contains(&file.index) {
                Priority::Critical
            } else if protected.contains(&file.index) {
                Priority::Background
            } else {
                Priority::Blackholed
            }
        })
        .collect();

    for intent in filesets {
        let focus = intent
            .files
            .iter()
            .position(|index| interested.contains(index))
            .or_else(|| intent.files.iter().position(|index| !complete[*index]));
        let Some(focus) = focus else {
            continue;
        };

        for (ordinal, &index) in intent.files.iter().enumerate() {
            if index >= priorities.len() || complete[index] {
                continue;
            }
            priorities[index] = if ordinal < focus {
                Priority::Blackholed
            } else if ordinal == focus || interested.contains(&index) {
                Priority::Critical
            } else {
                Priority::Background
            };
        }
    }

    Some(priorities)
}
