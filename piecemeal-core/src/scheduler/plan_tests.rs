//! Cycle planning scenarios over a fixed torrent snapshot.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use proptest::prelude::*;

use super::fileset::FilesetIntent;
use super::plan::{CyclePlan, PinTarget, PlanInput, ReaderInterest, compute_plan};
use crate::config::SchedulerConfig;
use crate::store::{FileSpan, TorrentLayout};
use crate::torrent::{InfoHash, PieceIndex, Priority, TorrentDescriptor};

const PIECE: u64 = 1_000_000;

struct Snapshot {
    descriptor: TorrentDescriptor,
    bitmap: Vec<bool>,
    in_flight: HashSet<PieceIndex>,
    current: Vec<Priority>,
    current_deadlines: BTreeMap<PieceIndex, Duration>,
    current_files: Option<Vec<Priority>>,
    readers: Vec<ReaderInterest>,
    pinned: BTreeMap<PieceIndex, PinTarget>,
    config: SchedulerConfig,
}

impl Snapshot {
    fn new(piece_length: u64, sizes: &[u64]) -> Self {
        let total: u64 = sizes.iter().sum();
        let layout = TorrentLayout {
            piece_length,
            piece_count: total.div_ceil(piece_length) as u32,
            files: sizes
                .iter()
                .enumerate()
                .map(|(i, size)| FileSpan {
                    path: format!("file{i}"),
                    size: *size,
                })
                .collect(),
        };
        let descriptor = TorrentDescriptor::from_layout(InfoHash::new([1; 20]), &layout).unwrap();
        let pieces = descriptor.piece_count() as usize;

        Self {
            descriptor,
            bitmap: vec![false; pieces],
            in_flight: HashSet::new(),
            current: vec![Priority::Normal; pieces],
            current_deadlines: BTreeMap::new(),
            current_files: None,
            readers: Vec::new(),
            pinned: BTreeMap::new(),
            config: SchedulerConfig {
                readahead_pieces: 4,
                readahead_bytes: 0,
                readahead_critical_pieces: 2,
                ..Default::default()
            },
        }
    }

    fn reader(&mut self, file: usize, from_byte: u64) {
        let to_byte = self.descriptor.files()[file].size;
        self.readers.push(ReaderInterest {
            file,
            from_byte,
            to_byte,
        });
    }

    fn pin(&mut self, piece: u32, priority: Priority, deadline_ms: u64) {
        let deadline = millis(deadline_ms);
        self.pinned
            .insert(PieceIndex::new(piece), PinTarget { priority, deadline });
    }

    fn plan(&self, filesets: &mut [FilesetIntent]) -> CyclePlan {
        let input = PlanInput {
            descriptor: &self.descriptor,
            bitmap: &self.bitmap,
            in_flight: &self.in_flight,
            current: &self.current,
            current_deadlines: &self.current_deadlines,
            current_files: self.current_files.as_deref(),
            readers: &self.readers,
            pinned: &self.pinned,
            config: &self.config,
        };
        compute_plan(&input, filesets)
    }

    /// Writes a plan back into the snapshot the way a store would.
    fn apply(&mut self, plan: &CyclePlan) {
        for (piece, priority) in &plan.pieces {
            self.current[piece.as_usize()] = *priority;
        }
        plan.record_deadlines(&mut self.current_deadlines);
        if let Some(files) = &plan.file_priorities {
            self.current_files = Some(files.clone());
        }
    }
}

fn pieces(indices: &[(u32, Priority)]) -> Vec<(PieceIndex, Priority)> {
    indices
        .iter()
        .map(|(index, priority)| (PieceIndex::new(*index), *priority))
        .collect()
}

fn planned(plan: &CyclePlan) -> Vec<(PieceIndex, Priority)> {
    plan.pieces.iter().map(|(p, pr)| (*p, *pr)).collect()
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[test]
fn test_reader_at_start_gets_critical_head_and_window() {
    let mut snapshot = Snapshot::new(PIECE, &[10 * PIECE]);
    snapshot.reader(0, 0);

    let plan = snapshot.plan(&mut []);

    assert_eq!(
        planned(&plan),
        pieces(&[
            (0, Priority::Critical),
            (1, Priority::Critical),
            (2, Priority::Critical),
            (3, Priority::Elevated),
            (4, Priority::Elevated),
            (5, Priority::Blackholed),
            (6, Priority::Blackholed),
            (7, Priority::Blackholed),
            (8, Priority::Blackholed),
            (9, Priority::Blackholed),
        ])
    );
    assert_eq!(
        plan.deadlines.values().copied().collect::<Vec<_>>(),
        vec![Duration::ZERO, millis(700), millis(1_400), millis(2_100), millis(2_800)]
    );
    assert_eq!(plan.file_priorities, Some(vec![Priority::Critical]));
}

#[test]
fn test_two_readers_keep_span_between_heads() {
    let mut snapshot = Snapshot::new(PIECE, &[10 * PIECE]);
    snapshot.current = vec![Priority::Blackholed; 10];
    snapshot.reader(0, 0);
    snapshot.reader(0, 5_000_000);

    let plan = snapshot.plan(&mut []);

    assert_eq!(plan.pieces.get(&PieceIndex::new(0)), Some(&Priority::Critical));
    assert_eq!(plan.pieces.get(&PieceIndex::new(5)), Some(&Priority::Critical));
    for index in 1..5 {
        assert_eq!(
            plan.pieces.get(&PieceIndex::new(index)),
            Some(&Priority::Normal),
            "piece {index}"
        );
        assert!(!plan.deadlines.contains_key(&PieceIndex::new(index)));
    }
    assert_eq!(
        &planned(&plan)[6..],
        &pieces(&[
            (6, Priority::Critical),
            (7, Priority::Critical),
            (8, Priority::Elevated),
            (9, Priority::Elevated),
        ])[..]
    );
    assert_eq!(plan.deadlines.len(), 6);
}

#[test]
fn test_in_flight_pieces_are_never_blackholed() {
    let mut snapshot = Snapshot::new(PIECE, &[10 * PIECE]);
    snapshot.config.readahead_pieces = 2;
    snapshot.in_flight = [PieceIndex::new(2), PieceIndex::new(9)].into_iter().collect();
    snapshot.reader(0, 5_000_000);

    let plan = snapshot.plan(&mut []);

    assert_eq!(
        planned(&plan),
        pieces(&[
            (0, Priority::Blackholed),
            (1, Priority::Blackholed),
            (3, Priority::Blackholed),
            (4, Priority::Blackholed),
            (5, Priority::Critical),
            (6, Priority::Critical),
            (7, Priority::Critical),
            (8, Priority::Blackholed),
        ])
    );
}

#[test]
fn test_window_skips_complete_pieces() {
    let mut snapshot = Snapshot::new(PIECE, &[10 * PIECE]);
    snapshot.current = vec![Priority::Blackholed; 10];
    snapshot.config.readahead_pieces = 2;
    snapshot.bitmap[3] = true;
    snapshot.bitmap[4] = true;
    snapshot.reader(0, 2 * PIECE + 10);

    let plan = snapshot.plan(&mut []);

    assert_eq!(
        planned(&plan),
        pieces(&[
            (2, Priority::Critical),
            (5, Priority::Elevated),
            (6, Priority::Elevated),
        ])
    );
    // Distance counts from the head, complete pieces included.
    assert_eq!(plan.deadlines.get(&PieceIndex::new(5)), Some(&millis(2_100)));
}

#[test]
fn test_second_cycle_is_empty() {
    let mut snapshot = Snapshot::new(PIECE, &[6 * PIECE, 4 * PIECE]);
    snapshot.reader(0, 0);
    snapshot.reader(1, PIECE);

    let first = snapshot.plan(&mut []);
    assert!(!first.is_empty());
    snapshot.apply(&first);

    let second = snapshot.plan(&mut []);
    assert!(second.is_empty(), "unexpected writes: {second:?}");
    assert_eq!(second.write_count(), 0);
}

#[test]
fn test_complete_file_is_left_alone() {
    let mut snapshot = Snapshot::new(100, &[200, 200]);
    snapshot.bitmap[0] = true;
    snapshot.bitmap[1] = true;
    snapshot.reader(0, 50);

    let plan = snapshot.plan(&mut []);

    assert!(plan.pieces.is_empty());
    assert!(plan.deadlines.is_empty());
    assert_eq!(
        plan.file_priorities,
        Some(vec![Priority::Background, Priority::Blackholed])
    );
}

#[test]
fn test_pinned_boundary_piece_outside_window() {
    let mut snapshot = Snapshot::new(PIECE, &[10 * PIECE]);
    snapshot.reader(0, 0);
    snapshot.pin(9, Priority::Critical, 700);

    let plan = snapshot.plan(&mut []);

    assert_eq!(plan.pieces.get(&PieceIndex::new(9)), Some(&Priority::Critical));
    assert_eq!(
        plan.deadlines.get(&PieceIndex::new(9)),
        Some(&Duration::from_millis(700))
    );
    assert_eq!(plan.pieces.get(&PieceIndex::new(8)), Some(&Priority::Blackholed));
}

#[test]
fn test_fileset_activation_runs_once() {
    let mut snapshot = Snapshot::new(100, &[100, 100, 100, 100]);
    let mut filesets = vec![FilesetIntent::new(vec![1, 2, 3])];

    let first = snapshot.plan(&mut filesets);

    assert!(filesets[0].started);
    assert_eq!(planned(&first), pieces(&[(1, Priority::Critical)]));
    assert_eq!(first.deadlines.get(&PieceIndex::new(1)), Some(&Duration::ZERO));
    assert_eq!(
        first.file_priorities,
        Some(vec![
            Priority::Blackholed,
            Priority::Critical,
            Priority::Background,
            Priority::Background,
        ])
    );

    snapshot.apply(&first);
    assert!(snapshot.plan(&mut filesets).is_empty());
}

#[test]
fn test_fileset_follows_reader_focus() {
    let mut snapshot = Snapshot::new(100, &[100, 100, 100, 100]);
    let mut filesets = vec![FilesetIntent {
        started: true,
        files: vec![1, 2, 3],
    }];
    snapshot.reader(2, 0);

    let plan = snapshot.plan(&mut filesets);
    assert_eq!(
        plan.file_priorities,
        Some(vec![
            Priority::Blackholed,
            Priority::Blackholed,
            Priority::Critical,
            Priority::Background,
        ])
    );

    snapshot.reader(3, 0);
    let plan = snapshot.plan(&mut filesets);
    assert_eq!(
        plan.file_priorities,
        Some(vec![
            Priority::Blackholed,
            Priority::Blackholed,
            Priority::Critical,
            Priority::Critical,
        ])
    );
}

#[test]
fn test_fileset_skips_complete_files() {
    let mut snapshot = Snapshot::new(100, &[100, 100, 100]);
    snapshot.bitmap[0] = true;
    let mut filesets = vec![FilesetIntent::new(vec![0, 1, 2])];

    let plan = snapshot.plan(&mut filesets);

    assert_eq!(planned(&plan), pieces(&[(1, Priority::Critical)]));
    assert_eq!(
        plan.file_priorities,
        Some(vec![Priority::Background, Priority::Critical, Priority::Background])
    );
}

#[test]
fn test_idle_torrent_downloads_everything() {
    let mut snapshot = Snapshot::new(100, &[200, 200]);
    snapshot.current = vec![
        Priority::Blackholed,
        Priority::Normal,
        Priority::Blackholed,
        Priority::Critical,
    ];
    snapshot.bitmap[2] = true;

    let plan = snapshot.plan(&mut []);

    assert_eq!(planned(&plan), pieces(&[(0, Priority::Background)]));
    assert_eq!(
        plan.file_priorities,
        Some(vec![Priority::Background, Priority::Background])
    );
}

#[test]
fn test_idle_torrent_untouched_when_only_streaming() {
    let mut snapshot = Snapshot::new(100, &[200, 200]);
    snapshot.config.download_only_streamed = true;
    snapshot.current = vec![Priority::Blackholed; 4];

    assert!(snapshot.plan(&mut []).is_empty());
}

#[test]
fn test_unchanged_file_vector_is_not_rewritten() {
    let mut snapshot = Snapshot::new(PIECE, &[4 * PIECE]);
    snapshot.current_files = Some(vec![Priority::Critical]);
    snapshot.current = vec![
        Priority::Critical,
        Priority::Critical,
        Priority::Critical,
        Priority::Elevated,
    ];
    snapshot.current_deadlines = [(0, 0), (1, 700), (2, 1_400), (3, 2_100)]
        .into_iter()
        .map(|(piece, ms)| (PieceIndex::new(piece), millis(ms)))
        .collect();
    snapshot.reader(0, 0);

    let plan = snapshot.plan(&mut []);

    assert!(plan.is_empty());
}

#[test]
fn test_moved_head_rewrites_shifted_deadlines_only() {
    let mut snapshot = Snapshot::new(PIECE, &[10 * PIECE]);
    snapshot.reader(0, 0);
    let first = snapshot.plan(&mut []);
    snapshot.apply(&first);

    snapshot.bitmap[0] = true;
    snapshot.readers[0].from_byte = PIECE;
    let second = snapshot.plan(&mut []);

    // Piece 1 becomes the head and 2 moves up, neither changes priority.
    assert_eq!(
        planned(&second),
        pieces(&[(3, Priority::Critical), (5, Priority::Elevated)])
    );
    assert_eq!(second.deadlines.get(&PieceIndex::new(1)), Some(&Duration::ZERO));
    assert_eq!(second.deadlines.get(&PieceIndex::new(2)), Some(&millis(700)));
    assert_eq!(second.deadlines.get(&PieceIndex::new(4)), Some(&millis(2_100)));
    assert!(!second.deadlines.contains_key(&PieceIndex::new(0)));
}

#[test]
fn test_pin_target_keeps_its_own_priority() {
    let mut snapshot = Snapshot::new(PIECE, &[10 * PIECE]);
    snapshot.current = vec![Priority::Blackholed; 10];
    snapshot.pin(6, Priority::Elevated, 4_200);

    let plan = snapshot.plan(&mut []);

    assert_eq!(planned(&plan), pieces(&[(6, Priority::Elevated)]));
    assert_eq!(plan.deadlines.get(&PieceIndex::new(6)), Some(&millis(4_200)));
    assert_eq!(plan.file_priorities, Some(vec![Priority::Critical]));
}

#[test]
fn test_trailing_empty_file_never_gets_a_head() {
    let mut snapshot = Snapshot::new(100, &[400, 0]);
    snapshot.reader(1, 0);
    snapshot.reader(0, 200);

    let plan = snapshot.plan(&mut []);

    let count = snapshot.descriptor.piece_count();
    assert!(plan.pieces.keys().all(|piece| piece.as_u32() < count));
    assert!(plan.deadlines.keys().all(|piece| piece.as_u32() < count));
    assert_eq!(plan.pieces.get(&PieceIndex::new(2)), Some(&Priority::Critical));
    assert_eq!(
        plan.file_priorities,
        Some(vec![Priority::Critical, Priority::Background])
    );
}

fn priority_strategy() -> impl Strategy<Value = Priority> {
    (0u8..8).prop_map(Priority::from_native)
}

proptest! {
    #[test]
    fn prop_cycles_respect_in_flight_and_settle(
        sizes in proptest::collection::vec(0u64..600, 1..5),
        bitmap_seed in proptest::collection::vec(any::<bool>(), 64),
        flight_seed in proptest::collection::vec(any::<bool>(), 64),
        current_seed in proptest::collection::vec(priority_strategy(), 64),
        reader_seeds in proptest::collection::vec((any::<usize>(), any::<u64>()), 0..4),
        readahead in 0u32..6,
        critical in 0u32..4,
    ) {
        prop_assume!(sizes.iter().sum::<u64>() > 0);
        let mut snapshot = Snapshot::new(100, &sizes);
        let count = snapshot.descriptor.piece_count() as usize;
        snapshot.config.readahead_pieces = readahead;
        snapshot.config.readahead_critical_pieces = critical;
        snapshot.bitmap = bitmap_seed[..count].to_vec();
        snapshot.current = current_seed[..count].to_vec();
        snapshot.in_flight = flight_seed[..count]
            .iter()
            .enumerate()
            .filter(|(index, flag)| **flag && !snapshot.bitmap[*index])
            .map(|(index, _)| PieceIndex::new(index as u32))
            .collect();
        for (file_seed, byte_seed) in reader_seeds {
            let file = file_seed % sizes.len();
            snapshot.reader(file, byte_seed % sizes[file].max(1));
        }

        let first = snapshot.plan(&mut []);
        for piece in first.pieces.keys().chain(first.deadlines.keys()) {
            prop_assert!((piece.as_u32()) < count as u32, "piece {} out of range", piece);
        }
        for (piece, priority) in &first.pieces {
            prop_assert!(!snapshot.bitmap[piece.as_usize()], "complete piece {} written", piece);
            if snapshot.in_flight.contains(piece) {
                prop_assert_ne!(*priority, Priority::Blackholed);
            }
        }

        snapshot.apply(&first);
        let second = snapshot.plan(&mut []);
        prop_assert!(second.is_empty(), "second cycle wrote {:?}", second);
    }
}
