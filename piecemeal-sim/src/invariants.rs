//! Invariant checking against simulated store state.

use std::fmt;

use piecemeal_core::store::MemoryPieceStore;
use piecemeal_core::{InfoHash, PieceStore, Priority};

/// Violation of a scheduling invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: String,
    /// Detailed description of the violation
    pub description: String,
    /// Swarm tick after which the violation was observed
    pub tick: u64,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invariant '{}' violated at tick {}: {}",
            self.invariant, self.tick, self.description
        )
    }
}

impl std::error::Error for InvariantViolation {}

/// A property of store state that must hold between ticks.
pub trait Invariant: Send + Sync {
    /// Checks the invariant for one torrent.
    ///
    /// # Errors
    /// Returns `InvariantViolation` if the invariant condition is not met.
    fn check(
        &self,
        store: &MemoryPieceStore,
        info_hash: InfoHash,
        tick: u64,
    ) -> Result<(), InvariantViolation>;

    /// Returns name of this invariant.
    fn name(&self) -> &str;
}

/// A piece a peer is downloading is never blackholed.
pub struct InFlightNeverBlackholed;

impl Invariant for InFlightNeverBlackholed {
    fn check(
        &self,
        store: &MemoryPieceStore,
        info_hash: InfoHash,
        tick: u64,
    ) -> Result<(), InvariantViolation> {
        let Ok(in_flight) = store.pieces_in_flight(info_hash) else {
            return Ok(());
        };
        let mut demoted: Vec<u32> = in_flight
            .into_iter()
            .filter(|piece| store.priority(info_hash, *piece) == Some(Priority::Blackholed))
            .map(|piece| piece.as_u32())
            .collect();
        if demoted.is_empty() {
            return Ok(());
        }
        demoted.sort_unstable();
        Err(InvariantViolation {
            invariant: self.name().to_string(),
            description: format!("In-flight pieces {demoted:?} were blackholed"),
            tick,
        })
    }

    fn name(&self) -> &str {
        "InFlightNeverBlackholed"
    }
}

/// Fully downloaded files keep a nonzero file priority.
pub struct CompleteFilesKept;

impl Invariant for CompleteFilesKept {
    fn check(
        &self,
        store: &MemoryPieceStore,
        info_hash: InfoHash,
        tick: u64,
    ) -> Result<(), InvariantViolation> {
        let (Ok(layout), Ok(bitmap)) = (store.layout(info_hash), store.piece_bitmap(info_hash))
        else {
            return Ok(());
        };

        let priorities = store.file_priorities(info_hash);
        let mut offset = 0u64;
        for (index, span) in layout.files.iter().enumerate() {
            let start = offset;
            offset += span.size;
            if span.size == 0 {
                continue;
            }
            let first = (start / layout.piece_length) as usize;
            let last = ((offset - 1) / layout.piece_length) as usize;
            let complete = bitmap
                .get(first..=last)
                .is_some_and(|pieces| pieces.iter().all(|have| *have));
            if complete && priorities.get(index) == Some(&Priority::Blackholed) {
                return Err(InvariantViolation {
                    invariant: self.name().to_string(),
                    description: format!("Complete file {} was set to skip", span.path),
                    tick,
                });
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "CompleteFilesKept"
    }
}

/// Runs a set of invariants after every swarm tick.
#[derive(Default)]
pub struct InvariantChecker {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantChecker {
    /// Creates an empty checker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checker with every invariant in this module.
    pub fn standard() -> Self {
        Self::new()
            .with(InFlightNeverBlackholed)
            .with(CompleteFilesKept)
    }

    /// Adds one invariant.
    pub fn with(mut self, invariant: impl Invariant + 'static) -> Self {
        self.invariants.push(Box::new(invariant));
        self
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Whether no invariants are registered.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }

    /// Checks every invariant, stopping at the first violation.
    ///
    /// # Errors
    /// Returns the first `InvariantViolation` encountered.
    pub fn check(
        &self,
        store: &MemoryPieceStore,
        info_hash: InfoHash,
        tick: u64,
    ) -> Result<(), InvariantViolation> {
        self.invariants
            .iter()
            .try_for_each(|invariant| invariant.check(store, info_hash, tick))
    }
}

#[cfg(test)]
mod tests {
    use piecemeal_core::PieceIndex;

    use super::*;

    fn setup() -> (MemoryPieceStore, InfoHash) {
        let store = MemoryPieceStore::new();
        let info_hash = store.add_torrent("invariants", 100, &[("a.rar", 200), ("b.r00", 200)]);
        (store, info_hash)
    }

    #[test]
    fn test_in_flight_blackholed_is_reported() {
        let (store, info_hash) = setup();
        let piece = PieceIndex::new(1);
        store.set_in_flight(info_hash, piece, true);
        store
            .set_piece_priority(info_hash, piece, Priority::Blackholed)
            .unwrap();

        let violation = InFlightNeverBlackholed
            .check(&store, info_hash, 3)
            .unwrap_err();

        assert_eq!(violation.invariant, "InFlightNeverBlackholed");
        assert_eq!(violation.tick, 3);
        assert!(violation.description.contains("[1]"));
    }

    #[test]
    fn test_complete_file_skipped_is_reported() {
        let (store, info_hash) = setup();
        store.complete_piece(info_hash, PieceIndex::new(0));
        store.complete_piece(info_hash, PieceIndex::new(1));
        store
            .set_file_priorities(info_hash, &[Priority::Blackholed, Priority::Critical])
            .unwrap();

        let violation = CompleteFilesKept.check(&store, info_hash, 1).unwrap_err();

        assert!(violation.description.contains("a.rar"));
    }

    #[test]
    fn test_standard_checker_accepts_fresh_store() {
        let (store, info_hash) = setup();
        let checker = InvariantChecker::standard();

        assert_eq!(checker.len(), 2);
        assert!(checker.check(&store, info_hash, 0).is_ok());
    }

    #[test]
    fn test_checker_unknown_torrent_passes() {
        let (store, _) = setup();
        let checker = InvariantChecker::standard();

        assert!(checker.check(&store, InfoHash::new([9; 20]), 0).is_ok());
    }
}
