//! Idle sweep over the registry.
//!
//! Torrents nobody has read from for the idle timeout are shut down and
//! forgotten; readers left open by clients that went away are force-closed.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::ReaperConfig;
use crate::registry::Registry;
use crate::torrent::InfoHash;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub torrents_removed: Vec<InfoHash>,
    pub readers_closed: usize,
}

/// Periodically tears down idle torrents and readers.
pub struct IdleReaper {
    registry: Weak<Registry>,
    config: ReaperConfig,
}

impl IdleReaper {
    /// Creates a reaper using the registry's reaper configuration.
    pub fn new(registry: &Arc<Registry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            config: registry.config().reaper.clone(),
        }
    }

    /// Runs one sweep as of `now`.
    ///
    /// Idle readers are closed first. Closing a reader counts as activity,
    /// so a torrent whose last reader was just reaped survives until a later
    /// sweep finds it idle for a full timeout. A torrent is only forgotten
    /// if the registry still maps its info hash to it.
    pub fn reap_idle(&self, now: Instant) -> ReapReport {
        let mut report = ReapReport::default();
        let Some(registry) = self.registry.upgrade() else {
            return report;
        };

        for torrent in registry.torrents() {
            for id in torrent.idle_readers(now, self.config.reader_idle_timeout) {
                if torrent.remove_reader(id) {
                    info!("Closed idle {} on {}", id, torrent.info_hash());
                    report.readers_closed += 1;
                }
            }

            if torrent.shutdown_if_idle(now, self.config.torrent_idle_timeout) {
                registry.detach(&torrent);
                info!(
                    "Torrent {} idle for {:?}, shut down",
                    torrent.info_hash(),
                    self.config.torrent_idle_timeout
                );
                report.torrents_removed.push(torrent.info_hash());
            }
        }
        report
    }

    /// Sweeps on every `sweep_interval` until the registry is dropped.
    pub async fn run(self) {
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            if self.registry.strong_count() == 0 {
                break;
            }
            let report = self.reap_idle(Instant::now());
            if report != ReapReport::default() {
                debug!(
                    "Idle sweep removed {} torrents and {} readers",
                    report.torrents_removed.len(),
                    report.readers_closed
                );
            }
        }
    }
}

/// Spawns an [`IdleReaper`] for `registry` on the current runtime.
pub fn spawn_idle_reaper(registry: &Arc<Registry>) -> JoinHandle<()> {
    tokio::spawn(IdleReaper::new(registry).run())
}
