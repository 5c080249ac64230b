//! Piecemeal Core - piece scheduling for streaming files out of torrents
//!
//! Turns an unordered, eventually-complete piece store into something that
//! behaves like sequential file I/O for each reader. The scheduler decides
//! which pieces to elevate, readers block until their piece lands, and the
//! idle reaper tears down torrents nobody is watching anymore.

pub mod config;
pub mod error;
pub mod reader;
pub mod reaper;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod torrent;
pub mod tracing_setup;

pub use config::PiecemealConfig;
pub use error::{Result, StreamError};
pub use reader::{CloseHandle, Reader};
pub use reaper::{IdleReaper, ReapReport, spawn_idle_reaper};
pub use registry::Registry;
pub use scheduler::{FilesetKey, ReaderId, Torrent, TorrentSnapshot, TorrentState};
pub use store::{PieceStore, StoreError, StoreEvent};
pub use torrent::{FileSelector, InfoHash, PieceIndex, Priority, TorrentDescriptor};
