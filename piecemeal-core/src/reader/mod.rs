//! Sequential file reader over an eventually-complete piece store.
//!
//! A `Reader` looks like ordinary file I/O to its caller. Underneath, every
//! read maps its position to a piece, waits for that piece if it is missing
//! and keeps the scheduler informed of where it is.

#[cfg(test)]
mod reader_tests;

use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ReaderConfig;
use crate::error::{Result, StreamError};
use crate::scheduler::{ReaderId, Torrent};
use crate::store::StoreError;
use crate::torrent::{FileEntry, PieceIndex};

/// Blocking-style reader over one file of a torrent.
///
/// Dropping the reader closes it.
pub struct Reader {
    torrent: Arc<Torrent>,
    id: ReaderId,
    file: FileEntry,
    position: u64,
    end: u64,
    config: ReaderConfig,
    closed: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    cached: Option<(PieceIndex, Bytes)>,
    is_closed: bool,
}

impl Reader {
    /// Opens a reader on file `file_index` covering `from_byte..to_byte`.
    ///
    /// `to_byte` is clamped to the file size.
    ///
    /// # Errors
    ///
    /// - `StreamError::UnknownFile` - If the index is not in the file table
    /// - `StreamError::SeekOutOfRange` - If `from_byte` is past the end of the file
    /// - `StreamError::StreamClosed` - If the torrent has shut down
    pub fn open(
        torrent: Arc<Torrent>,
        file_index: usize,
        from_byte: u64,
        to_byte: u64,
        config: ReaderConfig,
    ) -> Result<Self> {
        let file = torrent.descriptor().resolve(&file_index.into())?.clone();
        if from_byte > file.size {
            return Err(StreamError::SeekOutOfRange {
                offset: from_byte,
                size: file.size,
            });
        }
        let end = to_byte.clamp(from_byte, file.size);

        let shutdown = torrent.subscribe_shutdown();
        let registration = torrent.add_reader(file.index, from_byte, end)?;

        Ok(Self {
            torrent,
            id: registration.id,
            file,
            position: from_byte,
            end,
            config,
            closed: registration.closed,
            shutdown,
            cached: None,
            is_closed: false,
        })
    }

    /// Identifier under which the torrent tracks this reader.
    pub fn id(&self) -> ReaderId {
        self.id
    }

    /// File being read.
    pub fn file(&self) -> &FileEntry {
        &self.file
    }

    /// Current byte position within the file.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total size of the file, regardless of the range.
    pub fn size(&self) -> u64 {
        self.file.size
    }

    /// Exclusive end of the range this reader serves.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Bytes left before the end of the range.
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.position)
    }

    /// Whether the reader was closed here, by a handle or by torrent shutdown.
    pub fn is_closed(&self) -> bool {
        self.signalled_closed()
    }

    /// Handle that closes this reader from another task.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            torrent: Arc::downgrade(&self.torrent),
            id: self.id,
        }
    }

    /// Reads up to `max` bytes, waiting for the piece if necessary.
    ///
    /// Never crosses a piece boundary or the end of the range, so a short
    /// read is normal. Returns an empty buffer at the end of the range.
    ///
    /// # Errors
    ///
    /// - `StreamError::StreamClosed` - If the reader or torrent was closed
    /// - `StreamError::StallTimeout` - If the piece did not arrive within the retry limit
    /// - `StreamError::Store` - If the store failed to read a completed piece
    pub async fn read(&mut self, max: usize) -> Result<Bytes> {
        if self.signalled_closed() {
            return Err(StreamError::StreamClosed);
        }
        if max == 0 || self.position >= self.end {
            return Ok(Bytes::new());
        }

        let (piece, offset_in_piece) = self.torrent.descriptor().locate(&self.file, self.position);
        let data = self.piece_data(piece).await?;

        let start = offset_in_piece as usize;
        let available = data.len().saturating_sub(start) as u64;
        let len = available.min(self.end - self.position).min(max as u64) as usize;
        let chunk = data.slice(start..start + len);

        self.position += len as u64;
        self.torrent.update_reader(self.id, self.position);

        let (next_piece, _) = self.torrent.descriptor().locate(&self.file, self.position);
        if next_piece != piece && self.position < self.end {
            self.torrent.cycle();
        }
        Ok(chunk)
    }

    /// Moves the read position and re-plans around it.
    ///
    /// # Errors
    ///
    /// - `StreamError::StreamClosed` - If the reader was closed
    /// - `StreamError::SeekOutOfRange` - If `offset` is past the end of the file
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        if self.signalled_closed() {
            return Err(StreamError::StreamClosed);
        }
        if offset > self.file.size {
            return Err(StreamError::SeekOutOfRange {
                offset,
                size: self.file.size,
            });
        }

        self.position = offset;
        if offset > self.end {
            self.end = self.file.size;
        }
        self.torrent.update_reader(self.id, offset);
        self.torrent.cycle();
        Ok(())
    }

    /// Unregisters the reader. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;
        self.cached = None;
        self.torrent.remove_reader(self.id);
    }

    /// Turns the reader into a stream of chunks of at most `chunk` bytes.
    ///
    /// The stream ends at the end of the range, or after yielding the first
    /// error.
    pub fn into_stream(self, chunk: usize) -> impl Stream<Item = Result<Bytes>> + Send {
        futures::stream::unfold(Some(self), move |reader| async move {
            let mut reader = reader?;
            match reader.read(chunk).await {
                Ok(data) if data.is_empty() => None,
                Ok(data) => Some((Ok(data), Some(reader))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    fn signalled_closed(&self) -> bool {
        self.is_closed
            || *self.closed.borrow()
            || *self.shutdown.borrow()
            || self.closed.has_changed().is_err()
    }

    async fn piece_data(&mut self, piece: PieceIndex) -> Result<Bytes> {
        if let Some((cached, data)) = &self.cached {
            if *cached == piece {
                return Ok(data.clone());
            }
        }

        let data = self.wait_for_piece(piece).await?;
        self.cached = Some((piece, data.clone()));
        Ok(data)
    }

    async fn wait_for_piece(&mut self, piece: PieceIndex) -> Result<Bytes> {
        let torrent = Arc::clone(&self.torrent);
        let info_hash = torrent.info_hash();
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut announced = false;

        loop {
            let guard = torrent.waiters().register(piece);
            let notified = guard.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match torrent.store().read_piece(info_hash, piece).await {
                Ok(data) => return Ok(data),
                Err(StoreError::PieceUnavailable { .. }) => {}
                Err(StoreError::UnknownTorrent { .. }) => return Err(StreamError::StreamClosed),
                Err(e) => return Err(e.into()),
            }

            if !announced {
                announced = true;
                torrent.update_reader(self.id, self.position);
                torrent.cycle();
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed.changed() => {}
                _ = self.shutdown.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    attempts += 1;
                    if self.config.max_wait_retries.is_some_and(|max| attempts > max) {
                        return Err(StreamError::StallTimeout {
                            piece,
                            attempts,
                            waited: started.elapsed(),
                        });
                    }
                    debug!(
                        "{} still waiting for piece {} of {} (attempt {})",
                        self.id, piece, info_hash, attempts
                    );
                    torrent.reassert(piece);
                    torrent.cycle();
                }
            }

            if self.signalled_closed() {
                return Err(StreamError::StreamClosed);
            }
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Closes a reader from outside the task that owns it.
///
/// A read pending on the reader fails with `StreamClosed`.
#[derive(Clone)]
pub struct CloseHandle {
    torrent: Weak<Torrent>,
    id: ReaderId,
}

impl CloseHandle {
    /// Closes the reader; a no-op once the torrent is gone.
    pub fn close(&self) {
        if let Some(torrent) = self.torrent.upgrade() {
            torrent.remove_reader(self.id);
        }
    }
}
