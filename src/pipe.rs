//! The byte queue between a response producer and the socket writer.
//!
//! A pipe is unidirectional, single-writer, single-reader. The producer
//! (a handler or the CGI pump) appends with [`PipeWriter::write`], the
//! connection driver drains with [`PipeReader::next_chunk`] and encrypts
//! onto the socket. The reader is woken whenever data becomes available or
//! the pipe closes; the writer is suspended while the queue sits above the
//! high-water mark, which is what bounds a handler that produces faster
//! than the peer reads.

use crate::prelude::*;
use tokio::sync::Notify;

/// Backpressure threshold. [`PipeWriter::write`] parks until the queued
/// bytes drop below this.
pub const HIGH_WATER: usize = 64 * 1024;

struct Inner {
    buffer: BytesMut,
    closed: bool,
    broken: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    readable: Notify,
    writable: Notify,
}

/// Creates a connected writer/reader pair.
#[must_use]
pub fn pipe() -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            buffer: BytesMut::with_capacity(1024),
            closed: false,
            broken: false,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        PipeWriter {
            shared: Arc::clone(&shared),
        },
        PipeReader { shared },
    )
}

/// The producing end of a [`pipe`].
pub struct PipeWriter {
    shared: Arc<Shared>,
}

/// The error returned when the reading end reported a downstream failure.
/// Producing further output is pointless; the producer should stop.
#[derive(Debug, PartialEq, Eq)]
pub struct Broken;

impl PipeWriter {
    /// Appends `bytes`, waiting for the queue to drop below
    /// [`HIGH_WATER`] first. Writing to a closed pipe is a no-op.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), Broken> {
        loop {
            {
                let mut inner = self.shared.inner.lock().unwrap();
                if inner.broken {
                    return Err(Broken);
                }
                if inner.closed {
                    return Ok(());
                }
                if inner.buffer.len() < HIGH_WATER {
                    let was_empty = inner.buffer.is_empty();
                    inner.buffer.extend_from_slice(bytes);
                    drop(inner);
                    if was_empty {
                        self.shared.readable.notify_one();
                    }
                    return Ok(());
                }
            }
            self.shared.writable.notified().await;
        }
    }

    /// Bytes currently queued.
    #[must_use]
    pub fn ready(&self) -> usize {
        self.shared.inner.lock().unwrap().buffer.len()
    }

    /// Whether the reader has reported a downstream failure.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.shared.inner.lock().unwrap().broken
    }

    /// Refuses further writes. Already queued bytes stay readable.
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.shared.readable.notify_one();
    }
}
impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}
impl Debug for PipeWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeWriter")
            .field("ready", &self.ready())
            .finish()
    }
}

/// The consuming end of a [`pipe`].
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Copies up to `dest.len()` queued bytes into `dest`, advancing the
    /// head. Returns the number copied; `0` means nothing is queued.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let mut inner = self.shared.inner.lock().unwrap();
        let n = dest.len().min(inner.buffer.len());
        if n > 0 {
            dest[..n].copy_from_slice(&inner.buffer.split_to(n));
            drop(inner);
            self.shared.writable.notify_one();
        }
        n
    }

    /// Bytes currently queued.
    #[must_use]
    pub fn ready(&self) -> usize {
        self.shared.inner.lock().unwrap().buffer.len()
    }

    /// Takes the next chunk of at most `max` bytes, waiting for data.
    /// Resolves to `None` once the pipe is closed and drained.
    pub async fn next_chunk(&mut self, max: usize) -> Option<Bytes> {
        loop {
            {
                let mut inner = self.shared.inner.lock().unwrap();
                if !inner.buffer.is_empty() {
                    let n = max.min(inner.buffer.len());
                    let chunk = inner.buffer.split_to(n).freeze();
                    drop(inner);
                    self.shared.writable.notify_one();
                    return Some(chunk);
                }
                if inner.closed {
                    return None;
                }
            }
            self.shared.readable.notified().await;
        }
    }

    /// Marks the pipe broken after a downstream write failure, failing the
    /// producer's next [`PipeWriter::write`].
    pub fn mark_broken(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.broken = true;
        inner.buffer.clear();
        drop(inner);
        self.shared.writable.notify_one();
    }
}
impl Debug for PipeReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReader")
            .field("ready", &self.ready())
            .finish()
    }
}
