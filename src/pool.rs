//! A freelist of fixed-size I/O buffers.
//!
//! Connections, file streaming and the CGI pump all read and write in
//! [`BUF_SIZE`] chunks; recycling those buffers keeps the per-request
//! allocation count flat. This is a throughput aid, not a correctness
//! requirement.

use crate::prelude::*;
use std::ops::{Deref, DerefMut};

/// Size of every pooled buffer, and the reference chunk size used when
/// streaming files and process output.
pub const BUF_SIZE: usize = 1024;

/// Buffers seeded at construction.
const SEED: usize = 16;
/// Frees beyond this many retained buffers release their memory, the
/// equivalent of returning a fully-free chunk to the system.
const RETAIN: usize = 64;

struct PoolInner {
    free: Vec<Box<[u8; BUF_SIZE]>>,
}

/// A shared handle to the freelist. Cloning is cheap and all clones serve
/// from the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Self {
        let free = (0..SEED).map(|_| Box::new([0; BUF_SIZE])).collect();
        Self {
            inner: Arc::new(Mutex::new(PoolInner { free })),
        }
    }

    /// Hands out a buffer, reusing a previously freed one when available.
    /// The contents are whatever the previous user left behind.
    #[must_use]
    pub fn acquire(&self) -> PooledBuf {
        let recycled = self.inner.lock().unwrap().free.pop();
        PooledBuf {
            data: Some(recycled.unwrap_or_else(|| Box::new([0; BUF_SIZE]))),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Buffers currently sitting in the freelist.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }
}
impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
impl Debug for BufferPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .finish()
    }
}

/// An exclusively owned [`BUF_SIZE`] buffer that returns itself to the
/// pool on drop.
pub struct PooledBuf {
    data: Option<Box<[u8; BUF_SIZE]>>,
    pool: Arc<Mutex<PoolInner>>,
}

impl Deref for PooledBuf {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data.as_ref().unwrap()[..]
    }
}
impl DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data.as_mut().unwrap()[..]
    }
}
impl Drop for PooledBuf {
    fn drop(&mut self) {
        let data = self.data.take().unwrap();
        let mut pool = self.pool.lock().unwrap();
        if pool.free.len() < RETAIN {
            pool.free.push(data);
        }
    }
}
impl Debug for PooledBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("PooledBuf")
    }
}
