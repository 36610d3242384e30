//! Shared packet buffer pool.
//!
//! Fixed-size buffers are pre-allocated once and reused for connection
//! receive buffers and send (coalescing) buffers, so steady-state traffic
//! does not allocate. The pool is bounded: when it runs dry an ad hoc buffer
//! is allocated instead of making the caller wait, and a warning is logged.
//! Buffers go back to the free list when their [`PooledBuffer`] is dropped.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Bounded pool of equally sized byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    /// Stack of available buffers (LIFO for cache locality).
    free: Mutex<Vec<Vec<u8>>>,
    /// Number of buffers the pool keeps around.
    capacity: usize,
    /// Size of each buffer.
    buffer_size: usize,
    /// Number of acquisitions served by ad hoc allocation.
    fallbacks: AtomicU64,
}

impl BufferPool {
    /// Create a pool with `count` pre-allocated buffers of `size` bytes.
    pub fn new(count: usize, size: usize) -> Arc<Self> {
        let free = (0..count).map(|_| vec![0u8; size]).collect();

        Arc::new(Self {
            free: Mutex::new(free),
            capacity: count,
            buffer_size: size,
            fallbacks: AtomicU64::new(0),
        })
    }

    /// Take a buffer from the pool, allocating one if the pool is exhausted.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let pooled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let buf = match pooled {
            Some(buf) => buf,
            None => {
                let total = self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    capacity = self.capacity,
                    buffer_size = self.buffer_size,
                    fallbacks = total,
                    "Buffer pool exhausted, allocating ad hoc"
                );
                vec![0u8; self.buffer_size]
            }
        };

        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        // ad hoc buffers refill the pool up to its capacity, the rest are freed
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    /// Size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers the pool holds when idle.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently available.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// How many acquisitions fell back to ad hoc allocation.
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .finish()
    }
}
