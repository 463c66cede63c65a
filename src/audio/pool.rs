//! Fixed pool of reusable packet buffers
//!
//! The capture callback must not hit the allocator for every 7.5 ms block.
//! Buffers are preallocated once and handed out through a lock-free free list;
//! a [`PooledBuffer`] returns itself to the pool when dropped, wherever that
//! happens (transport after sending, queue eviction, or shutdown drain).

use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::ResourceError;

struct PoolInner {
    free: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
    exhausted: AtomicU64,
}

/// Preallocated packet buffers sized to the transfer queue
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl PacketPool {
    /// Create `count` buffers of `buffer_size` bytes capacity each
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let free = ArrayQueue::new(count.max(1));
        for _ in 0..count {
            let _ = free.push(Vec::with_capacity(buffer_size));
        }

        Self {
            inner: Arc::new(PoolInner {
                free,
                buffer_size,
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    /// Take an empty buffer. Never allocates.
    pub fn acquire(&self) -> Result<PooledBuffer, ResourceError> {
        match self.inner.free.pop() {
            Some(buf) => Ok(PooledBuffer {
                buf,
                home: Some(Arc::downgrade(&self.inner)),
            }),
            None => {
                self.inner.exhausted.fetch_add(1, Ordering::Relaxed);
                Err(ResourceError::PoolExhausted {
                    capacity: self.capacity(),
                })
            }
        }
    }

    /// Buffers currently available
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.free.capacity()
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of failed acquisitions
    pub fn exhausted_count(&self) -> u64 {
        self.inner.exhausted.load(Ordering::Relaxed)
    }
}

/// Byte buffer on loan from a [`PacketPool`]
pub struct PooledBuffer {
    buf: Vec<u8>,
    home: Option<Weak<PoolInner>>,
}

impl PooledBuffer {
    /// A buffer that belongs to no pool and is simply freed on drop
    pub fn detached(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            home: None,
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(pool) = self.home.take().and_then(|home| home.upgrade()) else {
            return;
        };
        let mut buf = std::mem::take(&mut self.buf);
        // Oversized payloads grew the vector; give the pool back a normal one
        if buf.capacity() > pool.buffer_size * 4 {
            buf = Vec::with_capacity(pool.buffer_size);
        }
        buf.clear();
        let _ = pool.free.push(buf);
    }
}
