//! Outbound byte ring
//!
//! Single producer (the frame generator) and single consumer (the link's
//! pull callback). Whole frames go in, arbitrary byte counts come out, so a
//! pull may split a frame. Neither side ever waits on the other for more
//! than a short memcpy under the lock.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

struct Ring {
    data: Box<[u8]>,
    head: usize,
    len: usize,
}

impl Ring {
    fn write(&mut self, bytes: &[u8]) {
        let cap = self.data.len();
        let tail = (self.head + self.len) % cap;
        let first = bytes.len().min(cap - tail);
        self.data[tail..tail + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.len += bytes.len();
    }

    fn read(&mut self, out: &mut [u8]) -> usize {
        let cap = self.data.len();
        let count = out.len().min(self.len);
        let first = count.min(cap - self.head);
        out[..first].copy_from_slice(&self.data[self.head..self.head + first]);
        out[first..count].copy_from_slice(&self.data[..count - first]);
        self.head = (self.head + count) % cap;
        self.len -= count;
        count
    }
}

/// Fixed-capacity ring of outbound PCM bytes
pub struct OutboundRing {
    ring: Mutex<Ring>,
    capacity: usize,
    frames_written: AtomicU64,
    frames_skipped: AtomicU64,
    bytes_read: AtomicU64,
    short_reads: AtomicU64,
}

impl OutboundRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                data: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
            }),
            capacity,
            frames_written: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            short_reads: AtomicU64::new(0),
        }
    }

    /// Append a whole frame if it fits. Returns the occupancy after the
    /// append, or `None` if the frame was skipped.
    pub fn push_frame(&self, frame: &[u8]) -> Option<usize> {
        let mut ring = self.ring.lock();
        if frame.is_empty() || self.capacity - ring.len < frame.len() {
            drop(ring);
            self.frames_skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        ring.write(frame);
        let len = ring.len;
        drop(ring);
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        Some(len)
    }

    /// Copy up to `out.len()` bytes out of the ring. Fewer bytes (including
    /// none) is a normal outcome.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let count = self.ring.lock().read(out);
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
        if count < out.len() {
            self.short_reads.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    /// Discard everything buffered. Returns the number of bytes dropped.
    pub fn clear(&self) -> usize {
        let mut ring = self.ring.lock();
        let dropped = ring.len;
        ring.head = 0;
        ring.len = 0;
        dropped
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free(&self) -> usize {
        self.capacity - self.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            len: self.len(),
            capacity: self.capacity,
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
        }
    }
}

/// Outbound ring statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RingStats {
    pub len: usize,
    pub capacity: usize,
    pub frames_written: u64,
    pub frames_skipped: u64,
    pub bytes_read: u64,
    pub short_reads: u64,
}
