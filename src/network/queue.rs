//! Bounded transfer queue between the capture path and the transport thread
//!
//! Push never blocks and never rejects: when the queue is full the oldest
//! packets are evicted to make room, so the receiver always gets the freshest
//! audio. Pop blocks with a timeout so the transport can periodically check
//! connection health while idle.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::codec::framer::WirePacket;

struct QueueState {
    packets: VecDeque<WirePacket>,
    closed: bool,
}

/// Fixed-capacity FIFO with drop-oldest backpressure
pub struct TransferQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    capacity: usize,
    evict_batch: usize,
    pushed: AtomicU64,
    popped: AtomicU64,
    evicted: AtomicU64,
}

impl TransferQueue {
    pub fn new(capacity: usize, evict_batch: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                packets: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity,
            evict_batch: evict_batch.clamp(1, capacity),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Insert a packet, evicting the oldest entries if the queue is full.
    /// Returns the number of packets evicted.
    pub fn push(&self, packet: WirePacket) -> usize {
        let mut evicted = 0;
        {
            let mut state = self.state.lock();
            if state.packets.len() >= self.capacity {
                // Dropped buffers go straight back to the lock-free pool
                while evicted < self.evict_batch && state.packets.pop_front().is_some() {
                    evicted += 1;
                }
            }
            state.packets.push_back(packet);
        }
        self.not_empty.notify_one();

        self.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    /// Wait up to `timeout` for a packet. Returns `None` on timeout or when
    /// the queue has been closed.
    pub fn pop(&self, timeout: Duration) -> Option<WirePacket> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return None;
            }
            if let Some(packet) = state.packets.pop_front() {
                self.popped.fetch_add(1, Ordering::Relaxed);
                return Some(packet);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                if state.closed {
                    return None;
                }
                let packet = state.packets.pop_front();
                if packet.is_some() {
                    self.popped.fetch_add(1, Ordering::Relaxed);
                }
                return packet;
            }
        }
    }

    /// Pop without waiting
    pub fn try_pop(&self) -> Option<WirePacket> {
        let packet = self.state.lock().packets.pop_front();
        if packet.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        packet
    }

    /// Wake any blocked consumer and make `pop` return `None`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
    }

    /// Re-arm the queue after `close`
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Free every queued packet. Returns how many were discarded.
    pub fn drain(&self) -> usize {
        let drained: Vec<WirePacket> = self.state.lock().packets.drain(..).collect();
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evict_batch(&self) -> usize {
        self.evict_batch
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            len: self.len(),
            capacity: self.capacity,
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Queue occupancy and counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    pub pushed: u64,
    pub popped: u64,
    pub evicted: u64,
}
