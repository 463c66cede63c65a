//! Inbound capture from the voice link
//!
//! [`InboundCapture::deliver`] runs in the link's callback context for every
//! PCM block. It must finish in bounded time: no blocking, no allocation on
//! the happy path, no error escaping back into the link.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::diagnostics::{SequenceGapTracker, SignalDiagnostics};
use crate::audio::link::AudioLink;
use crate::audio::pool::PacketPool;
use crate::codec::framer::PacketFramer;
use crate::error::{CodecError, ResourceError};
use crate::network::queue::TransferQueue;
use crate::network::state::ConnectionStateMachine;
use crate::protocol::CodecTag;
use crate::ratelimit::RateLimiter;

/// Monotonic clock whose origin is the start of the current session
#[derive(Debug)]
pub struct SessionClock {
    origin: RwLock<Instant>,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            origin: RwLock::new(Instant::now()),
        }
    }

    pub fn restart(&self) {
        *self.origin.write() = Instant::now();
    }

    /// Microseconds since the session started
    pub fn now_us(&self) -> u64 {
        self.origin.read().elapsed().as_micros() as u64
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to one delivered chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Queued,
    /// Queued after evicting this many older packets
    Evicted(usize),
    NotConnected,
    NoBuffer,
    Invalid,
    Oversized,
}

/// Why a packet could not be queued
#[derive(Debug)]
pub(crate) enum EnqueueError {
    Pool(ResourceError),
    Codec(CodecError),
}

#[derive(Default)]
struct CaptureCounters {
    calls: AtomicU64,
    invalid: AtomicU64,
    queued: AtomicU64,
    evicted: AtomicU64,
    dropped_not_connected: AtomicU64,
    dropped_no_buffer: AtomicU64,
    oversized: AtomicU64,
}

/// Capture counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    pub calls: u64,
    pub invalid: u64,
    pub queued: u64,
    pub evicted: u64,
    pub dropped_not_connected: u64,
    pub dropped_no_buffer: u64,
    pub oversized: u64,
    pub estimated_lost: u64,
}

/// Shared pieces of the capture → queue path
pub struct CaptureContext {
    pub link: Arc<dyn AudioLink>,
    pub state: Arc<ConnectionStateMachine>,
    pub queue: Arc<TransferQueue>,
    pub pool: PacketPool,
    pub framer: Arc<PacketFramer>,
    pub diagnostics: Arc<SignalDiagnostics>,
    pub gaps: Arc<SequenceGapTracker>,
    pub clock: Arc<SessionClock>,
    /// Codec assumed while the link reports none
    pub fallback_codec: CodecTag,
    pub log_interval: Duration,
}

struct CaptureInner {
    ctx: CaptureContext,
    counters: CaptureCounters,
    /// Held from sequence assignment to push so packets from the link and
    /// from `send` reach the queue in sequence order
    producer: Mutex<()>,
    not_connected_log: RateLimiter,
    no_buffer_log: RateLimiter,
    evicted_log: RateLimiter,
    gap_log: RateLimiter,
}

/// Callback handle given to the voice link
#[derive(Clone)]
pub struct InboundCapture {
    inner: Arc<CaptureInner>,
}

impl InboundCapture {
    pub fn new(ctx: CaptureContext) -> Self {
        let interval = ctx.log_interval;
        Self {
            inner: Arc::new(CaptureInner {
                ctx,
                counters: CaptureCounters::default(),
                producer: Mutex::new(()),
                not_connected_log: RateLimiter::new(interval),
                no_buffer_log: RateLimiter::new(interval),
                evicted_log: RateLimiter::new(interval),
                gap_log: RateLimiter::new(interval),
            }),
        }
    }

    /// Handle one PCM chunk from the link
    pub fn deliver(&self, chunk: &[u8]) -> CaptureOutcome {
        let inner = &*self.inner;
        let counters = &inner.counters;

        if chunk.is_empty() {
            counters.invalid.fetch_add(1, Ordering::Relaxed);
            return CaptureOutcome::Invalid;
        }
        counters.calls.fetch_add(1, Ordering::Relaxed);
        inner.ctx.diagnostics.accumulate(chunk);

        if !inner.ctx.state.is_connected() {
            counters.dropped_not_connected.fetch_add(1, Ordering::Relaxed);
            if let Some(suppressed) = inner.not_connected_log.check() {
                tracing::warn!(
                    state = %inner.ctx.state.current(),
                    suppressed,
                    "stream not connected, dropping inbound audio"
                );
            }
            return CaptureOutcome::NotConnected;
        }

        match self.enqueue(chunk) {
            Ok(0) => CaptureOutcome::Queued,
            Ok(evicted) => CaptureOutcome::Evicted(evicted),
            Err(EnqueueError::Pool(e)) => {
                counters.dropped_no_buffer.fetch_add(1, Ordering::Relaxed);
                if let Some(suppressed) = inner.no_buffer_log.check() {
                    tracing::warn!(error = %e, suppressed, "dropping inbound audio");
                }
                CaptureOutcome::NoBuffer
            }
            Err(EnqueueError::Codec(e)) => {
                counters.oversized.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Failed to frame inbound audio: {}", e);
                CaptureOutcome::Oversized
            }
        }
    }

    /// Frame `payload` with the next sequence number and queue it. Returns
    /// the number of older packets evicted to make room.
    pub(crate) fn enqueue(&self, payload: &[u8]) -> Result<usize, EnqueueError> {
        let inner = &*self.inner;
        let ctx = &inner.ctx;
        let counters = &inner.counters;

        let buf = ctx.pool.acquire().map_err(EnqueueError::Pool)?;
        let codec = ctx.link.current_codec().unwrap_or(ctx.fallback_codec);

        let (seq, gap, evicted) = {
            let _producer = inner.producer.lock();
            let packet = ctx
                .framer
                .frame_next(buf, payload, codec, ctx.clock.now_us())
                .map_err(EnqueueError::Codec)?;
            let seq = packet.sequence();
            let gap = ctx.gaps.observe(seq);
            (seq, gap, ctx.queue.push(packet))
        };

        if gap > 0 {
            if let Some(suppressed) = inner.gap_log.check() {
                tracing::warn!(seq, gap, suppressed, "local sequence gap");
            }
        }
        counters.queued.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            counters.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            if let Some(suppressed) = inner.evicted_log.check() {
                tracing::warn!(evicted, suppressed, "transfer queue full, dropped oldest packets");
            }
        }
        Ok(evicted)
    }

    pub fn stats(&self) -> CaptureStats {
        let c = &self.inner.counters;
        CaptureStats {
            calls: c.calls.load(Ordering::Relaxed),
            invalid: c.invalid.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            dropped_not_connected: c.dropped_not_connected.load(Ordering::Relaxed),
            dropped_no_buffer: c.dropped_no_buffer.load(Ordering::Relaxed),
            oversized: c.oversized.load(Ordering::Relaxed),
            estimated_lost: self.inner.ctx.gaps.estimated_lost(),
        }
    }

    /// Re-arm the hot-path log gates for a new session
    pub fn reset_logs(&self) {
        self.inner.not_connected_log.reset();
        self.inner.no_buffer_log.reset();
        self.inner.evicted_log.reset();
        self.inner.gap_log.reset();
    }
}
