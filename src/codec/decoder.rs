//! Receiver-side stream decoder
//!
//! Incremental: feed whatever the socket returned, then pull events until
//! `None`. Corrupt input is skipped by scanning for the next packet magic.

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::protocol::{PacketHeader, SessionHeader, PACKET_HEADER_SIZE, PACKET_MAGIC};

/// Payloads above this are treated as corruption on the receiving side
pub const MAX_RECEIVED_PAYLOAD: usize = 4096;

/// Give up waiting for a session header once this much data is buffered
const MAX_PREAMBLE_LEN: usize = 2048;

/// Output of [`StreamDecoder::next_event`]
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Session(SessionHeader),
    /// Preamble missing or unreadable; packets follow with defaults
    NoSession,
    Packet { header: PacketHeader, payload: Bytes },
    /// Bytes discarded while looking for the next packet boundary
    Resync { skipped: usize },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DecoderStats {
    pub bytes_fed: u64,
    pub packets: u64,
    pub resyncs: u64,
    pub bytes_skipped: u64,
}

pub struct StreamDecoder {
    buf: BytesMut,
    preamble_done: bool,
    session: Option<SessionHeader>,
    stats: DecoderStats,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            preamble_done: false,
            session: None,
            stats: DecoderStats::default(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.stats.bytes_fed += data.len() as u64;
        self.buf.extend_from_slice(data);
    }

    /// Next complete event, or `None` when more input is needed
    pub fn next_event(&mut self) -> Option<DecodedEvent> {
        if !self.preamble_done {
            return self.read_preamble();
        }

        if self.buf.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let header = match PacketHeader::decode(&self.buf) {
            Ok(h) if h.payload_len != 0 && h.payload_len as usize <= MAX_RECEIVED_PAYLOAD => h,
            _ => return Some(self.resync()),
        };

        if self.buf.len() < header.packet_len() {
            return None;
        }

        let mut packet = self.buf.split_to(header.packet_len());
        packet.advance(PACKET_HEADER_SIZE);
        self.stats.packets += 1;
        Some(DecodedEvent::Packet {
            header,
            payload: packet.freeze(),
        })
    }

    fn read_preamble(&mut self) -> Option<DecodedEvent> {
        match self.buf.windows(2).position(|w| w == b"\n\n") {
            Some(end) => {
                let block = self.buf.split_to(end + 2);
                self.preamble_done = true;
                let text = String::from_utf8_lossy(&block);
                match SessionHeader::parse(&text) {
                    Ok(header) => {
                        self.session = Some(header.clone());
                        Some(DecodedEvent::Session(header))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "ignoring unreadable session header");
                        Some(DecodedEvent::NoSession)
                    }
                }
            }
            None if self.buf.len() >= MAX_PREAMBLE_LEN => {
                self.preamble_done = true;
                Some(DecodedEvent::NoSession)
            }
            None => None,
        }
    }

    /// Drop at least one byte, then everything up to the next magic
    fn resync(&mut self) -> DecodedEvent {
        let magic = PACKET_MAGIC.to_le_bytes();
        let skipped = self.buf[1..]
            .windows(magic.len())
            .position(|w| w == magic)
            .map(|pos| pos + 1)
            // Keep a tail that could be the start of a split magic
            .unwrap_or_else(|| (self.buf.len() + 1).saturating_sub(magic.len()).max(1));

        self.buf.advance(skipped);
        self.stats.resyncs += 1;
        self.stats.bytes_skipped += skipped as u64;
        DecodedEvent::Resync { skipped }
    }

    pub fn session(&self) -> Option<&SessionHeader> {
        self.session.as_ref()
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward jumps at least this large are a sender restart, not loss
pub const HUGE_GAP: u32 = 100_000;

/// How a received sequence number relates to the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceClass {
    Start,
    Cont,
    Dup,
    Gap(u32),
    Reorder,
    Reset,
}

impl SequenceClass {
    /// Event name used in packet logs
    pub fn label(&self) -> &'static str {
        match self {
            SequenceClass::Start => "START",
            SequenceClass::Cont => "CONT",
            SequenceClass::Dup => "DUP",
            SequenceClass::Gap(_) => "GAP",
            SequenceClass::Reorder => "REORDER",
            SequenceClass::Reset => "RESET",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LossStats {
    pub received: u64,
    pub missed: u64,
    pub duplicates: u64,
    pub reordered: u64,
    pub gap_events: u64,
    pub max_gap: u32,
    pub resets: u64,
}

/// Receiver-side sequence accounting
#[derive(Debug, Default)]
pub struct LossTracker {
    last: Option<u32>,
    stats: LossStats,
}

impl LossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, seq: u32) -> SequenceClass {
        self.stats.received += 1;

        let Some(last) = self.last else {
            self.last = Some(seq);
            return SequenceClass::Start;
        };

        let expected = last.wrapping_add(1);
        let class = if seq == last {
            self.stats.duplicates += 1;
            SequenceClass::Dup
        } else if seq == expected {
            SequenceClass::Cont
        } else {
            let forward = seq.wrapping_sub(expected);
            if forward < HUGE_GAP {
                self.stats.missed += forward as u64;
                self.stats.gap_events += 1;
                self.stats.max_gap = self.stats.max_gap.max(forward);
                SequenceClass::Gap(forward)
            } else if seq < last {
                self.stats.reordered += 1;
                SequenceClass::Reorder
            } else {
                self.stats.resets += 1;
                SequenceClass::Reset
            }
        };

        // Late and repeated packets do not move the high-water mark
        if !matches!(class, SequenceClass::Dup | SequenceClass::Reorder) {
            self.last = Some(seq);
        }
        class
    }

    /// Sequence that would continue the stream, `None` before the first packet
    pub fn expected(&self) -> Option<u32> {
        self.last.map(|last| last.wrapping_add(1))
    }

    pub fn stats(&self) -> &LossStats {
        &self.stats
    }

    /// Forget the last sequence; the next packet is a new start
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Smoothed packet inter-arrival time with spike detection
#[derive(Debug, Default)]
pub struct ArrivalTimer {
    last: Option<Instant>,
    last_delta: Duration,
    avg_ms: f64,
}

impl ArrivalTimer {
    const SPIKE_FACTOR: f64 = 2.5;
    const SPIKE_FLOOR_MS: f64 = 5.0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arrival. Returns the gap when it is well above average.
    pub fn observe(&mut self, now: Instant) -> Option<Duration> {
        let Some(prev) = self.last.replace(now) else {
            self.last_delta = Duration::ZERO;
            return None;
        };
        let delta = now.saturating_duration_since(prev);
        self.last_delta = delta;
        let delta_ms = delta.as_secs_f64() * 1000.0;

        if self.avg_ms == 0.0 {
            self.avg_ms = delta_ms;
            return None;
        }
        let spike = delta_ms > self.avg_ms * Self::SPIKE_FACTOR && delta_ms > Self::SPIKE_FLOOR_MS;
        self.avg_ms = 0.9 * self.avg_ms + 0.1 * delta_ms;
        spike.then_some(delta)
    }

    /// Gap before the most recent arrival; zero for the first
    pub fn last_delta(&self) -> Duration {
        self.last_delta
    }

    pub fn average(&self) -> Duration {
        Duration::from_secs_f64(self.avg_ms / 1000.0)
    }
}
