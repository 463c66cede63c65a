//! Packet framer
//!
//! Turns a raw PCM chunk into a length-prefixed wire packet carrying the
//! session sequence number and capture timestamp.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::audio::pool::PooledBuffer;
use crate::error::CodecError;
use crate::protocol::{CodecTag, PacketHeader, MAX_PAYLOAD_LEN, PACKET_HEADER_SIZE};

/// A serialized packet ready for the socket
pub struct WirePacket {
    header: PacketHeader,
    data: PooledBuffer,
}

impl WirePacket {
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    /// Header and payload bytes exactly as sent
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[PACKET_HEADER_SIZE..]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for WirePacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WirePacket")
            .field("header", &self.header)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Frame `payload` into a freshly allocated buffer.
pub fn frame(
    payload: &[u8],
    codec: CodecTag,
    sequence: u32,
    timestamp_us: u64,
) -> Result<WirePacket, CodecError> {
    let buf = PooledBuffer::detached(PACKET_HEADER_SIZE + payload.len());
    frame_into(buf, payload, codec, sequence, timestamp_us)
}

/// Frame `payload` into a buffer supplied by the caller (normally pooled).
pub fn frame_into(
    mut buf: PooledBuffer,
    payload: &[u8],
    codec: CodecTag,
    sequence: u32,
    timestamp_us: u64,
) -> Result<WirePacket, CodecError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let header = PacketHeader {
        sequence,
        timestamp_us,
        payload_len: payload.len() as u16,
        codec,
    };

    buf.clear();
    buf.reserve(header.packet_len());
    header.encode(&mut *buf);
    buf.extend_from_slice(payload);

    Ok(WirePacket { header, data: buf })
}

/// Session-scoped framer that owns the sequence counter
pub struct PacketFramer {
    next_sequence: AtomicU32,
    frames_framed: AtomicU64,
    bytes_framed: AtomicU64,
    oversized: AtomicU64,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self {
            next_sequence: AtomicU32::new(0),
            frames_framed: AtomicU64::new(0),
            bytes_framed: AtomicU64::new(0),
            oversized: AtomicU64::new(0),
        }
    }

    /// Frame the next packet of the session.
    ///
    /// A sequence number is consumed only when framing succeeds, so the
    /// numbers seen on the wire never skip because of a rejected payload.
    pub fn frame_next(
        &self,
        buf: PooledBuffer,
        payload: &[u8],
        codec: CodecTag,
        timestamp_us: u64,
    ) -> Result<WirePacket, CodecError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            self.oversized.fetch_add(1, Ordering::Relaxed);
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let packet = frame_into(buf, payload, codec, sequence, timestamp_us)?;

        self.frames_framed.fetch_add(1, Ordering::Relaxed);
        self.bytes_framed.fetch_add(packet.len() as u64, Ordering::Relaxed);
        Ok(packet)
    }

    /// Sequence number the next packet will get
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence.load(Ordering::Relaxed)
    }

    /// Start a new sequence space for the next session
    pub fn reset(&self) {
        self.next_sequence.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> FramerStats {
        FramerStats {
            frames_framed: self.frames_framed.load(Ordering::Relaxed),
            bytes_framed: self.bytes_framed.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
        }
    }
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Framer statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FramerStats {
    pub frames_framed: u64,
    pub bytes_framed: u64,
    pub oversized: u64,
}
