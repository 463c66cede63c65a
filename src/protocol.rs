//! Wire protocol definitions
//!
//! One TCP connection carries one session:
//!
//! ```text
//! AUDIO_STREAM\n
//! sample_rate=8000\n
//! channels=1\n
//! bits_per_sample=16\n
//! codec=CVSD\n
//! \n
//! [header | payload][header | payload]...
//! ```
//!
//! Packet header (20 bytes, little-endian):
//!
//! ```text
//! ┌──────────┬──────────┬────────────────┬─────────────┬──────────┐
//! │ 0..4     │ 4..8     │ 8..16          │ 16..18      │ 18..20   │
//! │ magic    │ sequence │ timestamp (µs) │ payload len │ codec    │
//! └──────────┴──────────┴────────────────┴─────────────┴──────────┘
//! ```

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CodecError;

/// Packet boundary marker ("AUDH" read as little-endian bytes)
pub const PACKET_MAGIC: u32 = 0x4844_5541;

/// Size of the fixed packet header in bytes
pub const PACKET_HEADER_SIZE: usize = 20;

/// Largest payload the u16 length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Duration of one PCM block delivered or consumed by the voice link
pub const PCM_BLOCK_DURATION_US: u64 = 7_500;

/// Bytes per 16-bit PCM sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// First line of the plaintext session header
pub const SESSION_PREAMBLE: &str = "AUDIO_STREAM";

/// Negotiated voice codec of the link. PCM is always delivered decoded; the
/// tag only determines sample rate and block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecTag {
    /// CVSD, 8 kHz
    Narrowband,
    /// mSBC, 16 kHz
    Wideband,
}

impl CodecTag {
    /// Tag value carried in the packet header
    pub fn wire_tag(self) -> u16 {
        match self {
            CodecTag::Narrowband => 1,
            CodecTag::Wideband => 2,
        }
    }

    pub fn from_wire(tag: u16) -> Result<Self, CodecError> {
        match tag {
            1 => Ok(CodecTag::Narrowband),
            2 => Ok(CodecTag::Wideband),
            other => Err(CodecError::UnknownCodec(other)),
        }
    }

    /// Name used in the session header
    pub fn name(self) -> &'static str {
        match self {
            CodecTag::Narrowband => "CVSD",
            CodecTag::Wideband => "MSBC",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "CVSD" => Some(CodecTag::Narrowband),
            "MSBC" => Some(CodecTag::Wideband),
            _ => None,
        }
    }

    /// Guess the codec from a sample rate; 16 kHz means mSBC
    pub fn from_sample_rate(sample_rate: u32) -> Self {
        if sample_rate == 16_000 {
            CodecTag::Wideband
        } else {
            CodecTag::Narrowband
        }
    }

    pub fn sample_rate(self) -> u32 {
        match self {
            CodecTag::Narrowband => 8_000,
            CodecTag::Wideband => 16_000,
        }
    }

    /// Bytes in one 7.5 ms mono block: 120 for CVSD, 240 for mSBC
    pub fn frame_bytes(self) -> usize {
        let samples = self.sample_rate() as u64 * PCM_BLOCK_DURATION_US / 1_000_000;
        samples as usize * BYTES_PER_SAMPLE
    }
}

impl fmt::Display for CodecTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed header preceding every PCM payload on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u32,
    pub timestamp_us: u64,
    pub payload_len: u16,
    pub codec: CodecTag,
}

impl PacketHeader {
    /// Append the 20 header bytes to `buf`
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(PACKET_MAGIC);
        buf.put_u32_le(self.sequence);
        buf.put_u64_le(self.timestamp_us);
        buf.put_u16_le(self.payload_len);
        buf.put_u16_le(self.codec.wire_tag());
    }

    /// Decode a header from the start of `data`
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: PACKET_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut buf = &data[..PACKET_HEADER_SIZE];
        let magic = buf.get_u32_le();
        if magic != PACKET_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let sequence = buf.get_u32_le();
        let timestamp_us = buf.get_u64_le();
        let payload_len = buf.get_u16_le();
        let codec = CodecTag::from_wire(buf.get_u16_le())?;

        Ok(Self {
            sequence,
            timestamp_us,
            payload_len,
            codec,
        })
    }

    /// Header plus payload size
    pub fn packet_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload_len as usize
    }
}

/// One-time plaintext preamble sent right after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHeader {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub codec: CodecTag,
}

impl SessionHeader {
    /// Header describing a mono 16-bit stream for `codec`
    pub fn for_codec(codec: CodecTag, channels: u8, bits_per_sample: u8) -> Self {
        Self {
            sample_rate: codec.sample_rate(),
            channels,
            bits_per_sample,
            codec,
        }
    }

    /// Serialize as newline-delimited key=value pairs ending in a blank line
    pub fn to_wire(&self) -> String {
        format!(
            "{}\nsample_rate={}\nchannels={}\nbits_per_sample={}\ncodec={}\n\n",
            SESSION_PREAMBLE,
            self.sample_rate,
            self.channels,
            self.bits_per_sample,
            self.codec.name(),
        )
    }

    /// Parse a header block (with or without the trailing blank line).
    ///
    /// `codec` is required. A missing `sample_rate` falls back to the codec's
    /// rate; `channels` and `bits_per_sample` default to mono 16-bit.
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let mut lines = text.lines();
        match lines.next() {
            Some(first) if first.trim() == SESSION_PREAMBLE => {}
            other => {
                return Err(CodecError::InvalidSessionHeader(format!(
                    "expected {} preamble, got {:?}",
                    SESSION_PREAMBLE, other
                )))
            }
        }

        let mut sample_rate = None;
        let mut channels = 1u8;
        let mut bits_per_sample = 16u8;
        let mut codec = None;

        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            let bad = |field: &str| {
                CodecError::InvalidSessionHeader(format!("bad {} value {:?}", field, value))
            };
            match key.trim() {
                "sample_rate" => sample_rate = Some(value.parse().map_err(|_| bad("sample_rate"))?),
                "channels" => channels = value.parse().map_err(|_| bad("channels"))?,
                "bits_per_sample" => {
                    bits_per_sample = value.parse().map_err(|_| bad("bits_per_sample"))?
                }
                "codec" => codec = Some(CodecTag::from_name(value).ok_or_else(|| bad("codec"))?),
                _ => {}
            }
        }

        let codec = codec
            .ok_or_else(|| CodecError::InvalidSessionHeader("missing codec".to_string()))?;

        Ok(Self {
            sample_rate: sample_rate.unwrap_or_else(|| codec.sample_rate()),
            channels,
            bits_per_sample,
            codec,
        })
    }
}
