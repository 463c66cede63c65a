//! Wire packet framing and stream decoding
//!
//! The framer turns PCM chunks into wire packets on the capture path; the
//! decoder is the receiving end, used by the reference receiver together
//! with the recording helpers.

pub mod decoder;
pub mod framer;
pub mod recording;

pub use decoder::{ArrivalTimer, DecodedEvent, LossTracker, SequenceClass, StreamDecoder};
pub use framer::{frame, PacketFramer, WirePacket};
pub use recording::{EdgeTracker, PacketLog, PacketRecord, PcmFormat, SegmentRecorder};
