//! Boundary to the voice link
//!
//! The link owns negotiation and codec selection. The bridge only asks which
//! codec is active and tells the link when outbound audio is ready to pull.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::protocol::CodecTag;

/// What the bridge needs from the voice link
pub trait AudioLink: Send + Sync {
    /// Codec of the active audio connection, `None` while no audio is up
    fn current_codec(&self) -> Option<CodecTag>;

    /// Outbound frames are buffered and can be pulled
    fn outbound_ready(&self) {}
}

const NO_CODEC: u8 = 0;

/// Link state shared between a link driver and the bridge
#[derive(Debug, Default)]
pub struct SharedLink {
    codec: AtomicU8,
    ready_notifications: AtomicU64,
}

impl SharedLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(codec: CodecTag) -> Self {
        let link = Self::new();
        link.set_codec(Some(codec));
        link
    }

    /// Record the codec negotiated for the audio connection (`None` on teardown)
    pub fn set_codec(&self, codec: Option<CodecTag>) {
        let raw = codec.map_or(NO_CODEC, |c| c.wire_tag() as u8);
        self.codec.store(raw, Ordering::Release);
    }

    pub fn ready_notifications(&self) -> u64 {
        self.ready_notifications.load(Ordering::Relaxed)
    }
}

impl AudioLink for SharedLink {
    fn current_codec(&self) -> Option<CodecTag> {
        match self.codec.load(Ordering::Acquire) {
            NO_CODEC => None,
            raw => CodecTag::from_wire(raw as u16).ok(),
        }
    }

    fn outbound_ready(&self) {
        self.ready_notifications.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_updates() {
        let link = SharedLink::new();
        assert_eq!(link.current_codec(), None);

        link.set_codec(Some(CodecTag::Wideband));
        assert_eq!(link.current_codec(), Some(CodecTag::Wideband));

        link.set_codec(None);
        assert_eq!(link.current_codec(), None);
    }

    #[test]
    fn test_ready_notifications_counted() {
        let link = SharedLink::with_codec(CodecTag::Narrowband);
        link.outbound_ready();
        link.outbound_ready();
        assert_eq!(link.ready_notifications(), 2);
    }
}
