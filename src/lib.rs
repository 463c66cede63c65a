//! # SCO Stream Bridge
//!
//! Bridges a fixed-cadence voice link (small PCM frames on a strict timing
//! grid) to a best-effort TCP audio receiver, while feeding the link a paced
//! silence stream on the same grid.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           AUDIO LINK                                 │
//! │        deliver_inbound(chunk)              request_outbound(buf)     │
//! └──────────────┬───────────────────────────────────────▲───────────────┘
//!                │ callback context                      │ callback context
//!                ▼                                       │
//!  ┌───────────────────────────┐           ┌─────────────┴─────────────┐
//!  │ Inbound Capture           │           │ Outbound Ring             │
//!  │ (audio::capture)          │           │ (audio::buffer)           │
//!  │  diagnostics accumulate   │           └─────────────▲─────────────┘
//!  │  pool → framer → queue    │                         │ silence frames
//!  └─────────────┬─────────────┘           ┌─────────────┴─────────────┐
//!                │                         │ Frame Generator thread    │
//!                ▼                         │ (audio::generator)        │
//!  ┌───────────────────────────┐           │  deadline pacer           │
//!  │ Transfer Queue            │           └─────────────▲─────────────┘
//!  │ (network::queue)          │                         │ tick signal
//!  │  drop-oldest, cap 50      │           ┌─────────────┴─────────────┐
//!  └─────────────┬─────────────┘           │ Timer thread (4 ms)       │
//!                │ pop(timeout)            └───────────────────────────┘
//!                ▼
//!  ┌───────────────────────────┐
//!  │ Transport thread          │
//!  │ (network::transport)      │──── TCP ────▶  receiver
//!  │  connect / header / send  │   AUDIO_STREAM header, then
//!  └───────────────────────────┘   [AUDH|seq|ts|len|codec|pcm]...
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod ratelimit;
pub mod session;

pub use audio::link::{AudioLink, SharedLink};
pub use config::AppConfig;
pub use error::{Error, Result};
pub use protocol::CodecTag;
pub use session::{SendStatus, StopOutcome, StreamSession, StreamStatus};

/// Application-wide constants
pub mod constants {
    /// Default TCP port of the audio receiver
    pub const DEFAULT_SERVER_PORT: u16 = 8888;

    /// Transfer queue capacity in packets
    pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

    /// Packets evicted at once when the queue overflows
    pub const DEFAULT_EVICT_BATCH: usize = 5;

    /// Wait between reconnect attempts
    pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

    /// Queue pop timeout while connected
    pub const DEFAULT_IDLE_POLL_MS: u64 = 1_000;

    /// Generator timer tick
    pub const DEFAULT_GENERATOR_TICK_US: u64 = 4_000;

    /// Outbound ring size (15 wideband frames)
    pub const DEFAULT_OUTBOUND_RING_BYTES: usize = 3_600;

    /// Signal level report period
    pub const DEFAULT_REPORT_PERIOD_MS: u64 = 500;

    /// Minimum spacing between repeated hot-path warnings
    pub const DEFAULT_LOG_INTERVAL_MS: u64 = 2_000;
}
