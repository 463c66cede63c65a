//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod diagnostics;
pub mod generator;
pub mod link;
pub mod pool;

pub use buffer::OutboundRing;
pub use capture::InboundCapture;
pub use diagnostics::{DiagnosticsReporter, LevelReport, SequenceGapTracker, SignalDiagnostics};
pub use generator::{FrameGenerator, FramePacer};
pub use link::{AudioLink, SharedLink};
pub use pool::{PacketPool, PooledBuffer};
