//! Signal level and loss diagnostics
//!
//! The capture path writes, the reporter thread reads. All counters are
//! relaxed atomics: a report may straddle a window boundary by a sample or
//! two, which is fine for a level meter.

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::network::state::StateChange;

/// Floor of the reported level
pub const MIN_LEVEL_DB: f32 = -60.0;

const FULL_SCALE: f32 = i16::MAX as f32;

/// One level report window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelReport {
    /// Mean absolute sample value
    pub average: u32,
    pub peak: u32,
    /// Peak relative to full scale, floored at -60 dB
    pub db: f32,
    pub samples: u64,
}

/// Per-window peak and average magnitude of s16le PCM
#[derive(Debug, Default)]
pub struct SignalDiagnostics {
    monitoring: AtomicBool,
    samples: AtomicU64,
    sum: AtomicU64,
    peak: AtomicU32,
}

impl SignalDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a fresh window. Calling it again while running is a no-op.
    pub fn start(&self) {
        if self.monitoring.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reset_window();
    }

    /// Safe to call when never started
    pub fn stop(&self) {
        self.monitoring.store(false, Ordering::Release);
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Acquire)
    }

    /// Fold a chunk of little-endian 16-bit samples into the window.
    /// A trailing odd byte is ignored.
    pub fn accumulate(&self, pcm: &[u8]) {
        if !self.is_monitoring() {
            return;
        }

        let mut count = 0u64;
        let mut sum = 0u64;
        let mut peak = 0u32;
        for pair in pcm.chunks_exact(2) {
            let magnitude = i16::from_le_bytes([pair[0], pair[1]]).unsigned_abs() as u32;
            sum += magnitude as u64;
            peak = peak.max(magnitude);
            count += 1;
        }
        if count == 0 {
            return;
        }

        self.samples.fetch_add(count, Ordering::Relaxed);
        self.sum.fetch_add(sum, Ordering::Relaxed);
        self.peak.fetch_max(peak, Ordering::Relaxed);
    }

    /// Summarise and reset the current window. `None` if nothing was
    /// accumulated since the last report.
    pub fn report(&self) -> Option<LevelReport> {
        let samples = self.samples.swap(0, Ordering::Relaxed);
        let sum = self.sum.swap(0, Ordering::Relaxed);
        let peak = self.peak.swap(0, Ordering::Relaxed);
        if samples == 0 {
            return None;
        }

        Some(LevelReport {
            average: (sum / samples) as u32,
            peak,
            db: level_db(peak),
            samples,
        })
    }

    fn reset_window(&self) {
        self.samples.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.peak.store(0, Ordering::Relaxed);
    }
}

/// `20·log10(peak / 32767)`, floored
pub fn level_db(peak: u32) -> f32 {
    if peak == 0 {
        return MIN_LEVEL_DB;
    }
    (20.0 * (peak as f32 / FULL_SCALE).log10()).max(MIN_LEVEL_DB)
}

/// Local estimate of sequence numbers skipped between framing and enqueue.
/// Stays at zero unless something upstream is broken.
#[derive(Debug, Default)]
pub struct SequenceGapTracker {
    /// Last observed sequence + 1; 0 until the first observation
    next_expected: AtomicU64,
    estimated_lost: AtomicU64,
}

impl SequenceGapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an assigned sequence number. Returns the size of the gap
    /// before it, if any.
    pub fn observe(&self, seq: u32) -> u32 {
        let expected = self.next_expected.swap(seq as u64 + 1, Ordering::Relaxed);
        if expected == 0 {
            return 0;
        }
        let gap = seq.wrapping_sub(expected as u32);
        // A sequence at or behind the last one is a restart, not loss
        if gap == 0 || gap > u32::MAX / 2 {
            return 0;
        }
        self.estimated_lost.fetch_add(gap as u64, Ordering::Relaxed);
        gap
    }

    pub fn estimated_lost(&self) -> u64 {
        self.estimated_lost.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.next_expected.store(0, Ordering::Relaxed);
        self.estimated_lost.store(0, Ordering::Relaxed);
    }
}

/// Pipeline counters logged alongside each level report
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineCounters {
    pub packets_sent: u64,
    pub queued: usize,
    pub evicted: u64,
    pub dropped_not_connected: u64,
    pub estimated_lost: u64,
}

pub type CounterSource = Box<dyn Fn() -> PipelineCounters + Send>;

/// Background thread emitting level reports and connection changes
pub struct DiagnosticsReporter {
    diagnostics: Arc<SignalDiagnostics>,
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DiagnosticsReporter {
    pub fn spawn(
        diagnostics: Arc<SignalDiagnostics>,
        period: Duration,
        changes: Receiver<StateChange>,
        counters: CounterSource,
    ) -> std::io::Result<Self> {
        let builder = thread::Builder::new().name("audio-diagnostics".to_string());
        Self::spawn_with(builder, diagnostics, period, changes, counters)
    }

    /// Monitoring is switched on only once the thread exists
    fn spawn_with(
        builder: thread::Builder,
        diagnostics: Arc<SignalDiagnostics>,
        period: Duration,
        changes: Receiver<StateChange>,
        counters: CounterSource,
    ) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let reporting = diagnostics.clone();

        let handle = builder.spawn(move || {
            let diagnostics = reporting;
            let ticker = tick(period);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        if let Some(level) = diagnostics.report() {
                            let c = counters();
                            tracing::info!(
                                avg = level.average,
                                peak = level.peak,
                                db = f64::from(level.db),
                                samples = level.samples,
                                sent = c.packets_sent,
                                queued = c.queued,
                                evicted = c.evicted,
                                lost = c.estimated_lost,
                                "mic level"
                            );
                        }
                    }
                    recv(changes) -> change => match change {
                        Ok(change) => {
                            let c = counters();
                            tracing::info!(
                                from = %change.from,
                                to = %change.to,
                                sent = c.packets_sent,
                                dropped_not_connected = c.dropped_not_connected,
                                "stream connection state"
                            );
                        }
                        Err(_) => break,
                    },
                    recv(shutdown_rx) -> _ => break,
                }
            }
        })?;
        diagnostics.start();

        Ok(Self {
            diagnostics,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.shutdown_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("diagnostics thread panicked");
            }
        }
        self.diagnostics.stop();
    }
}

impl Drop for DiagnosticsReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
