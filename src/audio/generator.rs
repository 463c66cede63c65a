//! Outbound silence generator
//!
//! A timer thread ticks at a fixed rate and only signals; the generator
//! thread does the work. The pacer decides on each tick whether a frame is
//! due, so the ring fills at the link's block rate (one block per 7.5 ms)
//! rather than the tick rate.

use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::OutboundRing;
use crate::audio::link::AudioLink;
use crate::config::GeneratorConfig;
use crate::protocol::CodecTag;

/// Deadline pacer: at most one frame per poll, never bursts to catch up
#[derive(Debug, Clone)]
pub struct FramePacer {
    period: Duration,
    next_due: Option<Instant>,
}

impl FramePacer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_due: None,
        }
    }

    /// Whether a frame should be produced at `now`
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next_due {
            None => {
                self.next_due = Some(now + self.period);
                true
            }
            Some(due) if now >= due => {
                let next = due + self.period;
                // More than a period behind: resynchronise instead of bursting
                self.next_due = Some(if now >= next { now + self.period } else { next });
                true
            }
            Some(_) => false,
        }
    }

    /// Forget the schedule; the next poll produces a frame
    pub fn reset(&mut self) {
        self.next_due = None;
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

#[derive(Debug, Default)]
struct GeneratorCounters {
    ticks: AtomicU64,
    missed_ticks: AtomicU64,
    idle_ticks: AtomicU64,
    frames_generated: AtomicU64,
    frames_skipped: AtomicU64,
    ready_notifications: AtomicU64,
}

/// Generator counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct GeneratorStats {
    pub ticks: u64,
    /// Ticks dropped because the generator had not consumed the previous one
    pub missed_ticks: u64,
    /// Ticks with no active codec on the link
    pub idle_ticks: u64,
    pub frames_generated: u64,
    /// Frames not written because the ring was full
    pub frames_skipped: u64,
    pub ready_notifications: u64,
}

/// Timer and generator threads of one session
pub struct FrameGenerator {
    timer_stop_tx: Option<Sender<()>>,
    timer: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<GeneratorCounters>,
}

impl FrameGenerator {
    pub fn spawn(
        config: &GeneratorConfig,
        link: Arc<dyn AudioLink>,
        ring: Arc<OutboundRing>,
    ) -> std::io::Result<Self> {
        let counters = Arc::new(GeneratorCounters::default());
        let (signal_tx, signal_rx) = bounded::<()>(1);
        let (timer_stop_tx, timer_stop_rx) = bounded::<()>(1);

        let worker = {
            let mut work = Work {
                pacer: FramePacer::new(config.frame_period()),
                silence: vec![0u8; CodecTag::Wideband.frame_bytes()],
                link,
                ring,
                counters: counters.clone(),
            };
            thread::Builder::new()
                .name("audio-generator".to_string())
                .spawn(move || work.run(signal_rx))?
        };

        let timer = {
            let counters = counters.clone();
            let period = config.tick();
            thread::Builder::new()
                .name("audio-generator-timer".to_string())
                .spawn(move || run_timer(period, signal_tx, timer_stop_rx, counters))
        };
        // Dropping the worker's signal sender (inside the failed closure)
        // lets the worker exit on its own
        let timer = match timer {
            Ok(handle) => handle,
            Err(e) => {
                let _ = worker.join();
                return Err(e);
            }
        };

        Ok(Self {
            timer_stop_tx: Some(timer_stop_tx),
            timer: Some(timer),
            worker: Some(worker),
            counters,
        })
    }

    /// Stop the tick source. The worker finishes the tick in progress and
    /// exits once the signal channel disconnects.
    pub fn stop_timer(&mut self) {
        self.timer_stop_tx.take();
        if let Some(handle) = self.timer.take() {
            if handle.join().is_err() {
                tracing::error!("generator timer thread panicked");
            }
        }
    }

    /// Stop the timer and join the worker
    pub fn stop(&mut self) {
        self.stop_timer();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("generator thread panicked");
            }
        }
    }

    pub fn stats(&self) -> GeneratorStats {
        let c = &self.counters;
        GeneratorStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            missed_ticks: c.missed_ticks.load(Ordering::Relaxed),
            idle_ticks: c.idle_ticks.load(Ordering::Relaxed),
            frames_generated: c.frames_generated.load(Ordering::Relaxed),
            frames_skipped: c.frames_skipped.load(Ordering::Relaxed),
            ready_notifications: c.ready_notifications.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FrameGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_timer(
    period: Duration,
    signal_tx: Sender<()>,
    stop_rx: Receiver<()>,
    counters: Arc<GeneratorCounters>,
) {
    let ticker = tick(period);
    loop {
        select! {
            recv(ticker) -> _ => {
                counters.ticks.fetch_add(1, Ordering::Relaxed);
                match signal_tx.try_send(()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(())) => {
                        counters.missed_ticks.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(())) => break,
                }
            }
            recv(stop_rx) -> _ => break,
        }
    }
}

struct Work {
    pacer: FramePacer,
    silence: Vec<u8>,
    link: Arc<dyn AudioLink>,
    ring: Arc<OutboundRing>,
    counters: Arc<GeneratorCounters>,
}

impl Work {
    fn run(&mut self, signal_rx: Receiver<()>) {
        tracing::debug!(period = ?self.pacer.period(), "outbound generator started");
        while signal_rx.recv().is_ok() {
            self.on_tick(Instant::now());
        }
        tracing::debug!("outbound generator finished");
    }

    fn on_tick(&mut self, now: Instant) {
        let Some(codec) = self.link.current_codec() else {
            self.counters.idle_ticks.fetch_add(1, Ordering::Relaxed);
            self.pacer.reset();
            return;
        };

        if !self.pacer.poll(now) {
            return;
        }

        let frame_bytes = codec.frame_bytes();
        match self.ring.push_frame(&self.silence[..frame_bytes]) {
            Some(occupancy) => {
                self.counters.frames_generated.fetch_add(1, Ordering::Relaxed);
                // Nudge the link while it has between one and three frames to pull
                if (frame_bytes..3 * frame_bytes).contains(&occupancy) {
                    self.counters.ready_notifications.fetch_add(1, Ordering::Relaxed);
                    self.link.outbound_ready();
                }
            }
            None => {
                self.counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::link::SharedLink;

    fn frames_over(tick: Duration, period: Duration, total: Duration) -> usize {
        let mut pacer = FramePacer::new(period);
        let start = Instant::now();
        let mut t = Duration::ZERO;
        let mut frames = 0;
        while t < total {
            if pacer.poll(start + t) {
                frames += 1;
            }
            t += tick;
        }
        frames
    }

    #[test]
    fn test_pacer_matches_block_rate() {
        let frames = frames_over(
            Duration::from_millis(4),
            Duration::from_micros(7_500),
            Duration::from_secs(1),
        );
        assert!((132..=134).contains(&frames), "got {frames}");
    }

    #[test]
    fn test_pacer_one_frame_per_poll() {
        let mut pacer = FramePacer::new(Duration::from_millis(10));
        let start = Instant::now();
        assert!(pacer.poll(start));
        assert!(!pacer.poll(start + Duration::from_millis(5)));

        // Long stall: one frame, then the schedule restarts from now
        let late = start + Duration::from_millis(100);
        assert!(pacer.poll(late));
        assert!(!pacer.poll(late + Duration::from_millis(1)));
        assert!(!pacer.poll(late + Duration::from_millis(9)));
        assert!(pacer.poll(late + Duration::from_millis(10)));
    }

    #[test]
    fn test_pacer_reset() {
        let mut pacer = FramePacer::new(Duration::from_millis(10));
        let start = Instant::now();
        assert!(pacer.poll(start));
        pacer.reset();
        assert!(pacer.poll(start + Duration::from_millis(1)));
    }

    fn work(link: Arc<SharedLink>, ring: Arc<OutboundRing>) -> Work {
        Work {
            pacer: FramePacer::new(Duration::from_micros(7_500)),
            silence: vec![0u8; CodecTag::Wideband.frame_bytes()],
            link,
            ring,
            counters: Arc::new(GeneratorCounters::default()),
        }
    }

    #[test]
    fn test_tick_without_codec_is_idle() {
        let link = Arc::new(SharedLink::new());
        let ring = Arc::new(OutboundRing::new(1_000));
        let mut w = work(link, ring.clone());

        w.on_tick(Instant::now());
        assert!(ring.is_empty());
        assert_eq!(w.counters.idle_ticks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_ready_notification_window() {
        let link = Arc::new(SharedLink::with_codec(CodecTag::Narrowband));
        let ring = Arc::new(OutboundRing::new(1_000));
        let mut w = work(link.clone(), ring.clone());

        let start = Instant::now();
        for i in 0..4 {
            w.on_tick(start + Duration::from_micros(7_500 * i));
        }

        // Occupancy 120, 240 notify; 360, 480 do not
        assert_eq!(ring.len(), 480);
        assert_eq!(link.ready_notifications(), 2);
    }

    #[test]
    fn test_full_ring_skips_frames() {
        let link = Arc::new(SharedLink::with_codec(CodecTag::Wideband));
        let ring = Arc::new(OutboundRing::new(300));
        let mut w = work(link, ring.clone());

        let start = Instant::now();
        w.on_tick(start);
        w.on_tick(start + Duration::from_micros(7_500));
        assert_eq!(ring.len(), 240);
        assert_eq!(w.counters.frames_skipped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_generator_threads_fill_ring() {
        let link = Arc::new(SharedLink::with_codec(CodecTag::Narrowband));
        let ring = Arc::new(OutboundRing::new(120 * 200));
        let mut generator =
            FrameGenerator::spawn(&GeneratorConfig::default(), link, ring.clone()).unwrap();

        thread::sleep(Duration::from_millis(300));
        generator.stop();

        // ~40 frames at 7.5 ms; loose bounds for scheduler noise
        let frames = generator.stats().frames_generated;
        assert!((10..=60).contains(&frames), "got {frames}");
        assert_eq!(ring.len() as u64, frames * 120);

        // Nothing runs after stop
        thread::sleep(Duration::from_millis(30));
        assert_eq!(generator.stats().frames_generated, frames);
    }
}
