//! Streaming session
//!
//! A [`StreamSession`] owns every piece of the pipeline for one receiver:
//! queue, packet pool, framer, outbound ring, diagnostics and the worker
//! threads. The voice link talks to it through a cloneable [`LinkEndpoint`].

use serde::Serialize;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::buffer::{OutboundRing, RingStats};
use crate::audio::capture::{
    CaptureContext, CaptureOutcome, CaptureStats, EnqueueError, InboundCapture, SessionClock,
};
use crate::audio::diagnostics::{
    DiagnosticsReporter, PipelineCounters, SequenceGapTracker, SignalDiagnostics,
};
use crate::audio::generator::{FrameGenerator, GeneratorStats};
use crate::audio::link::AudioLink;
use crate::audio::pool::PacketPool;
use crate::codec::framer::{FramerStats, PacketFramer};
use crate::config::AppConfig;
use crate::error::{Result, StateError};
use crate::network::queue::{QueueStats, TransferQueue};
use crate::network::state::{ConnectionState, ConnectionStateMachine, TransitionStats};
use crate::network::transport::{
    HeaderSource, TransportContext, TransportStats, TransportStatsSnapshot, TransportTask,
};
use crate::network::{AlwaysReachable, Reachability};
use crate::protocol::{CodecTag, SessionHeader, PACKET_HEADER_SIZE};

/// Result of [`StreamSession::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Queued,
    /// Queued, but the queue was full and this many older packets were dropped
    Evicted(usize),
}

/// Result of [`StreamSession::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped {
        dropped_packets: usize,
        dropped_bytes: usize,
    },
    /// The session was not running; nothing was touched
    NotActive,
}

/// Snapshot of the whole pipeline
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub running: bool,
    pub server: String,
    pub connection: ConnectionState,
    pub transitions: TransitionStats,
    pub queue: QueueStats,
    pub capture: CaptureStats,
    pub framer: FramerStats,
    pub transport: TransportStatsSnapshot,
    pub outbound: RingStats,
    pub generator: Option<GeneratorStats>,
    pub pool_available: usize,
    pub pool_exhausted: u64,
}

/// Calls the voice link makes into the bridge
#[derive(Clone)]
pub struct LinkEndpoint {
    capture: InboundCapture,
    ring: Arc<OutboundRing>,
}

impl LinkEndpoint {
    /// Inbound PCM block from the link. Never blocks, never fails.
    pub fn deliver_inbound(&self, chunk: &[u8]) -> CaptureOutcome {
        self.capture.deliver(chunk)
    }

    /// Fill `buf` with outbound PCM. Returns the number of bytes written,
    /// which may be less than requested.
    pub fn request_outbound(&self, buf: &mut [u8]) -> usize {
        self.ring.read(buf)
    }
}

struct Workers {
    transport: TransportTask,
    generator: FrameGenerator,
    reporter: Option<DiagnosticsReporter>,
}

pub struct StreamSession {
    config: AppConfig,
    addr: SocketAddrV4,
    link: Arc<dyn AudioLink>,
    reachability: Arc<dyn Reachability>,
    state: Arc<ConnectionStateMachine>,
    queue: Arc<TransferQueue>,
    pool: PacketPool,
    framer: Arc<PacketFramer>,
    gaps: Arc<SequenceGapTracker>,
    diagnostics: Arc<SignalDiagnostics>,
    clock: Arc<SessionClock>,
    ring: Arc<OutboundRing>,
    capture: InboundCapture,
    transport_stats: Arc<TransportStats>,
    running: AtomicBool,
    workers: Option<Workers>,
}

impl StreamSession {
    /// Validate the configuration and allocate the pipeline. No threads are
    /// started and no connection is made until [`start`](Self::start).
    pub fn init(config: AppConfig, link: Arc<dyn AudioLink>) -> Result<Self> {
        let addr = config.stream.validate()?;

        let queue = Arc::new(TransferQueue::new(
            config.stream.queue_capacity,
            config.stream.evict_batch,
        ));
        // One extra buffer on its way out of the transport, one being framed
        let pool = PacketPool::new(
            config.stream.queue_capacity + 2,
            PACKET_HEADER_SIZE + CodecTag::Wideband.frame_bytes(),
        );
        let state = Arc::new(ConnectionStateMachine::new());
        let framer = Arc::new(PacketFramer::new());
        let gaps = Arc::new(SequenceGapTracker::new());
        let diagnostics = Arc::new(SignalDiagnostics::new());
        let clock = Arc::new(SessionClock::new());
        let ring = Arc::new(OutboundRing::new(config.generator.ring_capacity));

        let capture = InboundCapture::new(CaptureContext {
            link: link.clone(),
            state: state.clone(),
            queue: queue.clone(),
            pool: pool.clone(),
            framer: framer.clone(),
            diagnostics: diagnostics.clone(),
            gaps: gaps.clone(),
            clock: clock.clone(),
            fallback_codec: CodecTag::from_sample_rate(config.stream.sample_rate),
            log_interval: config.diagnostics.log_interval(),
        });

        tracing::info!(
            server = %addr,
            queue_capacity = queue.capacity(),
            "audio streaming initialized"
        );

        Ok(Self {
            config,
            addr,
            link,
            reachability: Arc::new(AlwaysReachable),
            state,
            queue,
            pool,
            framer,
            gaps,
            diagnostics,
            clock,
            ring,
            capture,
            transport_stats: Arc::new(TransportStats::default()),
            running: AtomicBool::new(false),
            workers: None,
        })
    }

    /// Gate connection attempts on network availability
    pub fn with_reachability(mut self, reachability: Arc<dyn Reachability>) -> Self {
        self.reachability = reachability;
        self
    }

    /// Start the transport, generator and diagnostics threads. Starting a
    /// running session is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.workers.is_some() {
            tracing::debug!("audio streaming already running");
            return Ok(());
        }

        self.queue.reopen();
        self.framer.reset();
        self.gaps.reset();
        self.clock.restart();
        self.capture.reset_logs();
        self.ring.clear();

        let mut transport = TransportTask::spawn(TransportContext {
            addr: self.addr,
            config: self.config.transport.clone(),
            queue: self.queue.clone(),
            state: self.state.clone(),
            stats: self.transport_stats.clone(),
            header: self.header_source(),
            reachability: self.reachability.clone(),
        })?;

        let generator =
            match FrameGenerator::spawn(&self.config.generator, self.link.clone(), self.ring.clone()) {
                Ok(generator) => generator,
                Err(e) => {
                    self.queue.close();
                    transport.stop();
                    return Err(e.into());
                }
            };

        let reporter = if self.config.diagnostics.enabled {
            match DiagnosticsReporter::spawn(
                self.diagnostics.clone(),
                self.config.diagnostics.report_period(),
                self.state.subscribe(),
                self.counter_source(),
            ) {
                Ok(reporter) => Some(reporter),
                Err(e) => {
                    tracing::warn!(error = %e, "diagnostics reporter unavailable");
                    None
                }
            }
        } else {
            None
        };

        self.workers = Some(Workers {
            transport,
            generator,
            reporter,
        });
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(server = %self.addr, "audio streaming started");
        Ok(())
    }

    /// Stop all threads and discard buffered audio. Safe to call at any time.
    pub fn stop(&mut self) -> StopOutcome {
        let Some(mut workers) = self.workers.take() else {
            return StopOutcome::NotActive;
        };
        self.running.store(false, Ordering::SeqCst);

        workers.generator.stop_timer();

        self.queue.close();
        workers.transport.signal_stop();

        workers.generator.stop();
        workers.transport.stop();
        if let Some(reporter) = workers.reporter.as_mut() {
            reporter.stop();
        }

        let dropped_packets = self.queue.drain();
        let dropped_bytes = self.ring.clear();

        self.framer.reset();
        self.gaps.reset();
        self.state.force_disconnected();

        tracing::info!(dropped_packets, dropped_bytes, "audio streaming stopped");
        StopOutcome::Stopped {
            dropped_packets,
            dropped_bytes,
        }
    }

    /// Queue `payload` for the receiver with the next sequence number
    pub fn send(&self, payload: &[u8]) -> Result<SendStatus> {
        if !self.is_running() {
            return Err(StateError::NotActive.into());
        }
        if payload.is_empty() {
            return Err(StateError::EmptyPayload.into());
        }

        match self.capture.enqueue(payload) {
            Ok(0) => Ok(SendStatus::Queued),
            Ok(evicted) => Ok(SendStatus::Evicted(evicted)),
            Err(EnqueueError::Pool(e)) => Err(e.into()),
            Err(EnqueueError::Codec(e)) => Err(e.into()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Handle for the voice link's inbound and outbound callbacks
    pub fn link_endpoint(&self) -> LinkEndpoint {
        LinkEndpoint {
            capture: self.capture.clone(),
            ring: self.ring.clone(),
        }
    }

    pub fn state(&self) -> &ConnectionStateMachine {
        &self.state
    }

    pub fn server(&self) -> SocketAddrV4 {
        self.addr
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            running: self.is_running(),
            server: self.addr.to_string(),
            connection: self.state.current(),
            transitions: self.state.stats(),
            queue: self.queue.stats(),
            capture: self.capture.stats(),
            framer: self.framer.stats(),
            transport: self.transport_stats.snapshot(),
            outbound: self.ring.stats(),
            generator: self.workers.as_ref().map(|w| w.generator.stats()),
            pool_available: self.pool.available(),
            pool_exhausted: self.pool.exhausted_count(),
        }
    }

    /// Stop and release everything
    pub fn deinit(mut self) {
        self.stop();
        tracing::info!("audio streaming deinitialized");
    }

    fn header_source(&self) -> HeaderSource {
        let link = self.link.clone();
        let stream = self.config.stream.clone();
        Arc::new(move || {
            let codec = link
                .current_codec()
                .unwrap_or_else(|| CodecTag::from_sample_rate(stream.sample_rate));
            SessionHeader::for_codec(codec, stream.channels, stream.bits_per_sample)
        })
    }

    fn counter_source(&self) -> Box<dyn Fn() -> PipelineCounters + Send> {
        let transport = self.transport_stats.clone();
        let queue = self.queue.clone();
        let capture = self.capture.clone();
        Box::new(move || {
            let c = capture.stats();
            PipelineCounters {
                packets_sent: transport.snapshot().packets_sent,
                queued: queue.len(),
                evicted: c.evicted,
                dropped_not_connected: c.dropped_not_connected,
                estimated_lost: c.estimated_lost,
            }
        })
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::link::SharedLink;
    use crate::error::Error;
    use crate::protocol::PacketHeader;
    use std::io::{BufRead, BufReader, Read};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    fn config(port: u16) -> AppConfig {
        let mut config = AppConfig::default();
        config.stream.server_ip = "127.0.0.1".to_string();
        config.stream.server_port = port;
        config.transport.idle_poll_ms = 50;
        config.transport.connect_timeout_ms = 500;
        config
    }

    fn session(port: u16) -> StreamSession {
        let link = Arc::new(SharedLink::with_codec(CodecTag::Narrowband));
        StreamSession::init(config(port), link).unwrap()
    }

    fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr.port(),
            SocketAddr::V6(addr) => addr.port(),
        };
        (listener, port)
    }

    fn unused_port() -> u16 {
        listener().1
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Accept one connection and consume the session header
    fn accept(listener: &TcpListener) -> (BufReader<TcpStream>, SessionHeader) {
        let (conn, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(conn);
        let mut text = String::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            text.push_str(&line);
            if line == "\n" {
                break;
            }
        }
        (reader, SessionHeader::parse(&text).unwrap())
    }

    fn read_packet(reader: &mut BufReader<TcpStream>) -> (PacketHeader, Vec<u8>) {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        reader.read_exact(&mut header).unwrap();
        let header = PacketHeader::decode(&header).unwrap();
        let mut payload = vec![0u8; header.payload_len as usize];
        reader.read_exact(&mut payload).unwrap();
        (header, payload)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config(9000);
        config.stream.server_ip = "nope".to_string();
        let link = Arc::new(SharedLink::new());
        assert!(matches!(
            StreamSession::init(config, link),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_stop_when_never_started() {
        let mut session = session(unused_port());
        assert_eq!(session.stop(), StopOutcome::NotActive);
        assert!(!session.is_running());
        assert_eq!(session.state().current(), ConnectionState::Disconnected);
        assert_eq!(session.status().transport.connect_attempts, 0);
    }

    #[test]
    fn test_send_requires_running_session() {
        let mut session = session(unused_port());
        assert!(matches!(
            session.send(&[0; 120]),
            Err(Error::InvalidState(StateError::NotActive))
        ));

        session.start().unwrap();
        assert!(matches!(
            session.send(&[]),
            Err(Error::InvalidState(StateError::EmptyPayload))
        ));
        assert_eq!(session.send(&[0; 120]).unwrap(), SendStatus::Queued);
        session.stop();
    }

    #[test]
    fn test_start_twice_is_noop() {
        let mut session = session(unused_port());
        session.start().unwrap();
        session.start().unwrap();
        assert!(session.is_running());

        assert!(matches!(session.stop(), StopOutcome::Stopped { .. }));
        assert_eq!(session.stop(), StopOutcome::NotActive);
    }

    #[test]
    fn test_no_server_stays_disconnected() {
        let mut session = session(unused_port());
        session.start().unwrap();
        thread::sleep(Duration::from_millis(500));

        assert!(!session.is_connected());
        assert_eq!(
            session
                .state()
                .transition_count(ConnectionState::Connecting, ConnectionState::Disconnected),
            1
        );

        // Inbound audio is dropped, not queued
        let endpoint = session.link_endpoint();
        assert_eq!(endpoint.deliver_inbound(&[0; 120]), CaptureOutcome::NotConnected);
        assert!(session.status().queue.len == 0);

        // Stop interrupts the 5 s retry wait
        let started = Instant::now();
        session.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_streams_inbound_audio_to_server() {
        let (listener, port) = listener();
        let mut session = session(port);
        session.start().unwrap();

        let (mut reader, header) = accept(&listener);
        assert_eq!(header.codec, CodecTag::Narrowband);
        assert_eq!(header.sample_rate, 8_000);
        assert!(wait_for(|| session.is_connected()));

        let endpoint = session.link_endpoint();
        for i in 0..10u8 {
            assert_eq!(endpoint.deliver_inbound(&[i; 120]), CaptureOutcome::Queued);
        }

        for i in 0..10u8 {
            let (header, payload) = read_packet(&mut reader);
            assert_eq!(header.sequence, i as u32);
            assert_eq!(header.payload_len, 120);
            assert_eq!(header.codec.wire_tag(), 1);
            assert!(payload.iter().all(|&b| b == i));
        }

        session.stop();
        assert!(!session.is_connected());
    }

    #[test]
    fn test_sequence_resets_after_restart() {
        let (listener, port) = listener();
        let mut session = session(port);

        session.start().unwrap();
        let (mut reader, _) = accept(&listener);
        assert!(wait_for(|| session.is_connected()));
        for _ in 0..3 {
            session.send(&[1; 120]).unwrap();
        }
        for seq in 0..3 {
            assert_eq!(read_packet(&mut reader).0.sequence, seq);
        }
        session.stop();

        session.start().unwrap();
        let (mut reader, _) = accept(&listener);
        assert!(wait_for(|| session.is_connected()));
        session.send(&[2; 120]).unwrap();
        assert_eq!(read_packet(&mut reader).0.sequence, 0);
        session.stop();
    }

    #[test]
    fn test_outbound_silence_is_pulled() {
        let mut session = session(unused_port());
        session.start().unwrap();
        let endpoint = session.link_endpoint();

        let mut buf = [0xffu8; 60];
        assert!(wait_for(|| session.status().outbound.len >= 120));
        assert_eq!(endpoint.request_outbound(&mut buf), 60);
        assert!(buf.iter().all(|&b| b == 0));

        session.stop();
        assert_eq!(endpoint.request_outbound(&mut buf), 0);
    }
}
