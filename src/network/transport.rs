//! Network transport thread
//!
//! Owns the TCP socket for one streaming session. The only component allowed
//! to block: on connect, on send, on the bounded queue pop and on the retry
//! wait. Every failure is absorbed here; nothing propagates to the capture
//! path except the connection state.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::codec::framer::WirePacket;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::network::queue::TransferQueue;
use crate::network::state::{ConnectionState, ConnectionStateMachine};
use crate::network::Reachability;
use crate::protocol::SessionHeader;
use crate::ratelimit::RateLimiter;

/// Produces the session header at connect time (the codec may change
/// between reconnects)
pub type HeaderSource = Arc<dyn Fn() -> SessionHeader + Send + Sync>;

/// Transport counters
#[derive(Default)]
pub struct TransportStats {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    disconnects: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    partial_sends: AtomicU64,
    send_errors: AtomicU64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            partial_sends: self.partial_sends.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TransportStatsSnapshot {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub disconnects: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub partial_sends: u64,
    pub send_errors: u64,
}

/// Everything the transport thread needs
pub struct TransportContext {
    pub addr: SocketAddrV4,
    pub config: TransportConfig,
    pub queue: Arc<TransferQueue>,
    pub state: Arc<ConnectionStateMachine>,
    pub stats: Arc<TransportStats>,
    pub header: HeaderSource,
    pub reachability: Arc<dyn Reachability>,
}

/// Handle to a running transport thread
pub struct TransportTask {
    running: Arc<AtomicBool>,
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TransportTask {
    /// Spawn the transport thread
    pub fn spawn(ctx: TransportContext) -> Result<Self, TransportError> {
        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let worker = Worker {
            ctx,
            running: running.clone(),
            shutdown_rx,
            partial_log: RateLimiter::new(Duration::from_secs(1)),
        };

        let handle = thread::Builder::new()
            .name("audio-transport".to_string())
            .spawn(move || worker.run())
            .map_err(TransportError::Spawn)?;

        Ok(Self {
            running,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit without waiting for it. The caller should also
    /// close the queue so a pending pop returns immediately.
    pub fn signal_stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Disconnecting the channel interrupts a retry wait
        self.shutdown_tx.take();
    }

    /// Signal and join
    pub fn stop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("transport thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for TransportTask {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    ctx: TransportContext,
    running: Arc<AtomicBool>,
    shutdown_rx: Receiver<()>,
    partial_log: RateLimiter,
}

impl Worker {
    fn run(self) {
        tracing::info!(server = %self.ctx.addr, "audio transport started");
        let mut conn: Option<TcpStream> = None;

        while self.running.load(Ordering::Relaxed) {
            if conn.is_none() {
                match self.connect() {
                    Ok(stream) => conn = Some(stream),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            retry_in_ms = self.ctx.config.retry_delay_ms,
                            "failed to connect to audio server"
                        );
                        if !self.wait_retry() {
                            break;
                        }
                    }
                }
                continue;
            }
            let Some(stream) = conn.as_mut() else {
                continue;
            };

            let result = match self.ctx.queue.pop(self.ctx.config.idle_poll()) {
                Some(packet) => self.send_packet(stream, &packet),
                None if self.ctx.queue.is_closed() => break,
                None => probe(stream),
            };

            if let Err(e) = result {
                tracing::warn!(error = %e, "audio stream connection lost");
                conn = None;
                self.ctx.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                self.ctx.state.transition(ConnectionState::Disconnected);
                if !self.wait_retry() {
                    break;
                }
            }
        }

        drop(conn);
        self.ctx.state.force_disconnected();
        tracing::info!("audio transport finished");
    }

    fn connect(&self) -> Result<TcpStream, TransportError> {
        if !self.ctx.reachability.is_reachable() {
            return Err(TransportError::ConnectFailed {
                addr: SocketAddr::V4(self.ctx.addr),
                source: io::Error::new(io::ErrorKind::NotConnected, "network unreachable"),
            });
        }

        self.ctx.state.transition(ConnectionState::Connecting);
        self.ctx.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(server = %self.ctx.addr, "connecting to audio server");

        match self.try_connect() {
            Ok(stream) => {
                self.ctx.state.transition(ConnectionState::Connected);
                tracing::info!(server = %self.ctx.addr, "connected to audio server");
                Ok(stream)
            }
            Err(e) => {
                self.ctx.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                self.ctx.state.transition(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn try_connect(&self) -> Result<TcpStream, TransportError> {
        let addr = SocketAddr::V4(self.ctx.addr);
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(TransportError::Socket)?;

        socket
            .connect_timeout(&SockAddr::from(addr), self.ctx.config.connect_timeout())
            .map_err(|source| TransportError::ConnectFailed { addr, source })?;
        socket
            .set_nodelay(self.ctx.config.tcp_nodelay)
            .map_err(TransportError::Socket)?;
        socket
            .set_write_timeout(self.ctx.config.send_timeout())
            .map_err(TransportError::Socket)?;

        let mut stream: TcpStream = socket.into();
        let header = (self.ctx.header)();
        stream
            .write_all(header.to_wire().as_bytes())
            .map_err(TransportError::HeaderSendFailed)?;
        tracing::debug!(
            sample_rate = header.sample_rate,
            codec = %header.codec,
            "session header sent"
        );

        Ok(stream)
    }

    /// One write per packet; a short write is logged and not retried
    fn send_packet(&self, stream: &mut TcpStream, packet: &WirePacket) -> Result<(), TransportError> {
        let bytes = packet.as_bytes();
        match stream.write(bytes) {
            Ok(0) => {
                self.ctx.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::PeerClosed)
            }
            Ok(sent) => {
                self.ctx.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.ctx.stats.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                if sent < bytes.len() {
                    self.ctx.stats.partial_sends.fetch_add(1, Ordering::Relaxed);
                    if let Some(suppressed) = self.partial_log.check() {
                        tracing::warn!(
                            sent,
                            expected = bytes.len(),
                            seq = packet.sequence(),
                            suppressed,
                            "partial send"
                        );
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.ctx.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::SendFailed(e))
            }
        }
    }

    /// Sleep the retry delay. Returns `false` when shutdown was requested.
    fn wait_retry(&self) -> bool {
        match self.shutdown_rx.recv_timeout(self.ctx.config.retry_delay()) {
            Err(RecvTimeoutError::Timeout) => self.running.load(Ordering::Relaxed),
            _ => false,
        }
    }
}

/// Detect a peer that closed the connection while we had nothing to send
fn probe(stream: &TcpStream) -> Result<(), TransportError> {
    stream.set_nonblocking(true).map_err(TransportError::Socket)?;
    let mut byte = [0u8; 1];
    let result = match stream.peek(&mut byte) {
        Ok(0) => Err(TransportError::PeerClosed),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(TransportError::SendFailed(e)),
    };
    stream.set_nonblocking(false).map_err(TransportError::Socket)?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::framer::frame;
    use crate::network::AlwaysReachable;
    use crate::protocol::{CodecTag, PacketHeader, PACKET_HEADER_SIZE};
    use std::io::{BufRead, BufReader, Read};
    use std::net::TcpListener;
    use std::time::Instant;

    fn context(addr: SocketAddrV4, retry_delay_ms: u64) -> TransportContext {
        TransportContext {
            addr,
            config: TransportConfig {
                retry_delay_ms,
                connect_timeout_ms: 500,
                idle_poll_ms: 50,
                ..Default::default()
            },
            queue: Arc::new(TransferQueue::new(16, 2)),
            state: Arc::new(ConnectionStateMachine::new()),
            stats: Arc::new(TransportStats::default()),
            header: Arc::new(|| SessionHeader::for_codec(CodecTag::Narrowband, 1, 16)),
            reachability: Arc::new(AlwaysReachable),
        }
    }

    fn local_addr(listener: &TcpListener) -> SocketAddrV4 {
        match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        }
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

    #[test]
    fn test_sends_header_then_packets() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ctx = context(local_addr(&listener), 5_000);
        let queue = ctx.queue.clone();
        let state = ctx.state.clone();
        let stats = ctx.stats.clone();
        let mut task = TransportTask::spawn(ctx).unwrap();

        let (conn, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(conn);
        let mut preamble = String::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            preamble.push_str(&line);
            if line == "\n" {
                break;
            }
        }
        assert_eq!(
            SessionHeader::parse(&preamble).unwrap(),
            SessionHeader::for_codec(CodecTag::Narrowband, 1, 16)
        );

        assert!(wait_for(|| state.is_connected()));
        for seq in 0..3 {
            queue.push(frame(&[seq as u8; 120], CodecTag::Narrowband, seq, 0).unwrap());
        }

        for seq in 0..3 {
            let mut header = [0u8; PACKET_HEADER_SIZE];
            reader.read_exact(&mut header).unwrap();
            let header = PacketHeader::decode(&header).unwrap();
            assert_eq!(header.sequence, seq);
            let mut payload = vec![0u8; header.payload_len as usize];
            reader.read_exact(&mut payload).unwrap();
            assert!(payload.iter().all(|&b| b == seq as u8));
        }

        assert!(wait_for(|| stats.snapshot().packets_sent == 3));
        queue.close();
        task.stop();
        assert_eq!(state.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_failed_connect_waits_retry_delay() {
        // Grab a free port, then close it so nothing is listening
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            local_addr(&listener)
        };
        let ctx = context(addr, 5_000);
        let state = ctx.state.clone();
        let stats = ctx.stats.clone();
        let queue = ctx.queue.clone();
        let mut task = TransportTask::spawn(ctx).unwrap();

        assert!(wait_for(|| stats.snapshot().connect_failures == 1));
        thread::sleep(Duration::from_millis(300));
        assert!(!state.is_connected());
        assert_eq!(
            state.transition_count(ConnectionState::Connecting, ConnectionState::Disconnected),
            1
        );
        assert_eq!(stats.snapshot().connect_attempts, 1);

        // Stop interrupts the 5 s retry wait
        let start = Instant::now();
        queue.close();
        task.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_reconnects_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ctx = context(local_addr(&listener), 100);
        let state = ctx.state.clone();
        let stats = ctx.stats.clone();
        let queue = ctx.queue.clone();
        let mut task = TransportTask::spawn(ctx).unwrap();

        let (first, _) = listener.accept().unwrap();
        assert!(wait_for(|| state.is_connected()));
        drop(first);

        // Idle probe notices the close, then the loop reconnects
        let (_second, _) = listener.accept().unwrap();
        assert!(wait_for(|| stats.snapshot().connect_attempts == 2 && state.is_connected()));
        assert_eq!(
            state.transition_count(ConnectionState::Connected, ConnectionState::Disconnected),
            1
        );
        assert_eq!(stats.snapshot().disconnects, 1);

        queue.close();
        task.stop();
    }

    /// Keeps the queue non-empty so the worker stays on the send path
    struct Feeder {
        running: Arc<AtomicBool>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl Feeder {
        fn start(queue: Arc<TransferQueue>, payload_len: usize, pause: Duration) -> Self {
            let running = Arc::new(AtomicBool::new(true));
            let handle = {
                let running = running.clone();
                thread::spawn(move || {
                    let payload = vec![0u8; payload_len];
                    let mut seq = 0u32;
                    while running.load(Ordering::Relaxed) {
                        queue.push(frame(&payload, CodecTag::Narrowband, seq, 0).unwrap());
                        seq = seq.wrapping_add(1);
                        thread::sleep(pause);
                    }
                })
            };
            Self {
                running,
                handle: Some(handle),
            }
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::Relaxed);
            if let Some(handle) = self.handle.take() {
                handle.join().unwrap();
            }
        }
    }

    #[test]
    fn test_reset_while_streaming_reconnects_after_delay() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ctx = context(local_addr(&listener), 300);
        let state = ctx.state.clone();
        let stats = ctx.stats.clone();
        let queue = ctx.queue.clone();
        let mut task = TransportTask::spawn(ctx).unwrap();

        let (first, _) = listener.accept().unwrap();
        assert!(wait_for(|| state.is_connected()));
        let mut feeder = Feeder::start(queue.clone(), 120, Duration::from_millis(1));
        assert!(wait_for(|| stats.snapshot().packets_sent >= 5));

        // Abortive close: the peer answers further writes with RST
        socket2::SockRef::from(&first)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        let reset_at = Instant::now();
        drop(first);

        let (_second, _) = listener.accept().unwrap();
        assert!(reset_at.elapsed() >= Duration::from_millis(300));
        assert!(wait_for(|| state.is_connected() && stats.snapshot().connect_attempts == 2));

        let snapshot = stats.snapshot();
        assert!(snapshot.send_errors >= 1);
        assert_eq!(snapshot.disconnects, 1);
        assert_eq!(
            state.transition_count(ConnectionState::Connected, ConnectionState::Disconnected),
            1
        );

        feeder.stop();
        queue.close();
        task.stop();
    }

    #[test]
    fn test_stalled_peer_counts_partial_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut ctx = context(local_addr(&listener), 50);
        ctx.config.send_timeout_ms = 100;
        let stats = ctx.stats.clone();
        let queue = ctx.queue.clone();
        let mut task = TransportTask::spawn(ctx).unwrap();

        // Accepted but never read: socket buffers fill and a write times out
        // part way through a packet
        let (_stalled, _) = listener.accept().unwrap();
        let mut feeder = Feeder::start(queue.clone(), 60_000, Duration::from_micros(200));

        assert!(wait_for(|| stats.snapshot().partial_sends >= 1));
        let snapshot = stats.snapshot();
        assert!(snapshot.packets_sent >= snapshot.partial_sends);

        feeder.stop();
        queue.close();
        task.stop();
    }

    struct Offline;

    impl Reachability for Offline {
        fn is_reachable(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_unreachable_network_skips_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut ctx = context(local_addr(&listener), 20);
        ctx.reachability = Arc::new(Offline);
        let stats = ctx.stats.clone();
        let queue = ctx.queue.clone();
        let mut task = TransportTask::spawn(ctx).unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(stats.snapshot().connect_attempts, 0);

        queue.close();
        task.stop();
    }
}
