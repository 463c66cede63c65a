//! Audio Receiver Application
//!
//! Reference sink for the bridge: accepts one stream at a time, decodes the
//! session header and packets, logs loss and arrival timing, writes every
//! packet to `packet_log.csv` and the audio to rolling 5 s WAV segments.
//!
//! Usage: `receiver [listen_port] [output_dir]`

use anyhow::{Context, Result};
use std::fs::File;
use std::future::Future;
use std::io::{self, BufWriter};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sco_stream_bridge::{
    codec::decoder::{ArrivalTimer, DecodedEvent, LossTracker, SequenceClass, StreamDecoder},
    codec::recording::{
        remove_segments, EdgeTracker, PacketLog, PacketRecord, PcmFormat, SegmentRecorder,
        EDGE_JUMP_THRESHOLD,
    },
    constants::DEFAULT_SERVER_PORT,
    protocol::PacketHeader,
    ratelimit::RateLimiter,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);
const SEGMENT_PERIOD: Duration = Duration::from_secs(5);
const PACKET_LOG_FILE: &str = "packet_log.csv";

/// Files shared by every client of one server run
struct Outputs {
    log: PacketLog<BufWriter<File>>,
    segments: SegmentRecorder,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port: u16 = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("invalid port {:?}", arg))?,
        None => DEFAULT_SERVER_PORT,
    };
    let out_dir = std::env::args()
        .nth(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    tracing::info!("Listening on {}", bind);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let totals = serve(listener, &out_dir, shutdown).await?;

    tracing::info!(
        "Server stopped after {} client(s), {} packets",
        totals.clients,
        totals.packets
    );
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Totals {
    clients: u64,
    packets: u64,
}

/// Accept and record clients one after another until `shutdown` resolves,
/// including while a client is streaming.
async fn serve(
    listener: TcpListener,
    out_dir: &Path,
    shutdown: impl Future<Output = ()>,
) -> Result<Totals> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let removed = remove_segments(out_dir)?;
    if removed > 0 {
        tracing::info!("Removed {} old segment(s)", removed);
    }

    let log_path = out_dir.join(PACKET_LOG_FILE);
    let log = PacketLog::create(&log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    let started = Instant::now();
    let mut outputs = Outputs {
        log,
        segments: SegmentRecorder::new(out_dir, SEGMENT_PERIOD, started),
    };
    let mut totals = Totals::default();
    tokio::pin!(shutdown);

    loop {
        tracing::info!("Waiting for client...");
        let accepted = tokio::select! {
            accepted = listener.accept() => Some(accepted?),
            _ = &mut shutdown => None,
        };
        let Some((stream, peer)) = accepted else {
            break;
        };
        tracing::info!("Client connected: {}", peer);
        totals.clients += 1;

        let mut reception = Reception::new(started);
        let finished = tokio::select! {
            result = reception.run(stream, &mut outputs) => Some(result),
            _ = &mut shutdown => None,
        };
        totals.packets += reception.finish(&mut outputs);

        match finished {
            Some(Ok(())) => {}
            Some(Err(e)) => tracing::warn!("Stream from {} failed: {}", peer, e),
            None => break,
        }
    }

    tracing::info!("Shutting down");
    outputs.log.flush()?;
    tracing::info!("Packet log saved to {}", log_path.display());
    Ok(totals)
}

/// Per-client decoding and recording state
struct Reception {
    decoder: StreamDecoder,
    loss: LossTracker,
    arrivals: ArrivalTimer,
    edges: EdgeTracker,
    started: Instant,
    connected: Instant,
    last_stats: Instant,
    log_errors: RateLimiter,
}

impl Reception {
    fn new(started: Instant) -> Self {
        let now = Instant::now();
        Self {
            decoder: StreamDecoder::new(),
            loss: LossTracker::new(),
            arrivals: ArrivalTimer::new(),
            edges: EdgeTracker::new(),
            started,
            connected: now,
            last_stats: now,
            log_errors: RateLimiter::new(STATS_INTERVAL),
        }
    }

    async fn run(&mut self, mut stream: TcpStream, out: &mut Outputs) -> Result<()> {
        let mut buf = vec![0u8; 4096];

        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                tracing::info!("Client disconnected");
                return Ok(());
            }
            self.decoder.feed(&buf[..n]);

            while let Some(event) = self.decoder.next_event() {
                self.handle(event, out);
            }

            if self.last_stats.elapsed() >= STATS_INTERVAL {
                self.last_stats = Instant::now();
                self.log_stats();
            }
        }
    }

    fn handle(&mut self, event: DecodedEvent, out: &mut Outputs) {
        match event {
            DecodedEvent::Session(header) => {
                tracing::info!(
                    "Header: {}Hz {}ch {}bit {}",
                    header.sample_rate,
                    header.channels,
                    header.bits_per_sample,
                    header.codec
                );
                let saved = out.segments.set_format(PcmFormat::from(&header), Instant::now());
                note_saved(saved);
            }
            DecodedEvent::NoSession => {
                tracing::warn!("No session header, assuming raw packet stream");
            }
            DecodedEvent::Resync { skipped } => {
                tracing::warn!("Resync: skipped {} bytes", skipped);
            }
            DecodedEvent::Packet { header, payload } => self.on_packet(&header, &payload, out),
        }
    }

    fn on_packet(&mut self, header: &PacketHeader, payload: &[u8], out: &mut Outputs) {
        let now = Instant::now();
        let seq = header.sequence;

        if let Some(gap) = self.arrivals.observe(now) {
            tracing::warn!(
                "Inter-packet gap {:.2} ms (avg ~{:.2} ms) seq={}",
                gap.as_secs_f64() * 1000.0,
                self.arrivals.average().as_secs_f64() * 1000.0,
                seq
            );
        }

        let shape = self.edges.observe(payload);
        if shape.edge_jump > EDGE_JUMP_THRESHOLD {
            tracing::warn!("Edge jump {} at seq={}", shape.edge_jump, seq);
        }

        let expected = self.loss.expected().unwrap_or(seq);
        let class = self.loss.observe(seq);
        match class {
            SequenceClass::Start => {
                tracing::info!("First packet seq={} codec={}", seq, header.codec)
            }
            SequenceClass::Gap(gap) => {
                tracing::warn!("Gap of {} packet(s): expected {}, got {}", gap, expected, seq)
            }
            SequenceClass::Reorder => tracing::warn!("Reorder: got {} behind {}", seq, expected),
            SequenceClass::Reset => tracing::warn!("Sequence reset at seq={}", seq),
            SequenceClass::Dup | SequenceClass::Cont => {}
        }

        let stats = self.loss.stats();
        let record = PacketRecord {
            time: now.saturating_duration_since(self.started),
            sequence: seq,
            expected,
            class,
            lost_total: stats.missed,
            dup_total: stats.duplicates,
            reorder_total: stats.reordered,
            delta: self.arrivals.last_delta(),
            shape,
        };
        if let Err(e) = out.log.record(&record) {
            if let Some(suppressed) = self.log_errors.check() {
                tracing::warn!("Packet log write failed ({} suppressed): {}", suppressed, e);
            }
        }

        // Packets carry the codec too; follow it if it disagrees with the header
        let format = out.segments.format();
        let rate = header.codec.sample_rate();
        if rate != format.sample_rate {
            note_saved(out.segments.set_format(
                PcmFormat {
                    sample_rate: rate,
                    ..format
                },
                now,
            ));
        }
        note_saved(out.segments.push(payload, now));
    }

    fn log_stats(&self) {
        let stats = self.loss.stats();
        let rate = stats.received as f64 / self.connected.elapsed().as_secs_f64();
        tracing::info!(
            "Stats: received={} lost={} gaps={} dup={} reorder={} max_gap={} rate={:.1}pps resyncs={}",
            stats.received,
            stats.missed,
            stats.gap_events,
            stats.duplicates,
            stats.reordered,
            stats.max_gap,
            rate,
            self.decoder.stats().resyncs
        );
    }

    /// Save the partial segment and print the summary. Returns the number of
    /// packets decoded from this client.
    fn finish(&mut self, out: &mut Outputs) -> u64 {
        note_saved(out.segments.flush(Instant::now()));
        if let Err(e) = out.log.flush() {
            tracing::warn!("Packet log flush failed: {}", e);
        }

        let stats = self.loss.stats();
        if stats.received > 0 {
            tracing::info!(
                "Exit: received={} lost={} bytes={}",
                stats.received,
                stats.missed,
                self.decoder.stats().bytes_fed
            );
            tracing::info!(
                "Exit: gaps={} max_gap={} dup={} reorder={} resets={}",
                stats.gap_events,
                stats.max_gap,
                stats.duplicates,
                stats.reordered,
                stats.resets
            );
        }
        self.decoder.stats().packets
    }
}

fn note_saved(result: io::Result<Option<PathBuf>>) {
    match result {
        Ok(Some(path)) => tracing::info!("Saved {}", path.display()),
        Ok(None) => {}
        Err(e) => tracing::warn!("Segment save failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sco_stream_bridge::codec::frame;
    use sco_stream_bridge::protocol::{CodecTag, SessionHeader};
    use tokio::io::AsyncWriteExt;

    fn segment_count(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("segment_"))
            .count()
    }

    #[tokio::test]
    async fn test_shutdown_while_client_connected() {
        let dir = tempfile::tempdir().unwrap();
        // Leftovers from a previous run are cleared at startup
        std::fs::write(dir.path().join("segment_1_0000.wav"), b"old").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let out_dir = dir.path().to_path_buf();
        let server = tokio::spawn(async move {
            serve(listener, &out_dir, async {
                let _ = stop_rx.await;
            })
            .await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let header = SessionHeader::for_codec(CodecTag::Narrowband, 1, 16);
        client.write_all(header.to_wire().as_bytes()).await.unwrap();
        for seq in [0u32, 1, 3] {
            let packet = frame(&[0u8; 120], CodecTag::Narrowband, seq, 0).unwrap();
            client.write_all(packet.as_bytes()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The client stays connected while shutdown is requested
        stop_tx.send(()).unwrap();
        let totals = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("receiver kept running after shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(totals, Totals { clients: 1, packets: 3 });

        let log = std::fs::read_to_string(dir.path().join(PACKET_LOG_FILE)).unwrap();
        let rows: Vec<&str> = log.lines().skip(1).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].contains(",0,0,0,START,"));
        assert!(rows[2].contains(",3,2,1,GAP,1,"));

        // The partial segment is saved on shutdown and the old one is gone
        assert_eq!(segment_count(dir.path()), 1);
        assert!(!dir.path().join("segment_1_0000.wav").exists());
        drop(client);
    }

    #[tokio::test]
    async fn test_serves_next_client_after_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let out_dir = dir.path().to_path_buf();
        let server = tokio::spawn(async move {
            serve(listener, &out_dir, async {
                let _ = stop_rx.await;
            })
            .await
        });

        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let packet = frame(&[0u8; 120], CodecTag::Narrowband, 0, 0).unwrap();
            client
                .write_all(SessionHeader::for_codec(CodecTag::Narrowband, 1, 16).to_wire().as_bytes())
                .await
                .unwrap();
            client.write_all(packet.as_bytes()).await.unwrap();
            client.shutdown().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        stop_tx.send(()).unwrap();
        let totals = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(totals, Totals { clients: 2, packets: 2 });
        assert_eq!(segment_count(dir.path()), 2);
    }
}
