//! Stream Bridge Application
//!
//! Drives a streaming session from a simulated voice link: a 440 Hz test
//! tone delivered in 7.5 ms blocks, with the outbound silence pulled at the
//! same rate. Useful for bench testing a receiver without telephony hardware.
//!
//! Usage: `bridge [server_ip:port] [cvsd|msbc]`

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select, tick, Sender};
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sco_stream_bridge::{
    protocol::PCM_BLOCK_DURATION_US,
    session::LinkEndpoint,
    AppConfig, CodecTag, SharedLink, StreamSession,
};

const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 8_000.0;

/// Thread playing the part of the voice link
struct SimulatedLink {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SimulatedLink {
    fn spawn(endpoint: LinkEndpoint, codec: CodecTag) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let frame_bytes = codec.frame_bytes();
        let sample_rate = codec.sample_rate() as f32;

        let handle = thread::Builder::new()
            .name("simulated-link".to_string())
            .spawn(move || {
                let ticker = tick(Duration::from_micros(PCM_BLOCK_DURATION_US));
                let mut inbound = vec![0u8; frame_bytes];
                let mut outbound = vec![0u8; frame_bytes];
                let mut phase = 0.0f32;
                let step = 2.0 * std::f32::consts::PI * TONE_HZ / sample_rate;

                loop {
                    select! {
                        recv(ticker) -> _ => {
                            for pair in inbound.chunks_exact_mut(2) {
                                let sample = (phase.sin() * TONE_AMPLITUDE) as i16;
                                pair.copy_from_slice(&sample.to_le_bytes());
                                phase = (phase + step) % (2.0 * std::f32::consts::PI);
                            }
                            endpoint.deliver_inbound(&inbound);
                            endpoint.request_outbound(&mut outbound);
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })
            .context("failed to spawn simulated link")?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            join_reporting(handle, "simulated link");
        }
    }
}

/// Join a helper thread, logging a panic instead of discarding it.
/// Returns whether the thread finished cleanly.
fn join_reporting(handle: JoinHandle<()>, name: &str) -> bool {
    let clean = handle.join().is_ok();
    if !clean {
        tracing::error!("{} thread panicked", name);
    }
    clean
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

    tracing::info!("Starting SCO stream bridge");

    let mut config = AppConfig::load_or_default()?;

    // Server address from args overrides the config file
    if let Some(arg) = std::env::args().nth(1) {
        let addr: SocketAddrV4 = arg
            .parse()
            .with_context(|| format!("invalid server address {:?}", arg))?;
        config.stream.server_ip = addr.ip().to_string();
        config.stream.server_port = addr.port();
    }

    let codec = match std::env::args().nth(2) {
        Some(name) => CodecTag::from_name(&name)
            .with_context(|| format!("unknown codec {:?}, expected CVSD or MSBC", name))?,
        None => CodecTag::Narrowband,
    };

    let link = Arc::new(SharedLink::with_codec(codec));
    let mut session = StreamSession::init(config, link.clone())?;
    session.start()?;

    tracing::info!(
        server = %session.server(),
        codec = %codec,
        frame_bytes = codec.frame_bytes(),
        "simulated link running - press Ctrl+C to stop"
    );
    let mut simulated = SimulatedLink::spawn(session.link_endpoint(), codec)?;

    let mut stats_interval = tokio::time::interval(Duration::from_secs(5));
    stats_interval.tick().await;

    loop {
        tokio::select! {
            _ = stats_interval.tick() => {
                let status = session.status();
                tracing::info!(
                    "Stats: {} state, {} sent, {} queued, {} evicted, {} dropped while disconnected",
                    status.connection,
                    status.transport.packets_sent,
                    status.queue.len,
                    status.capture.evicted,
                    status.capture.dropped_not_connected,
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    simulated.stop();
    link.set_codec(None);
    let final_status = session.status();
    session.deinit();

    println!("{}", serde_json::to_string_pretty(&final_status)?);
    Ok(())
}
