//! Error types for the stream bridge

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Resource exhausted: {0}")]
    Resource(#[from] ResourceError),

    #[error("Invalid state: {0}")]
    InvalidState(#[from] StateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invalid session configuration or config file problems
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid IPv4 server address: {0:?}")]
    InvalidAddress(String),

    #[error("Invalid server port: {0}")]
    InvalidPort(u16),

    #[error("Invalid queue capacity: {0}")]
    InvalidCapacity(usize),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Wire framing and decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),

    #[error("Truncated header: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Bad packet magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("Unknown codec tag: {0}")]
    UnknownCodec(u16),

    #[error("Invalid session header: {0}")]
    InvalidSessionHeader(String),
}

/// Network transport failures. These are absorbed by the reconnect loop.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Socket setup failed: {0}")]
    Socket(#[source] std::io::Error),

    #[error("Connection to {addr} failed: {source}")]
    ConnectFailed {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send session header: {0}")]
    HeaderSendFailed(#[source] std::io::Error),

    #[error("Send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Allocation-style failures; always recoverable by dropping the unit of work
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Packet pool exhausted ({capacity} buffers in flight)")]
    PoolExhausted { capacity: usize },
}

/// Lifecycle misuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Stream is not active")]
    NotActive,

    #[error("Empty payload")]
    EmptyPayload,
}

/// Result type alias for the bridge
pub type Result<T> = std::result::Result<T, Error>;
