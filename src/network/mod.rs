//! Network subsystem for TCP audio transport

pub mod queue;
pub mod state;
pub mod transport;

pub use queue::{QueueStats, TransferQueue};
pub use state::{ConnectionState, ConnectionStateMachine, StateChange};
pub use transport::{TransportStats, TransportStatsSnapshot, TransportTask};

/// Answers whether the network is up before the transport attempts a connect
pub trait Reachability: Send + Sync {
    fn is_reachable(&self) -> bool;
}

/// For hosts where the network is assumed to be up
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

impl Reachability for AlwaysReachable {
    fn is_reachable(&self) -> bool {
        true
    }
}
