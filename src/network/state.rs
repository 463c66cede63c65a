//! Connection state machine
//!
//! Every change of the stream connection goes through [`ConnectionStateMachine::transition`].
//! The capture path reads the current state lock-free; diagnostics and
//! anything else interested subscribe to a non-blocking change feed.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

/// Connection state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    const ALL: [ConnectionState; 3] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
    ];

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Edges of the DISCONNECTED → CONNECTING → CONNECTED → DISCONNECTED cycle
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
        };
        f.write_str(name)
    }
}

/// A completed transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: Instant,
}

/// Capacity of each subscriber's change feed; older changes are dropped
/// for subscribers that do not keep up.
const SUBSCRIBER_BACKLOG: usize = 32;

pub struct ConnectionStateMachine {
    state: AtomicU8,
    counts: [[AtomicU64; 3]; 3],
    subscribers: Mutex<Vec<Sender<StateChange>>>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            counts: Default::default(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Move to `next`. Illegal edges and self-transitions are ignored and
    /// return `None`.
    pub fn transition(&self, next: ConnectionState) -> Option<StateChange> {
        let prev = self.current();
        if !prev.can_transition_to(next) {
            if prev != next {
                tracing::debug!(from = %prev, to = %next, "ignoring illegal state transition");
            }
            return None;
        }
        self.state
            .compare_exchange(prev as u8, next as u8, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        self.counts[prev.index()][next.index()].fetch_add(1, Ordering::Relaxed);
        let change = StateChange {
            from: prev,
            to: next,
            at: Instant::now(),
        };
        tracing::debug!(from = %prev, to = %next, "stream connection state changed");
        self.publish(change);
        Some(change)
    }

    /// Force DISCONNECTED from any state (used on shutdown)
    pub fn force_disconnected(&self) -> Option<StateChange> {
        match self.current() {
            ConnectionState::Disconnected => None,
            _ => self.transition(ConnectionState::Disconnected),
        }
    }

    /// Number of times the `from → to` edge was taken
    pub fn transition_count(&self, from: ConnectionState, to: ConnectionState) -> u64 {
        self.counts[from.index()][to.index()].load(Ordering::Relaxed)
    }

    /// Feed of future transitions. Publishing never blocks; a full feed
    /// loses the change.
    pub fn subscribe(&self) -> Receiver<StateChange> {
        let (tx, rx) = bounded(SUBSCRIBER_BACKLOG);
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, change: StateChange) {
        self.subscribers
            .lock()
            .retain(|tx| !matches!(tx.try_send(change), Err(TrySendError::Disconnected(_))));
    }

    pub fn stats(&self) -> TransitionStats {
        let mut edges = Vec::new();
        for from in ConnectionState::ALL {
            for to in ConnectionState::ALL {
                if from.can_transition_to(to) {
                    edges.push(TransitionCount {
                        from,
                        to,
                        count: self.transition_count(from, to),
                    });
                }
            }
        }
        TransitionStats {
            state: self.current(),
            edges,
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionCount {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionStats {
    pub state: ConnectionState,
    pub edges: Vec<TransitionCount>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_connect_cycle() {
        let sm = ConnectionStateMachine::new();
        assert_eq!(sm.current(), Disconnected);

        assert!(sm.transition(Connecting).is_some());
        assert!(sm.transition(Connected).is_some());
        assert!(sm.is_connected());
        assert!(sm.transition(Disconnected).is_some());

        assert_eq!(sm.transition_count(Disconnected, Connecting), 1);
        assert_eq!(sm.transition_count(Connecting, Connected), 1);
        assert_eq!(sm.transition_count(Connected, Disconnected), 1);
        assert_eq!(sm.transition_count(Connecting, Disconnected), 0);
    }

    #[test]
    fn test_illegal_transitions_ignored() {
        let sm = ConnectionStateMachine::new();
        assert!(sm.transition(Connected).is_none());
        assert!(sm.transition(Disconnected).is_none());
        assert_eq!(sm.current(), Disconnected);
    }

    #[test]
    fn test_subscribers_see_changes() {
        let sm = ConnectionStateMachine::new();
        let rx = sm.subscribe();
        sm.transition(Connecting);
        sm.transition(Disconnected);

        let changes: Vec<_> = rx.try_iter().map(|c| (c.from, c.to)).collect();
        assert_eq!(changes, vec![(Disconnected, Connecting), (Connecting, Disconnected)]);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let sm = ConnectionStateMachine::new();
        drop(sm.subscribe());
        sm.transition(Connecting);
        assert!(sm.subscribers.lock().is_empty());
    }

    #[test]
    fn test_force_disconnected() {
        let sm = ConnectionStateMachine::new();
        assert!(sm.force_disconnected().is_none());
        sm.transition(Connecting);
        sm.transition(Connected);
        assert_eq!(sm.force_disconnected().map(|c| c.from), Some(Connected));
        assert_eq!(sm.stats().edges.len(), 4);
    }
}
