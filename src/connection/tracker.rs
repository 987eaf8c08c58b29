//! Tracks which connection indices are up and which protocols have ever
//! registered successfully.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected(Protocol),
    Disconnected,
}

#[derive(Default)]
struct TrackerState {
    states: HashMap<u8, ConnectionState>,
    ever_connected: HashSet<Protocol>,
}

/// Shared, read-mostly view of connection health.
#[derive(Default)]
pub struct ConnTracker {
    state: RwLock<TrackerState>,
}

impl ConnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connected(&self, conn_index: u8, protocol: Protocol) {
        let mut state = self.state.write().unwrap();
        state
            .states
            .insert(conn_index, ConnectionState::Connected(protocol));
        state.ever_connected.insert(protocol);
    }

    pub fn mark_disconnected(&self, conn_index: u8) {
        let mut state = self.state.write().unwrap();
        state.states.insert(conn_index, ConnectionState::Disconnected);
    }

    /// Whether any connection has ever registered with `protocol`. Used to
    /// suppress protocol fallback once the protocol is known to work.
    pub fn has_connected_with(&self, protocol: Protocol) -> bool {
        self.state.read().unwrap().ever_connected.contains(&protocol)
    }

    #[allow(dead_code)]
    pub fn state_of(&self, conn_index: u8) -> Option<ConnectionState> {
        self.state.read().unwrap().states.get(&conn_index).copied()
    }
}
