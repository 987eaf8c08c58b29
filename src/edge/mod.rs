//! Edge address bookkeeping: which edge endpoint each HA connection uses.

pub mod dial;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

/// One edge endpoint: the same host reachable over TCP (HTTP2 transport)
/// and UDP (QUIC transport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeAddr {
    pub tcp: SocketAddr,
    pub udp: SocketAddr,
}

impl std::fmt::Display for EdgeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tcp)
    }
}

#[derive(Debug, Error)]
pub enum EdgeDiscoveryError {
    /// Every known edge address is already claimed by another connection.
    #[error("there are no free edge addresses left")]
    NoAddressesLeft,
    #[error("invalid edge address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },
}

#[derive(Debug)]
struct AddrPool {
    addrs: Vec<Arc<EdgeAddr>>,
    /// Pool slot currently assigned to each connection index.
    assignments: HashMap<u8, usize>,
    in_use: Vec<bool>,
}

/// Thread-safe store of edge addresses with a stable per-connection-index
/// assignment. Addresses are rotated on request, never shared between
/// indices.
#[derive(Debug)]
pub struct Edge {
    pool: Mutex<AddrPool>,
}

impl Edge {
    /// Build a store from statically-configured `host:port` strings.
    /// Hostnames are resolved once, at startup.
    pub fn static_edge(addrs: &[String]) -> Result<Self, EdgeDiscoveryError> {
        let mut resolved = Vec::with_capacity(addrs.len());
        for raw in addrs {
            let sockaddr = raw
                .to_socket_addrs()
                .map_err(|e| EdgeDiscoveryError::InvalidAddress {
                    addr: raw.clone(),
                    reason: e.to_string(),
                })?
                .next()
                .ok_or_else(|| EdgeDiscoveryError::InvalidAddress {
                    addr: raw.clone(),
                    reason: "resolved to no addresses".to_string(),
                })?;
            resolved.push(Arc::new(EdgeAddr {
                tcp: sockaddr,
                udp: sockaddr,
            }));
        }
        if resolved.is_empty() {
            return Err(EdgeDiscoveryError::NoAddressesLeft);
        }
        let count = resolved.len();
        Ok(Self {
            pool: Mutex::new(AddrPool {
                addrs: resolved,
                assignments: HashMap::new(),
                in_use: vec![false; count],
            }),
        })
    }

    pub fn available_addrs(&self) -> usize {
        self.pool.lock().unwrap().addrs.len()
    }

    /// Address assigned to `conn_index`, claiming a free one on first use.
    /// Stable until [`get_different_addr`](Self::get_different_addr) rotates it.
    pub fn get_addr(&self, conn_index: u8) -> Result<Arc<EdgeAddr>, EdgeDiscoveryError> {
        let mut pool = self.pool.lock().unwrap();
        if let Some(&slot) = pool.assignments.get(&conn_index) {
            return Ok(Arc::clone(&pool.addrs[slot]));
        }
        let slot = pool
            .in_use
            .iter()
            .position(|used| !*used)
            .ok_or(EdgeDiscoveryError::NoAddressesLeft)?;
        pool.in_use[slot] = true;
        pool.assignments.insert(conn_index, slot);
        let addr = Arc::clone(&pool.addrs[slot]);
        debug!(conn_index, addr = %addr, "assigned edge address");
        Ok(addr)
    }

    /// Rotate `conn_index` onto another edge address. With `force` the
    /// current address is never handed back, even if it is the only free one.
    pub fn get_different_addr(
        &self,
        conn_index: u8,
        force: bool,
    ) -> Result<Arc<EdgeAddr>, EdgeDiscoveryError> {
        let mut pool = self.pool.lock().unwrap();
        let current = pool.assignments.remove(&conn_index);
        if let Some(slot) = current {
            pool.in_use[slot] = false;
        }

        let pick = pool
            .in_use
            .iter()
            .enumerate()
            .find(|(slot, used)| !**used && Some(*slot) != current)
            .map(|(slot, _)| slot);
        let slot = match pick {
            Some(slot) => slot,
            None if !force => current.ok_or(EdgeDiscoveryError::NoAddressesLeft)?,
            None => return Err(EdgeDiscoveryError::NoAddressesLeft),
        };

        pool.in_use[slot] = true;
        pool.assignments.insert(conn_index, slot);
        let addr = Arc::clone(&pool.addrs[slot]);
        debug!(conn_index, addr = %addr, "rotated edge address");
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(n: usize) -> Edge {
        let addrs: Vec<String> = (0..n).map(|i| format!("127.0.0.{}:7844", i + 1)).collect();
        Edge::static_edge(&addrs).unwrap()
    }

    #[test]
    fn addr_is_stable_per_index() {
        let edge = edge(3);
        let first = edge.get_addr(0).unwrap();
        assert_eq!(first, edge.get_addr(0).unwrap());
        assert_ne!(first, edge.get_addr(1).unwrap());
    }

    #[test]
    fn forced_rotation_never_returns_current() {
        let edge = edge(2);
        let first = edge.get_addr(0).unwrap();
        let second = edge.get_different_addr(0, true).unwrap();
        assert_ne!(first, second);
        // The released address is back in the pool; a further forced
        // rotation must still avoid the one currently held.
        let third = edge.get_different_addr(0, true).unwrap();
        assert_ne!(second, third);
    }

    #[test]
    fn forced_rotation_fails_when_only_current_remains() {
        let edge = edge(1);
        edge.get_addr(0).unwrap();
        assert!(matches!(
            edge.get_different_addr(0, true),
            Err(EdgeDiscoveryError::NoAddressesLeft)
        ));
    }

    #[test]
    fn unforced_rotation_may_keep_current() {
        let edge = edge(1);
        let first = edge.get_addr(0).unwrap();
        assert_eq!(first, edge.get_different_addr(0, false).unwrap());
    }

    #[test]
    fn pool_exhaustion() {
        let edge = edge(2);
        edge.get_addr(0).unwrap();
        edge.get_addr(1).unwrap();
        assert!(matches!(
            edge.get_addr(2),
            Err(EdgeDiscoveryError::NoAddressesLeft)
        ));
        assert_eq!(edge.available_addrs(), 2);
    }

    #[test]
    fn rejects_unparseable_addresses() {
        let err = Edge::static_edge(&["not an address".to_string()]).unwrap_err();
        assert!(matches!(err, EdgeDiscoveryError::InvalidAddress { .. }));
    }
}
