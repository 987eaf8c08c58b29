//! Aggregate tunnel metrics kept as plain atomics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Counters shared by the supervisor and every tunnel connection.
#[derive(Debug, Default)]
pub struct TunnelMetrics {
    /// Currently-running HA connection attempts (serve calls in flight).
    pub ha_connections: AtomicI64,
    pub registrations: AtomicU64,
    pub registration_failures: AtomicU64,
    pub reconnects: AtomicU64,
}

impl TunnelMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Increments `ha_connections` on creation and decrements it on drop, so the
/// gauge stays correct on every serve exit path.
pub struct HaConnectionGuard {
    metrics: Arc<TunnelMetrics>,
}

impl HaConnectionGuard {
    pub fn new(metrics: Arc<TunnelMetrics>) -> Self {
        metrics.ha_connections.fetch_add(1, Ordering::Relaxed);
        Self { metrics }
    }
}

impl Drop for HaConnectionGuard {
    fn drop(&mut self) {
        self.metrics.ha_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_guard_balances() {
        let metrics = TunnelMetrics::new();
        {
            let _a = HaConnectionGuard::new(Arc::clone(&metrics));
            let _b = HaConnectionGuard::new(Arc::clone(&metrics));
            assert_eq!(metrics.ha_connections.load(Ordering::Relaxed), 2);
        }
        assert_eq!(metrics.ha_connections.load(Ordering::Relaxed), 0);
    }
}
