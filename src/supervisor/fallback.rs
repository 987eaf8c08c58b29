//! Per-connection protocol state: backoff, the protocol in use, and the
//! fallback decision taken after a failed attempt.

use std::time::Duration;

use tracing::{info, warn};

use crate::connection::{Protocol, ProtocolSelector, TunnelError};
use crate::retry::BackoffHandler;

/// Wraps the backoff handler for one connection index together with the
/// protocol its next attempt will use.
#[derive(Debug, Clone)]
pub struct ProtocolFallback {
    pub backoff: BackoffHandler,
    pub protocol: Protocol,
    pub in_fallback: bool,
}

impl ProtocolFallback {
    pub fn new(backoff: BackoffHandler, protocol: Protocol) -> Self {
        Self {
            backoff,
            protocol,
            in_fallback: false,
        }
    }

    /// Called on a successful registration: clears the backoff and leaves
    /// fallback mode.
    pub fn reset(&mut self) {
        self.backoff.reset_now();
        self.in_fallback = false;
    }

    /// Switch the next attempt to `fallback` with a fresh backoff.
    pub fn fallback(&mut self, fallback: Protocol) {
        self.backoff.reset_now();
        self.protocol = fallback;
        self.in_fallback = true;
    }

    pub fn get_max_backoff_duration(&self) -> (Duration, bool) {
        self.backoff.get_max_backoff_duration()
    }

    pub fn reached_max_retries(&self) -> bool {
        self.backoff.reached_max_retries()
    }
}

/// Whether the failure pattern says QUIC cannot work on this network: the
/// connection idles out, or egress UDP is being dropped by a local policy.
pub fn is_quic_broken(cause: &TunnelError) -> bool {
    match cause {
        TunnelError::QuicIdleTimeout => true,
        TunnelError::QuicTransport(message) => message.contains("operation not permitted"),
        _ => false,
    }
}

/// Pick the protocol for the next retry. Returns `false` when no option
/// remains and the caller should stop retrying this connection.
pub fn select_next_protocol(
    conn_index: u8,
    protocol_backoff: &mut ProtocolFallback,
    selector: &ProtocolSelector,
    cause: &TunnelError,
) -> bool {
    let quic_broken = is_quic_broken(cause);
    let has_fallback = selector.fallback().is_some();

    if protocol_backoff.reached_max_retries() || (has_fallback && quic_broken) {
        if quic_broken {
            warn!(
                conn_index,
                "If this log occurs persistently the network is likely dropping egress UDP \
                 towards the edge; QUIC cannot be used until that traffic is allowed"
            );
        }

        let fallback = match selector.fallback() {
            Some(fallback) => fallback,
            None => return false,
        };
        if protocol_backoff.protocol == fallback {
            // Already on the fallback protocol, nothing left to try.
            return false;
        }
        info!(conn_index, protocol = %fallback, "switching to fallback protocol");
        protocol_backoff.fallback(fallback);
    } else if !protocol_backoff.in_fallback {
        let current = selector.current();
        if protocol_backoff.protocol != current {
            info!(conn_index, protocol = %current, "changing protocol");
            protocol_backoff.protocol = current;
        }
    }
    true
}
