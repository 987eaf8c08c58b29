//! Tunnel connection layer: protocols, the error taxonomy shared by the
//! supervisor and the sessions, and the observer events surfaced to the rest
//! of the process.

pub mod control;
pub mod datagram;
pub mod http2;
pub mod protocol;
pub mod quic;
pub mod tracker;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::edge::dial::DialError;
use crate::edge::EdgeDiscoveryError;
use crate::metrics::TunnelMetrics;

/// Wire protocol used for one tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Quic,
    Http2,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Quic => write!(f, "quic"),
            Protocol::Http2 => write!(f, "http2"),
        }
    }
}

/// Chooses the starting protocol and the alternative to fall back to when
/// the preferred one cannot reach the edge.
#[derive(Debug, Clone)]
pub struct ProtocolSelector {
    current: Protocol,
    fallback: Option<Protocol>,
}

impl ProtocolSelector {
    pub fn new(current: Protocol, fallback: Option<Protocol>) -> Self {
        Self { current, fallback }
    }

    pub fn current(&self) -> Protocol {
        self.current
    }

    pub fn fallback(&self) -> Option<Protocol> {
        self.fallback
    }
}

/// Post-quantum key-agreement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PostQuantumMode {
    Disabled,
    Preferred,
    Strict,
}

/// Which datagram session handler a QUIC connection instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DatagramVersion {
    V2,
    V3,
}

/// Immutable feature decisions taken once at startup.
#[derive(Debug, Clone, Copy)]
pub struct FeatureSnapshot {
    pub post_quantum: PostQuantumMode,
    pub fips: bool,
    pub datagram_version: DatagramVersion,
}

/// Server- or operator-initiated instruction to re-establish a connection
/// after a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("reconnect signal: restart connection in {delay:?}")]
pub struct ReconnectSignal {
    pub delay: Duration,
}

impl ReconnectSignal {
    pub async fn delay_before_reconnect(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// Everything that can end one tunnel serve attempt.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Another connection already registered with this connection index.
    #[error("connection with this index is already registered to the edge")]
    DupConnRegister,

    /// The edge rejected the registration. Recoverable unless `permanent`.
    #[error("tunnel registration rejected by the edge: {cause}")]
    ServerRegister { cause: String, permanent: bool },

    #[error(transparent)]
    EdgeDiscovery(#[from] EdgeDiscoveryError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("failed to dial QUIC connection to the edge: {cause}")]
    EdgeQuicDial { cause: String, is_crypto: bool },

    #[error("QUIC connection idle timeout")]
    QuicIdleTimeout,

    #[error("QUIC application error: {0}")]
    QuicApplication(String),

    #[error("QUIC transport error: {0}")]
    QuicTransport(String),

    #[error(transparent)]
    Reconnect(#[from] ReconnectSignal),

    #[error("control stream error: {0}")]
    ControlStream(String),

    #[error("stream listener error: {0}")]
    StreamListener(String),

    #[error("datagram manager error: {0}")]
    DatagramManager(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("operation canceled")]
    Canceled,

    /// No retry will fix this; the supervisor gives up on the attempt.
    #[error("{0}")]
    Unrecoverable(String),

    #[error("connection task panicked: {0}")]
    SessionPanic(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Map a QUIC connection-level failure observed mid-session onto the
/// taxonomy the retry machinery understands.
pub(crate) fn map_quic_close(err: &quinn::ConnectionError) -> TunnelError {
    match err {
        quinn::ConnectionError::TimedOut => TunnelError::QuicIdleTimeout,
        quinn::ConnectionError::ApplicationClosed(close) => {
            TunnelError::QuicApplication(close.to_string())
        }
        quinn::ConnectionError::TransportError(te) => TunnelError::QuicTransport(te.to_string()),
        quinn::ConnectionError::LocallyClosed => TunnelError::Canceled,
        other => TunnelError::QuicTransport(other.to_string()),
    }
}

/// Callback the control stream fires when registration completes, wired by
/// the tunnel server to the connected fuse, the protocol tracker, and the
/// per-index backoff reset.
pub trait ConnectedNotifier: Send + Sync {
    fn connected(&self, location: &str);
    fn is_connected(&self) -> bool;
}

/// Advisory connection lifecycle events.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected {
        conn_index: u8,
        protocol: Protocol,
        location: String,
    },
    Disconnected {
        conn_index: u8,
    },
    Reconnecting {
        conn_index: u8,
    },
}

/// Fans connection events out to whoever subscribed (the app logs them) and
/// keeps the aggregate metrics current.
#[derive(Clone)]
pub struct Observer {
    metrics: Arc<TunnelMetrics>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Observer {
    pub fn new(metrics: Arc<TunnelMetrics>) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { metrics, events }, rx)
    }

    pub fn send_connected(&self, conn_index: u8, protocol: Protocol, location: &str) {
        self.metrics.registrations.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(ConnectionEvent::Connected {
            conn_index,
            protocol,
            location: location.to_string(),
        });
    }

    pub fn send_disconnect(&self, conn_index: u8) {
        let _ = self
            .events
            .send(ConnectionEvent::Disconnected { conn_index });
    }

    pub fn send_reconnect(&self, conn_index: u8) {
        self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .events
            .send(ConnectionEvent::Reconnecting { conn_index });
    }

    pub fn metrics(&self) -> &Arc<TunnelMetrics> {
        &self.metrics
    }
}

/// Operator reconnect signals arrive on one channel shared by every live
/// session; whichever session is listening takes the signal.
pub type SharedReconnectRx = Arc<tokio::sync::Mutex<mpsc::Receiver<ReconnectSignal>>>;

pub fn reconnect_channel() -> (mpsc::Sender<ReconnectSignal>, SharedReconnectRx) {
    let (tx, rx) = mpsc::channel(4);
    (tx, Arc::new(tokio::sync::Mutex::new(rx)))
}

/// Resolves when an operator reconnect signal is taken off the shared
/// channel. Pends forever once the sender side is gone.
pub(crate) async fn listen_reconnect(rx: SharedReconnectRx) -> ReconnectSignal {
    let mut rx = rx.lock().await;
    match rx.recv().await {
        Some(signal) => signal,
        None => std::future::pending().await,
    }
}
