//! One tunnel serve attempt: acquire an edge address, dial, run the
//! session, classify the failure, rotate/backoff/fall back.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::control::ControlStreamParams;
use crate::connection::http2::serve_http2;
use crate::connection::quic::{serve_quic, QuicTlsSettings};
use crate::connection::tracker::ConnTracker;
use crate::connection::{
    ConnectedNotifier, FeatureSnapshot, Observer, PostQuantumMode, Protocol, ProtocolSelector,
    SharedReconnectRx, TunnelError,
};
use crate::edge::dial::dial_edge;
use crate::edge::{Edge, EdgeAddr};
use crate::metrics::HaConnectionGuard;
use crate::signal::{wait_flag, BooleanFuse, Signal};

use super::fallback::{select_next_protocol, ProtocolFallback};

/// Deadline for establishing one edge connection (TCP or QUIC, incl. TLS).
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Optional network diagnostics collaborator, started by the supervisor.
#[async_trait]
pub trait IcmpRouter: Send + Sync {
    async fn serve(&self, cancel: watch::Receiver<bool>) -> anyhow::Result<()>;
}

/// Optional origin-DNS refresh collaborator, started by the supervisor.
#[async_trait]
pub trait OriginDnsService: Send + Sync {
    async fn run_refresh_loop(&self, cancel: watch::Receiver<bool>);
}

/// Immutable description of the tunnel this process maintains.
pub struct TunnelConfig {
    pub tunnel_id: String,
    pub client_version: String,
    pub tags: HashMap<String, String>,
    pub ha_connections: u8,
    pub retries: u32,
    pub max_edge_addr_retries: u8,
    pub edge_bind_addr: Option<IpAddr>,
    /// `socks5://[user[:pass]@]host[:port]`; unset means direct dialing only.
    pub edge_proxy_url: Option<String>,
    pub grace_period: Duration,
    pub rpc_timeout: Duration,
    pub write_stream_timeout: Duration,
    pub ping_interval: Duration,
    pub features: FeatureSnapshot,
    pub protocol_selector: ProtocolSelector,
    pub http2_tls: Arc<rustls::ClientConfig>,
    pub quic_tls: QuicTlsSettings,
    pub server_name: rustls::pki_types::ServerName<'static>,
    pub icmp_router: Option<Arc<dyn IcmpRouter>>,
    pub origin_dns: Option<Arc<dyn OriginDnsService>>,
}

/// A dial-layer failure that counts against `max_edge_addr_retries`.
#[derive(Debug, Clone, Copy)]
pub struct ConnectivityError {
    reached_max_retries: bool,
}

impl ConnectivityError {
    pub fn new(reached_max_retries: bool) -> Self {
        Self {
            reached_max_retries,
        }
    }

    pub fn has_reached_max_retries(&self) -> bool {
        self.reached_max_retries
    }
}

/// Policy hook: decides, per failed attempt, whether the connection should
/// move to another edge address and whether the failure was a connectivity
/// error.
pub trait EdgeAddrHandler: Send + Sync {
    fn should_get_new_address(
        &self,
        conn_index: u8,
        err: Option<&TunnelError>,
    ) -> (bool, Option<ConnectivityError>);
}

/// Rotates the edge address for registration conflicts and idle timeouts,
/// and counts dial failures per connection index up to a maximum.
pub struct IpAddrFallback {
    retries_by_conn_index: Mutex<HashMap<u8, u8>>,
    max_retries: u8,
}

impl IpAddrFallback {
    pub fn new(max_retries: u8) -> Self {
        Self {
            retries_by_conn_index: Mutex::new(HashMap::new()),
            max_retries,
        }
    }
}

impl EdgeAddrHandler for IpAddrFallback {
    fn should_get_new_address(
        &self,
        conn_index: u8,
        err: Option<&TunnelError>,
    ) -> (bool, Option<ConnectivityError>) {
        match err {
            None => (false, None),
            Some(TunnelError::DupConnRegister) | Some(TunnelError::QuicIdleTimeout) => (true, None),
            Some(TunnelError::Dial(_)) | Some(TunnelError::EdgeQuicDial { .. }) => {
                let mut retries = self.retries_by_conn_index.lock().unwrap();
                let count = retries.entry(conn_index).or_insert(0);
                if *count >= self.max_retries {
                    *count = 0;
                    return (true, Some(ConnectivityError::new(true)));
                }
                *count += 1;
                (true, Some(ConnectivityError::new(false)))
            }
            Some(_) => (false, None),
        }
    }
}

/// Serves one tunnel connection attempt; shared read-only between all
/// connection indices.
#[async_trait]
pub trait TunnelServer: Send + Sync {
    async fn serve(
        &self,
        cancel: watch::Receiver<bool>,
        conn_index: u8,
        protocol_fallback: Arc<Mutex<ProtocolFallback>>,
        connected_signal: Signal,
    ) -> Result<(), TunnelError>;
}

pub struct EdgeTunnelServer {
    config: Arc<TunnelConfig>,
    edge_addrs: Arc<Edge>,
    edge_addr_handler: Arc<dyn EdgeAddrHandler>,
    tracker: Arc<ConnTracker>,
    observer: Observer,
    reconnect_rx: SharedReconnectRx,
    graceful_shutdown: watch::Receiver<bool>,
}

impl EdgeTunnelServer {
    pub fn new(
        config: Arc<TunnelConfig>,
        edge_addrs: Arc<Edge>,
        tracker: Arc<ConnTracker>,
        observer: Observer,
        reconnect_rx: SharedReconnectRx,
        graceful_shutdown: watch::Receiver<bool>,
    ) -> Self {
        let edge_addr_handler = Arc::new(IpAddrFallback::new(config.max_edge_addr_retries));
        Self {
            config,
            edge_addrs,
            edge_addr_handler,
            tracker,
            observer,
            reconnect_rx,
            graceful_shutdown,
        }
    }

    async fn serve_tunnel(
        &self,
        addr: &EdgeAddr,
        conn_index: u8,
        fuse: &Arc<BooleanFuse>,
        protocol_fallback: &Arc<Mutex<ProtocolFallback>>,
        protocol: Protocol,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), (TunnelError, bool)> {
        let result = self
            .serve_connection(addr, conn_index, fuse, protocol_fallback, protocol, cancel)
            .await;
        self.observer.send_disconnect(conn_index);
        self.tracker.mark_disconnected(conn_index);

        let err = match result {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let (err, recoverable) = classify_error(err);
        match &err {
            TunnelError::DupConnRegister => {
                self.observer
                    .metrics()
                    .registration_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(conn_index, error = %err, "unable to establish connection");
            }
            TunnelError::ServerRegister { .. } => {
                self.observer
                    .metrics()
                    .registration_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(conn_index, error = %err, "register tunnel error from server side");
            }
            TunnelError::Reconnect(signal) => {
                info!(conn_index, addr = %addr, delay = ?signal.delay,
                    "restarting connection due to reconnect signal");
                signal.delay_before_reconnect().await;
            }
            TunnelError::Canceled => {
                debug!(conn_index, error = %err, "serve tunnel error");
            }
            _ => {
                warn!(conn_index, error = %err, "serve tunnel error");
            }
        }
        Err((err, recoverable))
    }

    async fn serve_connection(
        &self,
        addr: &EdgeAddr,
        conn_index: u8,
        fuse: &Arc<BooleanFuse>,
        protocol_fallback: &Arc<Mutex<ProtocolFallback>>,
        protocol: Protocol,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let notifier = ConnectedFuse {
            fuse: Arc::clone(fuse),
            fallback: Arc::clone(protocol_fallback),
            tracker: Arc::clone(&self.tracker),
            observer: self.observer.clone(),
            conn_index,
            protocol,
        };
        let previous_attempts = protocol_fallback
            .lock()
            .unwrap()
            .backoff
            .retries()
            .min(u8::MAX as u32) as u8;
        let params = ControlStreamParams {
            conn_index,
            tunnel_id: self.config.tunnel_id.clone(),
            client_version: self.config.client_version.clone(),
            tags: self.config.tags.clone(),
            previous_attempts,
            rpc_timeout: self.config.rpc_timeout,
            write_timeout: self.config.write_stream_timeout,
            ping_interval: self.config.ping_interval,
            grace_period: self.config.grace_period,
        };

        match protocol {
            Protocol::Http2 => {
                if self.config.features.post_quantum == PostQuantumMode::Strict {
                    return Err(TunnelError::Unrecoverable(
                        "HTTP/2 transport does not support post-quantum".to_string(),
                    ));
                }
                let tls_stream = dial_edge(
                    DIAL_TIMEOUT,
                    Arc::clone(&self.config.http2_tls),
                    self.config.server_name.clone(),
                    addr.tcp,
                    self.config.edge_bind_addr,
                    self.config.edge_proxy_url.as_deref(),
                )
                .await?;
                serve_http2(
                    tls_stream,
                    &params,
                    &notifier,
                    Arc::clone(&self.reconnect_rx),
                    self.graceful_shutdown.clone(),
                    cancel,
                )
                .await
            }
            Protocol::Quic => {
                serve_quic(
                    &self.config.quic_tls,
                    &self.config.features,
                    addr.udp,
                    self.config.edge_bind_addr,
                    DIAL_TIMEOUT,
                    &params,
                    &notifier,
                    Arc::clone(&self.reconnect_rx),
                    self.graceful_shutdown.clone(),
                    cancel,
                )
                .await
            }
        }
    }
}

#[async_trait]
impl TunnelServer for EdgeTunnelServer {
    async fn serve(
        &self,
        cancel: watch::Receiver<bool>,
        conn_index: u8,
        protocol_fallback: Arc<Mutex<ProtocolFallback>>,
        connected_signal: Signal,
    ) -> Result<(), TunnelError> {
        let _gauge = HaConnectionGuard::new(Arc::clone(self.observer.metrics()));

        let fuse = Arc::new(BooleanFuse::new());
        {
            let fuse = Arc::clone(&fuse);
            tokio::spawn(async move {
                if fuse.await_value().await {
                    connected_signal.notify();
                }
            });
        }
        // Latches false on every exit path so the waiter above terminates;
        // a no-op if the session already latched true.
        let _fuse_guard = FuseGuard(Arc::clone(&fuse));

        let addr = self.edge_addrs.get_addr(conn_index)?;
        let protocol = protocol_fallback.lock().unwrap().protocol;
        info!(conn_index, addr = %addr, protocol = %protocol, "starting tunnel connection");

        let served = self
            .serve_tunnel(
                &addr,
                conn_index,
                &fuse,
                &protocol_fallback,
                protocol,
                cancel.clone(),
            )
            .await;
        let (error, recoverable) = match served {
            Ok(()) => return Ok(()),
            Err(classified) => classified,
        };
        let mut should_fallback_protocol = recoverable;

        let (rotate, connectivity) = self
            .edge_addr_handler
            .should_get_new_address(conn_index, Some(&error));
        if rotate {
            self.edge_addrs.get_different_addr(conn_index, true)?;
            if let Some(connectivity) = connectivity {
                should_fallback_protocol = connectivity.has_reached_max_retries();
            }
        }

        let (duration, can_retry) = protocol_fallback.lock().unwrap().get_max_backoff_duration();
        if !can_retry {
            return Err(error);
        }
        self.observer.send_reconnect(conn_index);
        info!(conn_index, "retrying connection in up to {:?}", duration);

        let wait = protocol_fallback.lock().unwrap().backoff.backoff_duration();
        let mut cancel = cancel;
        let mut graceful = self.graceful_shutdown.clone();
        tokio::select! {
            _ = wait_flag(&mut cancel) => return Err(TunnelError::Canceled),
            _ = wait_flag(&mut graceful) => return Ok(()),
            _ = tokio::time::sleep(wait) => {
                if !should_fallback_protocol {
                    return Err(error);
                }
                // A protocol that has already carried a connection does not
                // get abandoned because one index is struggling.
                if self
                    .tracker
                    .has_connected_with(self.config.protocol_selector.current())
                {
                    return Err(error);
                }
                let mut pf = protocol_fallback.lock().unwrap();
                if !select_next_protocol(conn_index, &mut pf, &self.config.protocol_selector, &error) {
                    return Err(error);
                }
            }
        }
        Err(error)
    }
}

/// Fires the session's connected fuse and resets the per-index retry state
/// the moment registration completes.
struct ConnectedFuse {
    fuse: Arc<BooleanFuse>,
    fallback: Arc<Mutex<ProtocolFallback>>,
    tracker: Arc<ConnTracker>,
    observer: Observer,
    conn_index: u8,
    protocol: Protocol,
}

impl ConnectedNotifier for ConnectedFuse {
    fn connected(&self, location: &str) {
        self.fuse.fuse(true);
        self.fallback.lock().unwrap().reset();
        self.tracker.mark_connected(self.conn_index, self.protocol);
        self.observer
            .send_connected(self.conn_index, self.protocol, location);
    }

    fn is_connected(&self) -> bool {
        self.fuse.value()
    }
}

struct FuseGuard(Arc<BooleanFuse>);

impl Drop for FuseGuard {
    fn drop(&mut self) {
        self.0.fuse(false);
    }
}

/// Whether the error that ended a session is worth another attempt on this
/// connection index.
pub(crate) fn classify_error(err: TunnelError) -> (TunnelError, bool) {
    let recoverable = match &err {
        TunnelError::DupConnRegister => false,
        TunnelError::ServerRegister { permanent, .. } => !*permanent,
        TunnelError::EdgeQuicDial { .. } => false,
        TunnelError::Reconnect(_) => true,
        TunnelError::Canceled => false,
        TunnelError::Unrecoverable(_) => false,
        _ => true,
    };
    (err, recoverable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::dial::DialError;

    fn dial_err() -> TunnelError {
        TunnelError::Dial(DialError::Connect(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )))
    }

    #[test]
    fn no_error_keeps_address() {
        let handler = IpAddrFallback::new(2);
        let (rotate, connectivity) = handler.should_get_new_address(0, None);
        assert!(!rotate);
        assert!(connectivity.is_none());
    }

    #[test]
    fn dup_conn_and_idle_timeout_rotate_without_counting() {
        let handler = IpAddrFallback::new(2);
        let (rotate, connectivity) =
            handler.should_get_new_address(0, Some(&TunnelError::DupConnRegister));
        assert!(rotate);
        assert!(connectivity.is_none());

        let (rotate, connectivity) =
            handler.should_get_new_address(0, Some(&TunnelError::QuicIdleTimeout));
        assert!(rotate);
        assert!(connectivity.is_none());
    }

    #[test]
    fn dial_errors_count_up_to_max_then_reset() {
        let handler = IpAddrFallback::new(2);
        let err = dial_err();

        for _ in 0..2 {
            let (rotate, connectivity) = handler.should_get_new_address(3, Some(&err));
            assert!(rotate);
            assert!(!connectivity.unwrap().has_reached_max_retries());
        }
        let (rotate, connectivity) = handler.should_get_new_address(3, Some(&err));
        assert!(rotate);
        assert!(connectivity.unwrap().has_reached_max_retries());

        // Counter was reset when max was reported.
        let (_, connectivity) = handler.should_get_new_address(3, Some(&err));
        assert!(!connectivity.unwrap().has_reached_max_retries());
    }

    #[test]
    fn counters_are_per_connection_index() {
        let handler = IpAddrFallback::new(1);
        let err = dial_err();
        handler.should_get_new_address(0, Some(&err));
        let (_, connectivity) = handler.should_get_new_address(1, Some(&err));
        assert!(!connectivity.unwrap().has_reached_max_retries());
    }

    #[test]
    fn session_errors_keep_address() {
        let handler = IpAddrFallback::new(2);
        let (rotate, connectivity) = handler.should_get_new_address(
            0,
            Some(&TunnelError::ControlStream("broken".to_string())),
        );
        assert!(!rotate);
        assert!(connectivity.is_none());
    }

    #[test]
    fn classification_matches_taxonomy() {
        assert!(!classify_error(TunnelError::DupConnRegister).1);
        assert!(!classify_error(TunnelError::Canceled).1);
        assert!(!classify_error(TunnelError::Unrecoverable("nope".into())).1);
        assert!(
            !classify_error(TunnelError::ServerRegister {
                cause: "gone".into(),
                permanent: true
            })
            .1
        );
        assert!(
            classify_error(TunnelError::ServerRegister {
                cause: "busy".into(),
                permanent: false
            })
            .1
        );
        assert!(
            !classify_error(TunnelError::EdgeQuicDial {
                cause: "refused".into(),
                is_crypto: false
            })
            .1
        );
        assert!(
            classify_error(TunnelError::Reconnect(crate::connection::ReconnectSignal {
                delay: Duration::ZERO
            }))
            .1
        );
        assert!(classify_error(dial_err()).1);
        assert!(classify_error(TunnelError::SessionPanic("boom".into())).1);
    }
}
