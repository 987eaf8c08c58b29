//! The connection supervisor: owns every HA connection index, brings the
//! first tunnel up before staggering the rest, and reacts to terminations,
//! reconnect signals, and graceful shutdown.

pub mod fallback;
pub mod tunnel;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

use crate::connection::TunnelError;
use crate::edge::{Edge, EdgeDiscoveryError};
use crate::retry::BackoffHandler;
use crate::signal::{wait_flag, Signal, SignalWaiter};

use fallback::ProtocolFallback;
use tunnel::{TunnelConfig, TunnelServer};

/// Base wait before restarting tunnels that ended with an error.
const TUNNEL_RETRY_DURATION: Duration = Duration::from_secs(10);
/// Base wait for the per-connection backoff inside a serve attempt.
const DEFAULT_BASE_TIME: Duration = Duration::from_secs(1);
/// Pause between starting sibling HA connections, so registrations do not
/// arrive at the edge as a thundering herd.
const REGISTRATION_INTERVAL: Duration = Duration::from_secs(1);

const FIRST_CONN_INDEX: u8 = 0;

/// Result of one tunnel serve attempt, delivered to the supervisor loop.
#[derive(Debug)]
struct TunnelEvent {
    index: u8,
    result: Result<(), TunnelError>,
}

enum InitOutcome {
    Started,
    /// Shutdown was requested before the first tunnel connected.
    EarlyShutdown,
}

pub struct Supervisor {
    config: Arc<TunnelConfig>,
    edge_addrs: Arc<Edge>,
    tunnel_server: Arc<dyn TunnelServer>,
    tunnel_errors_tx: mpsc::Sender<TunnelEvent>,
    tunnel_errors_rx: mpsc::Receiver<TunnelEvent>,
    tunnels_connecting: HashMap<u8, SignalWaiter>,
    tunnels_protocol_fallback: HashMap<u8, Arc<Mutex<ProtocolFallback>>>,
    next_connected_index: u8,
    next_connected_signal: Option<SignalWaiter>,
    graceful_shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(
        config: Arc<TunnelConfig>,
        edge_addrs: Arc<Edge>,
        tunnel_server: Arc<dyn TunnelServer>,
        graceful_shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tunnel_errors_tx, tunnel_errors_rx) = mpsc::channel(1);
        Self {
            config,
            edge_addrs,
            tunnel_server,
            tunnel_errors_tx,
            tunnel_errors_rx,
            tunnels_connecting: HashMap::new(),
            tunnels_protocol_fallback: HashMap::new(),
            next_connected_index: FIRST_CONN_INDEX,
            next_connected_signal: None,
            graceful_shutdown,
        }
    }

    /// Run until every connection index is done. `connected_signal` fires
    /// when the first tunnel finishes registration.
    pub async fn run(
        mut self,
        cancel: watch::Receiver<bool>,
        connected_signal: Signal,
    ) -> Result<(), TunnelError> {
        if let Some(icmp) = self.config.icmp_router.clone() {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = icmp.serve(cancel).await {
                    warn!(error = %e, "icmp router terminated");
                }
            });
        }
        if let Some(dns) = self.config.origin_dns.clone() {
            let cancel = cancel.clone();
            tokio::spawn(async move { dns.run_refresh_loop(cancel).await });
        }

        let available = self.edge_addrs.available_addrs();
        let mut ha_connections = self.config.ha_connections;
        if ha_connections as usize > available {
            info!(
                requested = ha_connections,
                available, "clamping HA connections to the available edge addresses"
            );
            ha_connections = available.min(u8::MAX as usize) as u8;
        }

        match self
            .initialize(&cancel, &connected_signal, ha_connections)
            .await
        {
            Ok(InitOutcome::Started) => {}
            Ok(InitOutcome::EarlyShutdown) => return Ok(()),
            Err(e) => {
                error!(error = %e, "initial tunnel connection failed");
                return Err(e);
            }
        }

        self.event_loop(cancel, ha_connections as usize).await
    }

    async fn event_loop(
        &mut self,
        cancel: watch::Receiver<bool>,
        mut tunnels_active: usize,
    ) -> Result<(), TunnelError> {
        let mut tunnels_waiting: Vec<u8> = Vec::new();
        let mut backoff = BackoffHandler::new(self.config.retries, TUNNEL_RETRY_DURATION, true);
        let mut backoff_timer: Option<Pin<Box<Sleep>>> = None;
        let mut shutting_down = false;

        let mut cancel_rx = cancel.clone();
        let mut graceful = self.graceful_shutdown.clone();

        enum LoopEvent {
            Canceled,
            Tunnel(TunnelEvent),
            BackoffFired,
            Connected(bool),
            GracefulShutdown,
        }

        loop {
            let event = tokio::select! {
                _ = wait_flag(&mut cancel_rx) => LoopEvent::Canceled,
                Some(event) = self.tunnel_errors_rx.recv() => LoopEvent::Tunnel(event),
                _ = fire_backoff(&mut backoff_timer) => LoopEvent::BackoffFired,
                connected = wait_next_connected(&mut self.next_connected_signal) => {
                    LoopEvent::Connected(connected)
                }
                _ = wait_flag(&mut graceful), if !shutting_down => LoopEvent::GracefulShutdown,
            };

            match event {
                LoopEvent::Canceled => {
                    while tunnels_active > 0 {
                        if self.tunnel_errors_rx.recv().await.is_none() {
                            break;
                        }
                        tunnels_active -= 1;
                    }
                    return Ok(());
                }
                LoopEvent::Tunnel(event) => {
                    tunnels_active = tunnels_active.saturating_sub(1);
                    match &event.result {
                        Ok(()) => debug!(conn_index = event.index, "connection exited"),
                        Err(e) => {
                            warn!(conn_index = event.index, error = %e, "connection terminated")
                        }
                    }

                    let retryable =
                        event.result.is_err() && !shutting_down && !*cancel.borrow();
                    if retryable {
                        let err = event.result.unwrap_err();
                        if matches!(err, TunnelError::Reconnect(_)) {
                            // The reconnect delay was already honored inside
                            // the serve attempt; restart without backoff.
                            self.start_tunnel(cancel.clone(), event.index);
                            tunnels_active += 1;
                            continue;
                        }
                        if !self.tunnels_protocol_fallback[&event.index]
                            .lock()
                            .unwrap()
                            .get_max_backoff_duration()
                            .1
                        {
                            info!(conn_index = event.index, "no retries left, abandoning connection");
                            continue;
                        }
                        tunnels_waiting.push(event.index);
                        self.wait_for_next_tunnel(event.index);
                        if backoff_timer.is_none() {
                            backoff_timer =
                                Some(Box::pin(tokio::time::sleep(backoff.backoff_duration())));
                        }
                    } else if tunnels_active == 0 {
                        info!("no more connections active, exiting");
                        return Ok(());
                    }
                }
                LoopEvent::BackoffFired => {
                    backoff_timer = None;
                    for index in std::mem::take(&mut tunnels_waiting) {
                        self.start_tunnel(cancel.clone(), index);
                        tunnels_active += 1;
                    }
                }
                LoopEvent::Connected(connected) => {
                    let index = self.next_connected_index;
                    let more_connecting = self.wait_for_next_tunnel(index);
                    if connected && !more_connecting && tunnels_waiting.is_empty() {
                        // Everything is up; make the next failure retry fast.
                        backoff.set_grace_period();
                    }
                }
                LoopEvent::GracefulShutdown => {
                    // Active tunnels watch the same channel and drain on
                    // their own; just stop scheduling retries.
                    shutting_down = true;
                }
            }
        }
    }

    async fn initialize(
        &mut self,
        cancel: &watch::Receiver<bool>,
        connected_signal: &Signal,
        ha_connections: u8,
    ) -> Result<InitOutcome, TunnelError> {
        self.tunnels_protocol_fallback.insert(
            FIRST_CONN_INDEX,
            Arc::new(Mutex::new(ProtocolFallback::new(
                BackoffHandler::new(self.config.retries, DEFAULT_BASE_TIME, true),
                self.config.protocol_selector.current(),
            ))),
        );
        self.start_first_tunnel(cancel.clone(), connected_signal.clone());

        let mut connected = connected_signal.waiter();
        let mut cancel_rx = cancel.clone();
        let mut graceful = self.graceful_shutdown.clone();

        enum InitEvent {
            Canceled,
            Tunnel(TunnelEvent),
            GracefulShutdown,
            Connected,
        }

        let event = tokio::select! {
            _ = wait_flag(&mut cancel_rx) => InitEvent::Canceled,
            Some(event) = self.tunnel_errors_rx.recv() => InitEvent::Tunnel(event),
            _ = wait_flag(&mut graceful) => InitEvent::GracefulShutdown,
            _ = wait_fired(&mut connected) => InitEvent::Connected,
        };

        match event {
            InitEvent::Canceled => {
                // The first tunnel observes the cancellation itself; wait
                // for its result before reporting.
                let _ = self.tunnel_errors_rx.recv().await;
                Err(TunnelError::Canceled)
            }
            InitEvent::Tunnel(event) => match event.result {
                Err(e) => Err(e),
                Ok(()) => Ok(InitOutcome::EarlyShutdown),
            },
            InitEvent::GracefulShutdown => Ok(InitOutcome::EarlyShutdown),
            InitEvent::Connected => {
                // Siblings inherit the protocol the first tunnel settled
                // on, so they do not redo a failed negotiation.
                for index in 1..ha_connections {
                    let settled = self.tunnels_protocol_fallback[&FIRST_CONN_INDEX]
                        .lock()
                        .unwrap()
                        .protocol;
                    self.tunnels_protocol_fallback.insert(
                        index,
                        Arc::new(Mutex::new(ProtocolFallback::new(
                            BackoffHandler::new(self.config.retries, DEFAULT_BASE_TIME, true),
                            settled,
                        ))),
                    );
                    self.start_tunnel(cancel.clone(), index);
                    tokio::time::sleep(REGISTRATION_INTERVAL).await;
                }
                Ok(InitOutcome::Started)
            }
        }
    }

    /// First-tunnel attempts retry in place for a restricted error class;
    /// everything else aborts initialization.
    fn start_first_tunnel(&self, cancel: watch::Receiver<bool>, connected_signal: Signal) {
        let server = Arc::clone(&self.tunnel_server);
        let fallback = Arc::clone(&self.tunnels_protocol_fallback[&FIRST_CONN_INDEX]);
        let tx = self.tunnel_errors_tx.clone();
        tokio::spawn(async move {
            let result = loop {
                let attempt = run_serve(
                    Arc::clone(&server),
                    cancel.clone(),
                    FIRST_CONN_INDEX,
                    Arc::clone(&fallback),
                    connected_signal.clone(),
                )
                .await;
                if *cancel.borrow() {
                    break attempt;
                }
                let err = match attempt {
                    Ok(()) => break Ok(()),
                    Err(e) => e,
                };
                if !fallback.lock().unwrap().get_max_backoff_duration().1 {
                    break Err(err);
                }
                if should_retry_first_tunnel(&err) {
                    debug!(error = %err, "restarting first tunnel");
                    continue;
                }
                break Err(err);
            };
            let _ = tx
                .send(TunnelEvent {
                    index: FIRST_CONN_INDEX,
                    result,
                })
                .await;
        });
    }

    fn start_tunnel(&mut self, cancel: watch::Receiver<bool>, index: u8) {
        let connected_signal = self.new_connected_tunnel_signal(index);
        let server = Arc::clone(&self.tunnel_server);
        let fallback = Arc::clone(&self.tunnels_protocol_fallback[&index]);
        let tx = self.tunnel_errors_tx.clone();
        tokio::spawn(async move {
            let result = run_serve(server, cancel, index, fallback, connected_signal).await;
            let _ = tx.send(TunnelEvent { index, result }).await;
        });
    }

    /// Install a fresh per-attempt connected signal for `index` and make it
    /// the one the event loop waits on next.
    fn new_connected_tunnel_signal(&mut self, index: u8) -> Signal {
        let (signal, waiter) = crate::signal::signal_pair();
        self.tunnels_connecting.insert(index, waiter.clone());
        self.next_connected_index = index;
        self.next_connected_signal = Some(waiter);
        signal
    }

    /// Drop `index` from the connecting set and pick any remaining entry to
    /// await next. Returns whether any connection is still mid-connect.
    fn wait_for_next_tunnel(&mut self, index: u8) -> bool {
        self.tunnels_connecting.remove(&index);
        self.next_connected_signal = None;
        if let Some((&next, waiter)) = self.tunnels_connecting.iter().next() {
            self.next_connected_index = next;
            self.next_connected_signal = Some(waiter.clone());
            true
        } else {
            false
        }
    }
}

/// Run one serve attempt in its own task so a panicking session is
/// contained and surfaced as a recoverable error.
async fn run_serve(
    server: Arc<dyn TunnelServer>,
    cancel: watch::Receiver<bool>,
    conn_index: u8,
    fallback: Arc<Mutex<ProtocolFallback>>,
    connected_signal: Signal,
) -> Result<(), TunnelError> {
    let handle = tokio::spawn(async move {
        server
            .serve(cancel, conn_index, fallback, connected_signal)
            .await
    });
    match handle.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(TunnelError::SessionPanic(message))
        }
        Err(_) => Err(TunnelError::Canceled),
    }
}

/// The error classes the first tunnel retries in place. `Unauthorized`
/// rejections are transient while a freshly-created tunnel propagates
/// through the edge. An exhausted address pool refills as sibling indices
/// rotate, so static edge configurations keep retrying through it.
fn should_retry_first_tunnel(err: &TunnelError) -> bool {
    if err.to_string().contains("Unauthorized") {
        return true;
    }
    matches!(
        err,
        TunnelError::EdgeDiscovery(EdgeDiscoveryError::NoAddressesLeft)
            | TunnelError::DupConnRegister
            | TunnelError::QuicIdleTimeout
            | TunnelError::QuicApplication(_)
            | TunnelError::Dial(_)
            | TunnelError::EdgeQuicDial { .. }
            | TunnelError::ControlStream(_)
            | TunnelError::StreamListener(_)
            | TunnelError::DatagramManager(_)
    )
}

async fn fire_backoff(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn wait_next_connected(slot: &mut Option<SignalWaiter>) -> bool {
    match slot {
        Some(waiter) => waiter.wait().await,
        None => std::future::pending().await,
    }
}

/// Like [`SignalWaiter::wait`], but pends forever instead of resolving when
/// every sender is gone.
async fn wait_fired(waiter: &mut SignalWaiter) {
    if !waiter.wait().await {
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::quic::QuicTlsSettings;
    use crate::connection::{
        DatagramVersion, FeatureSnapshot, PostQuantumMode, Protocol, ProtocolSelector,
        ReconnectSignal,
    };
    use crate::signal::signal_pair;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::time::timeout;

    enum MockOutcome {
        /// Signal connected, then hold the session until cancel or graceful
        /// shutdown.
        Connect,
        /// Fail immediately with the given error.
        Fail(TunnelError),
    }

    struct MockTunnelServer {
        scripts: Mutex<HashMap<u8, VecDeque<MockOutcome>>>,
        calls: Mutex<Vec<u8>>,
        graceful_shutdown: watch::Receiver<bool>,
    }

    impl MockTunnelServer {
        fn new(graceful_shutdown: watch::Receiver<bool>) -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                graceful_shutdown,
            }
        }

        fn script(&self, index: u8, outcomes: Vec<MockOutcome>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(index, outcomes.into());
        }

        fn calls(&self) -> Vec<u8> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TunnelServer for MockTunnelServer {
        async fn serve(
            &self,
            mut cancel: watch::Receiver<bool>,
            conn_index: u8,
            protocol_fallback: Arc<Mutex<ProtocolFallback>>,
            connected_signal: Signal,
        ) -> Result<(), TunnelError> {
            self.calls.lock().unwrap().push(conn_index);
            let outcome = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&conn_index)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(MockOutcome::Connect);
            match outcome {
                MockOutcome::Connect => {
                    protocol_fallback.lock().unwrap().reset();
                    connected_signal.notify();
                    let mut graceful = self.graceful_shutdown.clone();
                    tokio::select! {
                        _ = wait_flag(&mut cancel) => Err(TunnelError::Canceled),
                        _ = wait_flag(&mut graceful) => Ok(()),
                    }
                }
                MockOutcome::Fail(err) => Err(err),
            }
        }
    }

    struct Harness {
        mock: Arc<MockTunnelServer>,
        cancel_tx: watch::Sender<bool>,
        graceful_tx: watch::Sender<bool>,
        connected: SignalWaiter,
        run: tokio::task::JoinHandle<Result<(), TunnelError>>,
    }

    fn test_config(ha_connections: u8) -> Arc<TunnelConfig> {
        let roots = Arc::new(rustls::RootCertStore::empty());
        let http2_tls = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(Arc::clone(&roots))
                .with_no_client_auth(),
        );
        Arc::new(TunnelConfig {
            tunnel_id: "test-tunnel".to_string(),
            client_version: "test".to_string(),
            tags: HashMap::new(),
            ha_connections,
            retries: 5,
            max_edge_addr_retries: 8,
            edge_bind_addr: None,
            edge_proxy_url: None,
            grace_period: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(5),
            write_stream_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            features: FeatureSnapshot {
                post_quantum: PostQuantumMode::Disabled,
                fips: false,
                datagram_version: DatagramVersion::V2,
            },
            protocol_selector: ProtocolSelector::new(Protocol::Quic, Some(Protocol::Http2)),
            http2_tls,
            quic_tls: QuicTlsSettings {
                roots,
                alpn: vec![b"viaduct".to_vec()],
                server_name: "edge.test".to_string(),
            },
            server_name: rustls::pki_types::ServerName::try_from("edge.test").unwrap(),
            icmp_router: None,
            origin_dns: None,
        })
    }

    fn start(ha_connections: u8, available_addrs: usize, scripts: Vec<(u8, Vec<MockOutcome>)>) -> Harness {
        let addrs: Vec<String> = (0..available_addrs)
            .map(|i| format!("127.0.0.{}:7844", i + 1))
            .collect();
        let edge = Arc::new(Edge::static_edge(&addrs).unwrap());
        let (graceful_tx, graceful_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mock = Arc::new(MockTunnelServer::new(graceful_rx.clone()));
        for (index, outcomes) in scripts {
            mock.script(index, outcomes);
        }
        let supervisor = Supervisor::new(
            test_config(ha_connections),
            edge,
            Arc::clone(&mock) as Arc<dyn TunnelServer>,
            graceful_rx,
        );
        let (signal, connected) = signal_pair();
        let run = tokio::spawn(supervisor.run(cancel_rx, signal));
        Harness {
            mock,
            cancel_tx,
            graceful_tx,
            connected,
            run,
        }
    }

    async fn wait_for_calls(mock: &MockTunnelServer, at_least: usize) {
        timeout(Duration::from_secs(30), async {
            loop {
                if mock.calls().len() >= at_least {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("expected serve calls never happened");
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_brings_up_all_connections_in_order() {
        let mut harness = start(4, 10, vec![]);
        wait_for_calls(&harness.mock, 4).await;

        assert!(harness.connected.wait().await);
        assert_eq!(harness.mock.calls(), vec![0, 1, 2, 3]);

        harness.cancel_tx.send(true).unwrap();
        assert!(harness.run.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn clamps_ha_connections_to_available_addresses() {
        let mut harness = start(4, 2, vec![]);
        wait_for_calls(&harness.mock, 2).await;
        assert!(harness.connected.wait().await);

        // Give any extra spawns a chance to happen, then confirm there are
        // none beyond the clamped count.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(harness.mock.calls(), vec![0, 1]);

        harness.cancel_tx.send(true).unwrap();
        assert!(harness.run.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_first_tunnel_error_aborts_initialization() {
        let harness = start(
            4,
            10,
            vec![(
                0,
                vec![MockOutcome::Fail(TunnelError::ServerRegister {
                    cause: "tunnel deleted".to_string(),
                    permanent: true,
                })],
            )],
        );

        let result = harness.run.await.unwrap();
        match result {
            Err(TunnelError::ServerRegister { cause, permanent }) => {
                assert_eq!(cause, "tunnel deleted");
                assert!(permanent);
            }
            other => panic!("expected registration error, got {other:?}"),
        }
        // No sibling was ever started.
        assert_eq!(harness.mock.calls(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tunnel_retries_unauthorized_inline() {
        let mut harness = start(
            1,
            10,
            vec![(
                0,
                vec![
                    MockOutcome::Fail(TunnelError::ServerRegister {
                        cause: "Unauthorized: tunnel not found".to_string(),
                        permanent: false,
                    }),
                    MockOutcome::Fail(TunnelError::ServerRegister {
                        cause: "Unauthorized: tunnel not found".to_string(),
                        permanent: false,
                    }),
                    MockOutcome::Connect,
                ],
            )],
        );

        assert!(harness.connected.wait().await);
        assert_eq!(harness.mock.calls(), vec![0, 0, 0]);

        harness.cancel_tx.send(true).unwrap();
        assert!(harness.run.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_signal_respawns_without_backoff() {
        let mut harness = start(
            3,
            10,
            vec![(
                2,
                vec![
                    MockOutcome::Fail(TunnelError::Reconnect(ReconnectSignal {
                        delay: Duration::ZERO,
                    })),
                    MockOutcome::Connect,
                ],
            )],
        );

        assert!(harness.connected.wait().await);
        wait_for_calls(&harness.mock, 4).await;

        let calls = harness.mock.calls();
        assert_eq!(calls.iter().filter(|&&i| i == 2).count(), 2);
        assert_eq!(calls.iter().filter(|&&i| i == 1).count(), 1);

        harness.cancel_tx.send(true).unwrap();
        assert!(harness.run.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_drains_and_returns_ok() {
        let mut harness = start(3, 10, vec![]);
        wait_for_calls(&harness.mock, 3).await;
        assert!(harness.connected.wait().await);

        harness.graceful_tx.send(true).unwrap();
        assert!(harness.run.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sibling_is_retried_after_backoff() {
        let mut harness = start(
            2,
            10,
            vec![(
                1,
                vec![
                    MockOutcome::Fail(TunnelError::ControlStream("edge hung up".to_string())),
                    MockOutcome::Connect,
                ],
            )],
        );

        assert!(harness.connected.wait().await);
        // First attempt fails, the shared backoff timer fires, the index is
        // respawned and connects.
        wait_for_calls(&harness.mock, 3).await;
        let calls = harness.mock.calls();
        assert_eq!(calls.iter().filter(|&&i| i == 1).count(), 2);

        harness.cancel_tx.send(true).unwrap();
        assert!(harness.run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn wait_for_next_tunnel_on_empty_set_is_a_noop() {
        let (_graceful_tx, graceful_rx) = watch::channel(false);
        let mock = Arc::new(MockTunnelServer::new(graceful_rx.clone()));
        let edge = Arc::new(Edge::static_edge(&["127.0.0.1:7844".to_string()]).unwrap());
        let mut supervisor = Supervisor::new(
            test_config(1),
            edge,
            mock as Arc<dyn TunnelServer>,
            graceful_rx,
        );

        assert!(!supervisor.wait_for_next_tunnel(0));
        assert!(supervisor.next_connected_signal.is_none());

        let _signal = supervisor.new_connected_tunnel_signal(1);
        assert!(!supervisor.wait_for_next_tunnel(1));

        let _a = supervisor.new_connected_tunnel_signal(1);
        let _b = supervisor.new_connected_tunnel_signal(2);
        assert!(supervisor.wait_for_next_tunnel(2));
        assert_eq!(supervisor.next_connected_index, 1);
    }
}
