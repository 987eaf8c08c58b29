//! Application lifecycle: wiring, signal handling, and shutdown.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{Config, TransportChoice};
use crate::connection::quic::QuicTlsSettings;
use crate::connection::tracker::ConnTracker;
use crate::connection::{
    reconnect_channel, ConnectionEvent, FeatureSnapshot, Observer, Protocol, ProtocolSelector,
    ReconnectSignal, TunnelError,
};
use crate::edge::Edge;
use crate::metrics::TunnelMetrics;
use crate::signal::signal_pair;
use crate::supervisor::tunnel::{EdgeTunnelServer, TunnelConfig, TunnelServer};
use crate::supervisor::Supervisor;

/// Run the agent after config has been parsed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tunnel_id = %config.tunnel_id,
        ha_connections = config.ha_connections,
        protocol = ?config.protocol,
        proxied = config.edge_proxy_url.is_some(),
        "viaduct starting"
    );

    let edge_addrs = Arc::new(Edge::static_edge(&config.edge_addrs)?);
    let metrics = TunnelMetrics::new();
    let (observer, events) = Observer::new(Arc::clone(&metrics));
    let tracker = Arc::new(ConnTracker::new());
    let (reconnect_tx, reconnect_rx) = reconnect_channel();
    let (graceful_tx, graceful_rx) = watch::channel(false);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let tunnel_config = Arc::new(build_tunnel_config(&config)?);
    let tunnel_server: Arc<dyn TunnelServer> = Arc::new(EdgeTunnelServer::new(
        Arc::clone(&tunnel_config),
        Arc::clone(&edge_addrs),
        tracker,
        observer,
        reconnect_rx,
        graceful_rx.clone(),
    ));
    let supervisor = Supervisor::new(tunnel_config, edge_addrs, tunnel_server, graceful_rx);

    tokio::spawn(log_connection_events(events));
    spawn_reconnect_trigger(reconnect_tx);

    let (connected_signal, mut connected) = signal_pair();
    tokio::spawn(async move {
        if connected.wait().await {
            info!("tunnel is ready");
        }
    });

    let mut run_handle = tokio::spawn(supervisor.run(cancel_rx, connected_signal));

    tokio::select! {
        result = &mut run_handle => return finish(result, &metrics),
        _ = wait_for_shutdown() => {
            info!("shutdown signal received, draining tunnel connections");
            let _ = graceful_tx.send(true);
        }
    }

    tokio::select! {
        result = &mut run_handle => finish(result, &metrics),
        _ = wait_for_shutdown() => {
            warn!("second shutdown signal, terminating immediately");
            let _ = cancel_tx.send(true);
            finish(run_handle.await, &metrics)
        }
    }
}

fn finish(
    result: Result<Result<(), TunnelError>, tokio::task::JoinError>,
    metrics: &TunnelMetrics,
) -> anyhow::Result<()> {
    info!(
        registrations = metrics.registrations.load(Ordering::Relaxed),
        registration_failures = metrics.registration_failures.load(Ordering::Relaxed),
        reconnects = metrics.reconnects.load(Ordering::Relaxed),
        "final tunnel counters"
    );
    match result {
        Ok(Ok(())) => {
            info!("viaduct stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(anyhow::anyhow!("supervisor task failed: {e}")),
    }
}

fn build_tunnel_config(config: &Config) -> anyhow::Result<TunnelConfig> {
    let mut tags = HashMap::new();
    for tag in &config.tags {
        let (key, value) = tag
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("malformed tag {tag:?}"))?;
        tags.insert(key.to_string(), value.to_string());
    }

    let protocol_selector = match config.protocol {
        TransportChoice::Auto | TransportChoice::Quic => {
            ProtocolSelector::new(Protocol::Quic, Some(Protocol::Http2))
        }
        TransportChoice::Http2 => ProtocolSelector::new(Protocol::Http2, None),
    };

    let roots = Arc::new(rustls::RootCertStore::from_iter(
        webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
    ));
    let alpn = vec![b"viaduct".to_vec()];
    let mut http2_tls = rustls::ClientConfig::builder()
        .with_root_certificates(Arc::clone(&roots))
        .with_no_client_auth();
    http2_tls.alpn_protocols = alpn.clone();

    let server_name = rustls::pki_types::ServerName::try_from(config.edge_server_name.clone())
        .map_err(|e| anyhow::anyhow!("invalid edge server name: {e}"))?;

    Ok(TunnelConfig {
        tunnel_id: config.tunnel_id.clone(),
        client_version: env!("CARGO_PKG_VERSION").to_string(),
        tags,
        ha_connections: config.ha_connections,
        retries: config.retries,
        max_edge_addr_retries: config.max_edge_addr_retries,
        edge_bind_addr: config.edge_bind_addr,
        edge_proxy_url: config.edge_proxy_url.clone(),
        grace_period: Duration::from_secs(config.grace_period_secs),
        rpc_timeout: Duration::from_secs(config.rpc_timeout_secs),
        write_stream_timeout: Duration::from_secs(config.write_stream_timeout_secs),
        ping_interval: Duration::from_secs(config.ping_interval_secs),
        features: FeatureSnapshot {
            post_quantum: config.post_quantum,
            fips: config.fips,
            datagram_version: config.datagram_version,
        },
        protocol_selector,
        http2_tls: Arc::new(http2_tls),
        quic_tls: QuicTlsSettings {
            roots,
            alpn,
            server_name: config.edge_server_name.clone(),
        },
        server_name,
        icmp_router: None,
        origin_dns: None,
    })
}

async fn log_connection_events(
    mut events: tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected {
                conn_index,
                protocol,
                location,
            } => {
                info!(conn_index, %protocol, %location, "connection registered");
            }
            ConnectionEvent::Disconnected { conn_index } => {
                info!(conn_index, "connection unregistered");
            }
            ConnectionEvent::Reconnecting { conn_index } => {
                info!(conn_index, "connection reconnecting");
            }
        }
    }
}

/// SIGUSR1 asks one live connection to re-establish itself.
#[cfg(unix)]
fn spawn_reconnect_trigger(reconnect_tx: tokio::sync::mpsc::Sender<ReconnectSignal>) {
    tokio::spawn(async move {
        let mut usr1 = match signal::unix::signal(signal::unix::SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to install SIGUSR1 handler");
                return;
            }
        };
        while usr1.recv().await.is_some() {
            info!("operator requested reconnect");
            if reconnect_tx
                .send(ReconnectSignal {
                    delay: Duration::ZERO,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reconnect_trigger(_reconnect_tx: tokio::sync::mpsc::Sender<ReconnectSignal>) {}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
