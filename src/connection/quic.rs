//! QUIC tunnel connection: quinn endpoint setup, curve-preference policy,
//! the control session over the first bidirectional stream, and the
//! datagram handler.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::SupportedKxGroup;
use tokio::sync::watch;
use tracing::{debug, error, trace};

use crate::signal::wait_flag;

use super::control::{serve_control_stream, ControlStreamParams};
use super::datagram::DatagramHandler;
use super::{
    listen_reconnect, map_quic_close, ConnectedNotifier, FeatureSnapshot, PostQuantumMode,
    SharedReconnectRx, TunnelError,
};

/// An idle QUIC tunnel is torn down after this long without packets.
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
/// Transport-level keepalive, well inside the idle timeout.
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(1);

/// TLS material the QUIC dialer assembles a fresh client config from on
/// every attempt (curve preferences can differ per attempt).
#[derive(Clone)]
pub struct QuicTlsSettings {
    pub roots: Arc<rustls::RootCertStore>,
    pub alpn: Vec<Vec<u8>>,
    pub server_name: String,
}

/// Key-exchange groups for the QUIC handshake, decided from the post-quantum
/// mode and FIPS flag.
pub(crate) fn curve_preferences(
    pq: PostQuantumMode,
    fips: bool,
) -> Result<Vec<&'static dyn SupportedKxGroup>, TunnelError> {
    use rustls::crypto::ring::kx_group::{SECP256R1, SECP384R1, X25519};

    if pq == PostQuantumMode::Strict {
        if fips {
            return Err(TunnelError::Tls(
                "strict post-quantum mode is not supported together with FIPS".to_string(),
            ));
        }
        return Err(TunnelError::Tls(
            "strict post-quantum mode requires an ML-KEM key exchange, which the configured \
             crypto provider does not offer"
                .to_string(),
        ));
    }

    if fips {
        return Ok(vec![SECP256R1, SECP384R1]);
    }
    Ok(vec![X25519, SECP256R1, SECP384R1])
}

/// UDP payload size for the first flight. Edges are commonly reached across
/// 1280-MTU overlays, so stay under that after IP + UDP headers.
pub(crate) fn initial_packet_size(edge_udp_addr: &SocketAddr) -> u16 {
    if edge_udp_addr.is_ipv4() {
        1232
    } else {
        1252
    }
}

fn quic_dial_error(e: &quinn::ConnectionError) -> TunnelError {
    TunnelError::EdgeQuicDial {
        cause: e.to_string(),
        is_crypto: is_crypto_error(e),
    }
}

fn is_crypto_error(e: &quinn::ConnectionError) -> bool {
    matches!(e, quinn::ConnectionError::TransportError(te)
        if te.to_string().contains("cryptographic handshake failed"))
}

/// Dial failures are only escalated to the crash-report sink for crypto
/// errors under FIPS with strict post-quantum; everything else stays a
/// local log event.
pub(crate) fn report_crypto_failure(err: &TunnelError, features: &FeatureSnapshot) {
    if let TunnelError::EdgeQuicDial {
        cause,
        is_crypto: true,
    } = err
    {
        if features.fips && features.post_quantum == PostQuantumMode::Strict {
            error!(target: "crash_report", error = %cause,
                "QUIC crypto failure under FIPS with strict post-quantum");
        }
    }
}

async fn dial_quic(
    settings: &QuicTlsSettings,
    features: &FeatureSnapshot,
    edge_udp_addr: SocketAddr,
    local_ip: Option<IpAddr>,
    dial_timeout: Duration,
) -> Result<(quinn::Endpoint, quinn::Connection), TunnelError> {
    let kx_groups = curve_preferences(features.post_quantum, features.fips)?;
    debug!(groups = ?kx_groups.iter().map(|g| g.name()).collect::<Vec<_>>(),
        "tunnel connection curve preferences");

    let mut provider = rustls::crypto::ring::default_provider();
    provider.kx_groups = kx_groups;
    let mut tls = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TunnelError::Tls(e.to_string()))?
        .with_root_certificates(Arc::clone(&settings.roots))
        .with_no_client_auth();
    tls.alpn_protocols = settings.alpn.clone();

    let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| TunnelError::Tls(e.to_string()))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_tls));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(MAX_IDLE_TIMEOUT)
            .map_err(|e| TunnelError::Tls(e.to_string()))?,
    ));
    transport.keep_alive_interval(Some(KEEP_ALIVE_PERIOD));
    transport.initial_mtu(initial_packet_size(&edge_udp_addr));
    client_config.transport_config(Arc::new(transport));

    let bind_addr = match (local_ip, &edge_udp_addr) {
        (Some(ip), _) => SocketAddr::new(ip, 0),
        (None, SocketAddr::V4(_)) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        (None, SocketAddr::V6(_)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let mut endpoint = quinn::Endpoint::client(bind_addr).map_err(|e| TunnelError::EdgeQuicDial {
        cause: e.to_string(),
        is_crypto: false,
    })?;
    endpoint.set_default_client_config(client_config);

    let connecting = endpoint
        .connect(edge_udp_addr, &settings.server_name)
        .map_err(|e| TunnelError::EdgeQuicDial {
            cause: e.to_string(),
            is_crypto: false,
        })?;
    let conn = match tokio::time::timeout(dial_timeout, connecting).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => return Err(quic_dial_error(&e)),
        Err(_) => {
            return Err(TunnelError::EdgeQuicDial {
                cause: "handshake timed out".to_string(),
                is_crypto: false,
            })
        }
    };
    Ok((endpoint, conn))
}

#[allow(clippy::too_many_arguments)]
pub async fn serve_quic(
    settings: &QuicTlsSettings,
    features: &FeatureSnapshot,
    edge_udp_addr: SocketAddr,
    local_ip: Option<IpAddr>,
    dial_timeout: Duration,
    params: &ControlStreamParams,
    notifier: &dyn ConnectedNotifier,
    reconnect_rx: SharedReconnectRx,
    graceful_shutdown: watch::Receiver<bool>,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), TunnelError> {
    let (endpoint, conn) =
        match dial_quic(settings, features, edge_udp_addr, local_ip, dial_timeout).await {
            Ok(dialed) => dialed,
            Err(e) => {
                report_crypto_failure(&e, features);
                return Err(e);
            }
        };
    debug!(conn_index = params.conn_index, addr = %edge_udp_addr, "connecting via quic");

    let (send, recv) = match conn.open_bi().await {
        Ok(pair) => pair,
        Err(e) => return Err(map_quic_close(&e)),
    };
    let control = tokio::io::join(recv, send);
    let datagrams = DatagramHandler::new(features.datagram_version, conn.clone(), params.conn_index);

    let result = tokio::select! {
        result = serve_control_stream(control, params, notifier, graceful_shutdown) => match result {
            // Stream-level failures usually have a connection-level cause
            // (idle timeout, transport error); surface that instead.
            Err(TunnelError::Io(e)) => match conn.close_reason() {
                Some(reason) => Err(map_quic_close(&reason)),
                None => Err(TunnelError::Io(e)),
            },
            other => other,
        },
        err = datagrams.run() => Err(err),
        err = listen_streams(&conn, params.conn_index) => Err(err),
        signal = listen_reconnect(reconnect_rx) => {
            debug!(conn_index = params.conn_index, "forcefully breaking quic connection");
            Err(TunnelError::Reconnect(signal))
        }
        _ = wait_flag(&mut cancel) => Err(TunnelError::Canceled),
    };

    conn.close(0u32.into(), b"");
    endpoint.close(0u32.into(), b"");
    result
}

/// Edge-initiated streams carry session traffic handled elsewhere; accept
/// and drain them so they do not back up the connection.
async fn listen_streams(conn: &quinn::Connection, conn_index: u8) -> TunnelError {
    loop {
        match conn.accept_bi().await {
            Ok((_send, mut recv)) => {
                trace!(conn_index, "draining edge-initiated stream");
                tokio::spawn(async move {
                    let mut buf = [0u8; 4 * 1024];
                    while matches!(recv.read(&mut buf).await, Ok(Some(_))) {}
                });
            }
            Err(e) => {
                return TunnelError::StreamListener(map_quic_close(&e).to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_size_fits_overlay_mtu() {
        let v4: SocketAddr = "198.51.100.1:7844".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:7844".parse().unwrap();
        assert_eq!(initial_packet_size(&v4), 1232);
        assert_eq!(initial_packet_size(&v6), 1252);
    }

    #[test]
    fn fips_restricts_curves_to_nist_groups() {
        let groups = curve_preferences(PostQuantumMode::Disabled, true).unwrap();
        let names: Vec<_> = groups.iter().map(|g| g.name()).collect();
        assert_eq!(
            names,
            vec![rustls::NamedGroup::secp256r1, rustls::NamedGroup::secp384r1]
        );
    }

    #[test]
    fn default_curves_prefer_x25519() {
        let groups = curve_preferences(PostQuantumMode::Preferred, false).unwrap();
        assert_eq!(groups[0].name(), rustls::NamedGroup::X25519);
    }

    #[test]
    fn strict_post_quantum_is_rejected_without_provider_support() {
        assert!(matches!(
            curve_preferences(PostQuantumMode::Strict, false),
            Err(TunnelError::Tls(_))
        ));
        assert!(matches!(
            curve_preferences(PostQuantumMode::Strict, true),
            Err(TunnelError::Tls(_))
        ));
    }
}
