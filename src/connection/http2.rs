//! HTTP2 tunnel connection: the control session runs directly over the TLS
//! stream produced by the edge dialer, alongside the operator-reconnect
//! listener.

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::signal::wait_flag;

use super::control::{serve_control_stream, ControlStreamParams};
use super::{listen_reconnect, ConnectedNotifier, SharedReconnectRx, TunnelError};

pub async fn serve_http2(
    tls_stream: TlsStream<TcpStream>,
    params: &ControlStreamParams,
    notifier: &dyn ConnectedNotifier,
    reconnect_rx: SharedReconnectRx,
    graceful_shutdown: watch::Receiver<bool>,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), TunnelError> {
    debug!(conn_index = params.conn_index, "connecting via http2");
    tokio::select! {
        result = serve_control_stream(tls_stream, params, notifier, graceful_shutdown) => result,
        signal = listen_reconnect(reconnect_rx) => {
            debug!(conn_index = params.conn_index, "forcefully breaking http2 connection");
            Err(TunnelError::Reconnect(signal))
        }
        _ = wait_flag(&mut cancel) => Err(TunnelError::Canceled),
    }
}
