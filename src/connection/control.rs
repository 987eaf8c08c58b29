//! The control session run over every tunnel transport: register with the
//! edge, keep the connection alive with pings, honor server-initiated
//! reconnects, and unregister on graceful shutdown.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::watch;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::signal::wait_flag;

use super::protocol::{
    reject_code, write_frame, Frame, FrameReader, MsgType, ReconnectPayload, RegisterAckPayload,
    RegisterErrPayload, RegisterPayload,
};
use super::{ConnectedNotifier, ReconnectSignal, TunnelError};

/// Everything one control session needs to register and stay alive.
#[derive(Debug, Clone)]
pub struct ControlStreamParams {
    pub conn_index: u8,
    pub tunnel_id: String,
    pub client_version: String,
    pub tags: HashMap<String, String>,
    pub previous_attempts: u8,
    pub rpc_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub grace_period: Duration,
}

/// Run the control session until the transport fails, the server asks for a
/// reconnect, or graceful shutdown drains it. Returns `Ok(())` only on a
/// clean shutdown.
pub async fn serve_control_stream<S>(
    stream: S,
    params: &ControlStreamParams,
    notifier: &dyn ConnectedNotifier,
    mut graceful_shutdown: watch::Receiver<bool>,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);

    register(&mut reader, &mut writer, params, notifier).await?;

    let mut ticker = tokio::time::interval(params.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    // Set once graceful shutdown starts; after the deadline the session
    // ends even if the server never closes its side.
    let mut drain_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            frame = reader.next_frame() => match frame {
                Ok(frame) => match frame.msg_type {
                    MsgType::Pong => {}
                    MsgType::Ping => {
                        let pong = Frame::new(MsgType::Pong, Bytes::new());
                        let _ = write_with_timeout(&mut writer, &pong, params.write_timeout).await;
                    }
                    MsgType::Reconnect if drain_deadline.is_none() => {
                        let payload: ReconnectPayload = frame
                            .decode_payload()
                            .map_err(|e| TunnelError::ControlStream(e.to_string()))?;
                        let signal = ReconnectSignal {
                            delay: Duration::from_secs(payload.delay_secs),
                        };
                        info!(conn_index = params.conn_index, delay_secs = payload.delay_secs,
                            "edge requested reconnect");
                        return Err(TunnelError::Reconnect(signal));
                    }
                    other => {
                        debug!(conn_index = params.conn_index, msg_type = ?other,
                            "ignoring unexpected control frame");
                    }
                },
                Err(e) if drain_deadline.is_some() => {
                    // The server closing its side completes the drain.
                    debug!(conn_index = params.conn_index, error = %e, "control stream drained");
                    return Ok(());
                }
                Err(e) => return Err(TunnelError::Io(e)),
            },
            _ = ticker.tick(), if drain_deadline.is_none() => {
                let ping = Frame::new(MsgType::Ping, Bytes::new());
                write_with_timeout(&mut writer, &ping, params.write_timeout).await?;
            }
            _ = wait_flag(&mut graceful_shutdown), if drain_deadline.is_none() => {
                let unregister = Frame::new(MsgType::Unregister, Bytes::new());
                if let Err(e) =
                    write_with_timeout(&mut writer, &unregister, params.write_timeout).await
                {
                    warn!(conn_index = params.conn_index, error = %e, "failed to send unregister");
                    return Ok(());
                }
                debug!(conn_index = params.conn_index, "unregistered, draining connection");
                drain_deadline = Some(Instant::now() + params.grace_period);
            }
            _ = sleep_until_opt(drain_deadline), if drain_deadline.is_some() => {
                return Ok(());
            }
        }
    }
}

async fn register<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut WriteHalf<W>,
    params: &ControlStreamParams,
    notifier: &dyn ConnectedNotifier,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite,
{
    let payload = RegisterPayload {
        tunnel_id: params.tunnel_id.clone(),
        conn_index: params.conn_index,
        client_version: params.client_version.clone(),
        tags: params.tags.clone(),
        previous_attempts: params.previous_attempts,
    };
    let frame = Frame::json(MsgType::Register, &payload)
        .map_err(|e| TunnelError::ControlStream(e.to_string()))?;
    write_with_timeout(writer, &frame, params.write_timeout).await?;

    let response = timeout(params.rpc_timeout, reader.next_frame())
        .await
        .map_err(|_| {
            TunnelError::ControlStream("timed out waiting for registration response".to_string())
        })?
        .map_err(|e| {
            TunnelError::ControlStream(format!("failed to read registration response: {e}"))
        })?;

    match response.msg_type {
        MsgType::RegisterAck => {
            let ack: RegisterAckPayload = response
                .decode_payload()
                .map_err(|e| TunnelError::ControlStream(e.to_string()))?;
            info!(conn_index = params.conn_index, location = %ack.location,
                "registered tunnel connection");
            notifier.connected(&ack.location);
            Ok(())
        }
        MsgType::RegisterErr => {
            let err: RegisterErrPayload = response
                .decode_payload()
                .map_err(|e| TunnelError::ControlStream(e.to_string()))?;
            if err.code == reject_code::DUP_CONN {
                return Err(TunnelError::DupConnRegister);
            }
            Err(TunnelError::ServerRegister {
                cause: err.message,
                permanent: err.permanent,
            })
        }
        other => Err(TunnelError::ControlStream(format!(
            "unexpected {other:?} frame before registration completed"
        ))),
    }
}

async fn write_with_timeout<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    write_timeout: Duration,
) -> Result<(), TunnelError> {
    match timeout(write_timeout, write_frame(writer, frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TunnelError::ControlStream(format!(
            "failed to write control frame: {e}"
        ))),
        Err(_) => Err(TunnelError::ControlStream(
            "control frame write timed out".to_string(),
        )),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
