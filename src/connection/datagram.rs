//! Datagram handlers for QUIC connections.
//!
//! Session semantics live outside this crate; the handlers here keep the
//! datagram channel serviced: v3 frames carry a one-byte type prefix and
//! ping frames are answered, v2 payloads are raw and only drained.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use super::{map_quic_close, DatagramVersion, TunnelError};

/// v3 datagram type prefixes.
const V3_TYPE_PING: u8 = 0x02;

pub struct DatagramHandler {
    version: DatagramVersion,
    conn: quinn::Connection,
    conn_index: u8,
}

impl DatagramHandler {
    pub fn new(version: DatagramVersion, conn: quinn::Connection, conn_index: u8) -> Self {
        Self {
            version,
            conn,
            conn_index,
        }
    }

    /// Service inbound datagrams until the connection dies.
    pub async fn run(&self) -> TunnelError {
        loop {
            match self.conn.read_datagram().await {
                Ok(payload) => {
                    if let Err(e) = self.handle(payload).await {
                        return e;
                    }
                }
                Err(e) => {
                    debug!(conn_index = self.conn_index, error = %e, "datagram channel closed");
                    return map_quic_close(&e);
                }
            }
        }
    }

    async fn handle(&self, payload: Bytes) -> Result<(), TunnelError> {
        match self.version {
            DatagramVersion::V2 => {
                trace!(conn_index = self.conn_index, len = payload.len(), "dropping v2 session datagram");
            }
            DatagramVersion::V3 => match payload.first() {
                Some(&V3_TYPE_PING) => {
                    let mut pong = BytesMut::with_capacity(payload.len());
                    pong.put_u8(V3_TYPE_PING);
                    pong.extend_from_slice(&payload[1..]);
                    if let Err(e) = self.conn.send_datagram(pong.freeze()) {
                        return Err(TunnelError::DatagramManager(format!(
                            "failed to answer datagram ping: {e}"
                        )));
                    }
                }
                Some(other) => {
                    trace!(conn_index = self.conn_index, datagram_type = other, "dropping v3 session datagram");
                }
                None => {}
            },
        }
        Ok(())
    }
}
