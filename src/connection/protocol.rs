//! Binary control-frame codec for the tunnel control stream.
//!
//! Frame layout (6-byte header + JSON payload):
//! ```text
//! | msg_type (1B) | flags (1B) | payload_len (4B) | payload (NB) |
//! ```

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_SIZE: usize = 6;

/// Upper bound on a control payload; anything larger is a protocol error.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Message types for the tunnel control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Register = 0x01,
    RegisterAck = 0x02,
    RegisterErr = 0x03,
    Unregister = 0x04,
    Ping = 0x10,
    Pong = 0x11,
    Reconnect = 0x12,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::RegisterAck),
            0x03 => Some(Self::RegisterErr),
            0x04 => Some(Self::Unregister),
            0x10 => Some(Self::Ping),
            0x11 => Some(Self::Pong),
            0x12 => Some(Self::Reconnect),
            _ => None,
        }
    }
}

/// A single control frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: MsgType,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: MsgType, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            flags: 0,
            payload: payload.into(),
        }
    }

    /// Frame carrying a JSON-encoded payload.
    pub fn json<T: Serialize>(msg_type: MsgType, payload: &T) -> Result<Self, ProtocolError> {
        let body = serde_json::to_vec(payload).map_err(ProtocolError::Payload)?;
        Ok(Self::new(msg_type, body))
    }

    pub fn decode_payload<'a, T: Deserialize<'a>>(&'a self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(ProtocolError::Payload)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.flags);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        buf.freeze()
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMsgType(u8),
    #[error("payload of {0} bytes exceeds the control frame limit")]
    PayloadTooLarge(usize),
    #[error("malformed payload: {0}")]
    Payload(#[source] serde_json::Error),
}

impl From<ProtocolError> for std::io::Error {
    fn from(e: ProtocolError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

/// Incremental, cancel-safe frame reader. Bytes consumed from the transport
/// survive a dropped `next_frame` future in the internal buffer.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    pub async fn next_frame(&mut self) -> std::io::Result<Frame> {
        loop {
            if let Some(frame) = self.try_parse()? {
                return Ok(frame);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "control stream closed",
                ));
            }
        }
    }

    fn try_parse(&mut self) -> std::io::Result<Option<Frame>> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let payload_len =
            u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(payload_len).into());
        }
        if self.buf.len() < HEADER_SIZE + payload_len {
            return Ok(None);
        }
        let mut header = self.buf.split_to(HEADER_SIZE);
        let msg_type_raw = header.get_u8();
        let flags = header.get_u8();
        let msg_type =
            MsgType::from_u8(msg_type_raw).ok_or(ProtocolError::UnknownMsgType(msg_type_raw))?;
        let payload = self.buf.split_to(payload_len).freeze();
        Ok(Some(Frame {
            msg_type,
            flags,
            payload,
        }))
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> std::io::Result<()> {
    w.write_all(&frame.encode()).await?;
    w.flush().await
}

/// Registration request sent as the first frame on every connection.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub tunnel_id: String,
    pub conn_index: u8,
    pub client_version: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// How many times this connection index already failed to register,
    /// so the edge can de-prioritize flapping clients.
    #[serde(default)]
    pub previous_attempts: u8,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterAckPayload {
    /// Edge location that accepted the connection, e.g. a colo name.
    pub location: String,
}

/// Registration rejection codes the client reacts to by name.
pub mod reject_code {
    /// Another connection holds this connection index.
    pub const DUP_CONN: &str = "dup_conn";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterErrPayload {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub permanent: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReconnectPayload {
    #[serde(default)]
    pub delay_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn encodes_header_and_payload() {
        let frame = Frame::new(MsgType::Ping, Bytes::from_static(b"ab"));
        let encoded = frame.encode();
        assert_eq!(&encoded[..], &[0x10, 0x00, 0, 0, 0, 2, b'a', b'b']);
    }

    #[tokio::test]
    async fn reader_reassembles_split_frames() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        let frame = Frame::json(
            MsgType::Reconnect,
            &ReconnectPayload { delay_secs: 3 },
        )
        .unwrap();
        let encoded = frame.encode();
        // Deliver the header and payload in separate writes.
        client.write_all(&encoded[..4]).await.unwrap();
        let read = tokio::spawn(async move { reader.next_frame().await });
        client.write_all(&encoded[4..]).await.unwrap();

        let got = read.await.unwrap().unwrap();
        assert_eq!(got.msg_type, MsgType::Reconnect);
        let payload: ReconnectPayload = got.decode_payload().unwrap();
        assert_eq!(payload.delay_secs, 3);
    }

    #[tokio::test]
    async fn reader_rejects_unknown_type() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        client
            .write_all(&[0x7f, 0x00, 0, 0, 0, 0])
            .await
            .unwrap();
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn reader_rejects_oversized_payload() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        let mut header = vec![0x10, 0x00];
        header.extend_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_be_bytes());
        client.write_all(&header).await.unwrap();
        assert!(reader.next_frame().await.is_err());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        client.write_all(&[0x10, 0x00, 0, 0]).await.unwrap();
        drop(client);
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
