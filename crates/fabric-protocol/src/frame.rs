// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for TCP stream framing.
//!
//! Every message on the wire is:
//! - 4 bytes: payload length (big-endian)
//! - N bytes: protobuf payload

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size (64 MB)
/// Large enough for director index dumps of the densest chunks
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame header size (4 bytes length)
pub const HEADER_SIZE: usize = 4;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("buffer holds {available} bytes, {required} required")]
    Truncated { required: usize, available: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Growable byte buffer for length-prefixed messages.
///
/// `size()` always equals the number of bytes written into the buffer,
/// headers included.
#[derive(Debug, Clone, Default)]
pub struct ProtocolBuffer {
    data: BytesMut,
}

impl ProtocolBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Shrink or grow to exactly one zeroed length header, ready to receive
    /// the next 4-byte length from the socket.
    pub fn resize_to_header(&mut self) {
        self.data.clear();
        self.data.resize(HEADER_SIZE, 0);
    }

    /// Make room for a `payload_len`-byte payload following the header.
    /// The header bytes are preserved.
    pub fn resize(&mut self, payload_len: usize) -> Result<(), FrameError> {
        if payload_len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload_len));
        }
        self.data.resize(HEADER_SIZE + payload_len, 0);
        Ok(())
    }

    /// Mutable view of the length header.
    pub fn header_mut(&mut self) -> &mut [u8] {
        if self.data.len() < HEADER_SIZE {
            self.data.resize(HEADER_SIZE, 0);
        }
        &mut self.data[..HEADER_SIZE]
    }

    /// Mutable view of everything after the length header.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = HEADER_SIZE.min(self.data.len());
        &mut self.data[start..]
    }

    /// Payload length stored in the first four bytes.
    pub fn parse_length(&self) -> Result<usize, FrameError> {
        if self.data.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                required: HEADER_SIZE,
                available: self.data.len(),
            });
        }
        let len = u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]);
        let len = len as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(len));
        }
        Ok(len)
    }

    /// Append `[u32 length][encoded message]`.
    pub fn serialize<M: Message>(&mut self, msg: &M) -> Result<(), FrameError> {
        let len = msg.encoded_len();
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(len));
        }
        self.data.reserve(HEADER_SIZE + len);
        self.data.put_u32(len as u32);
        msg.encode(&mut self.data)?;
        Ok(())
    }

    /// Decode the `n` payload bytes that follow the length header.
    pub fn parse<M: Message + Default>(&self, n: usize) -> Result<M, FrameError> {
        let end = HEADER_SIZE + n;
        if self.data.len() < end {
            return Err(FrameError::Truncated {
                required: end,
                available: self.data.len(),
            });
        }
        Ok(M::decode(&self.data[HEADER_SIZE..end])?)
    }

    /// Copy of the payload bytes following the length header.
    pub fn payload(&self) -> Bytes {
        let start = HEADER_SIZE.min(self.data.len());
        Bytes::copy_from_slice(&self.data[start..])
    }

    /// Snapshot of the whole buffer, ready to be written to a socket.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }
}

/// Read one length-prefixed frame into `buf` and return its payload length.
///
/// A clean EOF before the first byte of the length is reported as
/// [`FrameError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R, buf: &mut ProtocolBuffer) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    buf.resize_to_header();
    match reader.read_exact(buf.header_mut()).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }
    let len = buf.parse_length()?;
    buf.resize(len)?;
    reader.read_exact(buf.payload_mut()).await?;
    Ok(len)
}

/// Read one frame and decode it as `M`.
pub async fn read_message<M, R>(reader: &mut R, buf: &mut ProtocolBuffer) -> Result<M, FrameError>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let len = read_frame(reader, buf).await?;
    buf.parse(len)
}

/// Write the whole buffer and flush.
pub async fn write_buffer<W>(writer: &mut W, buf: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{EchoRequest, ResponseHeader};

    #[test]
    fn test_resize_to_header() {
        let mut buf = ProtocolBuffer::new(16);
        buf.serialize(&ResponseHeader { id: "abc".into() }).unwrap();
        buf.resize_to_header();
        assert_eq!(buf.size(), HEADER_SIZE);
        assert_eq!(buf.parse_length().unwrap(), 0);
    }

    #[test]
    fn test_resize_keeps_header() {
        let mut buf = ProtocolBuffer::new(16);
        buf.resize_to_header();
        buf.header_mut().copy_from_slice(&7u32.to_be_bytes());
        buf.resize(7).unwrap();
        assert_eq!(buf.size(), HEADER_SIZE + 7);
        assert_eq!(buf.parse_length().unwrap(), 7);
    }

    #[test]
    fn test_serialize_layout() {
        let msg = EchoRequest {
            data: "hello".into(),
            delay: 0,
        };
        let mut buf = ProtocolBuffer::new(0);
        buf.serialize(&msg).unwrap();

        let len = msg.encoded_len();
        assert_eq!(buf.size(), HEADER_SIZE + len);
        assert_eq!(&buf.data()[..4], &(len as u32).to_be_bytes());
        assert_eq!(buf.parse_length().unwrap(), len);
        assert_eq!(buf.parse::<EchoRequest>(len).unwrap(), msg);
    }

    #[test]
    fn test_parse_length_needs_header() {
        let buf = ProtocolBuffer::new(0);
        assert!(matches!(
            buf.parse_length(),
            Err(FrameError::Truncated { required: 4, available: 0 })
        ));
    }

    #[test]
    fn test_parse_truncated_payload() {
        let mut buf = ProtocolBuffer::new(0);
        buf.resize_to_header();
        assert!(matches!(
            buf.parse::<EchoRequest>(10),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = ProtocolBuffer::new(0);
        buf.resize_to_header();
        buf.header_mut()
            .copy_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        assert!(matches!(buf.parse_length(), Err(FrameError::FrameTooLarge(_))));
        assert!(buf.resize(MAX_FRAME_SIZE + 1).is_err());
    }

    #[tokio::test]
    async fn test_read_message_from_stream() {
        let msg = ResponseHeader { id: "r-1".into() };
        let mut out = ProtocolBuffer::new(0);
        out.serialize(&msg).unwrap();
        out.serialize(&EchoRequest {
            data: "x".into(),
            delay: 5,
        })
        .unwrap();

        let bytes = out.to_bytes();
        let mut reader: &[u8] = &bytes;
        let mut buf = ProtocolBuffer::new(0);
        let header: ResponseHeader = read_message(&mut reader, &mut buf).await.unwrap();
        assert_eq!(header, msg);
        let body: EchoRequest = read_message(&mut reader, &mut buf).await.unwrap();
        assert_eq!(body.delay, 5);

        let eof = read_message::<ResponseHeader, _>(&mut reader, &mut buf).await;
        assert!(matches!(eof, Err(FrameError::ConnectionClosed)));
    }
}
