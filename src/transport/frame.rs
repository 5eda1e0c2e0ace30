//! Frame reading/writing shared by the control and filesystem channels.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Frame format: len:u32 | type:u8 | payload

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use crate::config::DEFAULT_MAX_FRAME_SIZE as MAX_FRAME_SIZE;

/// Frame header: len:u32 + type:u8
pub const FRAME_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    // Control channel
    Header = 0x01,
    Control = 0x02,

    // Filesystem channel (fallback tree stream)
    Entry = 0x10,
    Data = 0x11,
    DataEnd = 0x12,
    Mkdir = 0x13,
    Symlink = 0x14,
    TreeEnd = 0x15,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Header),
            0x02 => Some(Self::Control),
            0x10 => Some(Self::Entry),
            0x11 => Some(Self::Data),
            0x12 => Some(Self::DataEnd),
            0x13 => Some(Self::Mkdir),
            0x14 => Some(Self::Symlink),
            0x15 => Some(Self::TreeEnd),
            _ => None,
        }
    }
}

/// A message that travels as exactly one frame.
pub trait WireMessage: Sized {
    const TYPE: MessageType;

    /// Encode as a complete frame, header included.
    fn encode(&self) -> Bytes;

    /// Decode from a frame payload (header stripped).
    fn decode(payload: Bytes) -> Result<Self>;
}

/// Build a frame around an already-encoded payload.
pub fn encode_frame(msg_type: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg_type as u8);
    buf.put_slice(payload);
    buf.freeze()
}

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    max_frame_size: u32,
) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    // Validate frame size before allocation
    if len > max_frame_size {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            max_frame_size
        );
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type)
        .with_context(|| format!("Unknown message type 0x{:02x}", msg_type))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    w.flush().await.context("Failed to flush frame")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_from_u8() {
        assert_eq!(MessageType::from_u8(0x01), Some(MessageType::Header));
        assert_eq!(MessageType::from_u8(0x11), Some(MessageType::Data));
        assert_eq!(MessageType::from_u8(0x15), Some(MessageType::TreeEnd));
        assert_eq!(MessageType::from_u8(0xFF), None);
    }

    #[tokio::test]
    async fn test_frame_through_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = encode_frame(MessageType::Control, b"payload");
        write_frame(&mut a, &frame).await.unwrap();

        let (msg_type, payload) = read_frame(&mut b, MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(msg_type, MessageType::Control);
        assert_eq!(payload.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = encode_frame(MessageType::Data, &[0u8; 64]);
        write_frame(&mut a, &frame).await.unwrap();

        let err = read_frame(&mut b, 16).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Bytes::from_static(&[0, 0, 0, 0, 0x7F]);
        write_frame(&mut a, &frame).await.unwrap();

        let err = read_frame(&mut b, MAX_FRAME_SIZE).await.unwrap_err();
        assert!(err.to_string().contains("Unknown message type"));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Bytes::from_static(&[0, 0, 0, 8, 0x02, 1, 2]);
        write_frame(&mut a, &frame).await.unwrap();
        drop(a);

        assert!(read_frame(&mut b, MAX_FRAME_SIZE).await.is_err());
    }
}
