//! Async frame I/O.
//!
//! Shared by the peer reader tasks and the registry so the wire format
//! cannot drift between the two sides. A frame on the socket is
//! `[u32 len le][u8 kind][payload]`; this module moves whole frame bodies
//! (kind byte included), leaving the split to `silbus_wire::split_frame`.

use bytes::Bytes;
use silbus_wire::MAX_FRAME_SIZE;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one frame body (everything after the length prefix).
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Option<Bytes>> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} out of bounds"),
        ));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}

/// Write a complete, pre-encoded frame (length prefix included) and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, frame: &[u8]) -> io::Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use silbus_wire::{encode_frame, split_frame, MsgKind};

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = encode_frame(MsgKind::SimMessage, b"hello");
        write_frame(&mut a, &frame).await.unwrap();

        let body = read_frame(&mut b).await.unwrap().unwrap();
        let (kind, payload) = split_frame(&body).unwrap();
        assert_eq!(kind, MsgKind::SimMessage);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mid_frame_eof_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Length prefix promising 100 bytes, then hang up.
        a.write_all(&100u32.to_le_bytes()).await.unwrap();
        a.write_all(b"short").await.unwrap();
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_le_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
