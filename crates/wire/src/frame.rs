//! Frame layout.
//!
//! ```text
//! [u32 payload_len le][u8 msg_kind][payload ...]
//! ```
//!
//! `payload_len` counts the kind byte plus the payload, so a receiver reads
//! the 4-byte prefix, then exactly `payload_len` bytes, and hands the body
//! to [`split_frame`].

use crate::{MsgKind, WireError};
use bytes::{BufMut, Bytes, BytesMut};

/// Upper bound on a frame body. Anything larger is a protocol error and
/// closes the link.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Assemble a complete frame ready for the socket.
pub fn encode_frame(kind: MsgKind, payload: &[u8]) -> Bytes {
    let body_len = payload.len() + 1;
    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32_le(body_len as u32);
    buf.put_u8(kind as u8);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a frame body (everything after the length prefix) into kind and
/// payload.
pub fn split_frame(body: &[u8]) -> Result<(MsgKind, &[u8]), WireError> {
    if body.is_empty() {
        return Err(WireError::FrameTooShort);
    }
    let kind = MsgKind::from_u8(body[0])?;
    Ok((kind, &body[1..]))
}
