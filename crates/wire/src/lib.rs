//! Wire codec and framing for the silbus protocol.
//!
//! This crate contains the transport-independent byte layer:
//!
//! - [`codec`]: little-endian primitive encoding, length-prefixed strings
//!   and arrays, the [`Encode`]/[`Decode`] traits
//! - [`frame`]: the `[u32 len][u8 kind][payload]` frame format
//! - [`kind`]: the message-kind discriminator
//!
//! No async runtime dependency. The connection crate drives the actual
//! socket I/O and hands complete frames to and from this layer.

pub mod codec;
pub mod frame;
pub mod kind;

pub use codec::{
    decode_string_map, decode_vec, encode_string_map, encode_vec, Decode, Encode, Reader, Writer,
};
pub use frame::{encode_frame, split_frame, MAX_FRAME_SIZE};
pub use kind::MsgKind;

use thiserror::Error;

/// Errors from wire encoding/decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of payload: needed {needed} more bytes, {available} available")]
    UnexpectedEof { needed: usize, available: usize },

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("frame too short")]
    FrameTooShort,

    #[error("unknown message kind: {0}")]
    UnknownMsgKind(u8),

    #[error("invalid value {value} for field {field}")]
    InvalidValue { field: &'static str, value: u64 },
}
