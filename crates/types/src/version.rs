//! Wire protocol version.

use silbus_wire::{Decode, Encode, Reader, WireError, Writer};
use std::fmt;

/// The protocol version spoken on a peer link.
///
/// Negotiated once during the announcement handshake and fixed for the
/// lifetime of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

/// The version this build announces.
pub const CURRENT_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 1,
    minor: 1,
    patch: 0,
};

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether a peer announcing `other` can join this side's link.
    ///
    /// Patch levels never break compatibility; 1.0 peers are accepted by
    /// 1.1 builds (the 1.1 additions are trailing-tolerant payload growth).
    pub fn is_compatible_with(&self, other: ProtocolVersion) -> bool {
        self.major == other.major && other.minor <= self.minor
    }
}

impl Encode for ProtocolVersion {
    fn encode(&self, w: &mut Writer) {
        w.put_u16(self.major);
        w.put_u16(self.minor);
        w.put_u16(self.patch);
    }
}

impl Decode for ProtocolVersion {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            major: r.u16()?,
            minor: r.u16()?,
            patch: r.u16()?,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
