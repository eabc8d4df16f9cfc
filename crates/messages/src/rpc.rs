//! Remote procedure call messages.

use crate::{get_uuid, put_uuid, TypedMessage};
use silbus_wire::{Decode, Encode, Reader, WireError, Writer};
use std::time::Duration;
use uuid::Uuid;

/// Result code of a call, as seen by the client's result handler.
/// `ServerNotReachable` is produced locally when no matching server is
/// known; the other values travel in a [`FunctionCallResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCallStatus {
    Success,
    ServerInternalError,
    ServerNotReachable,
}

impl RpcCallStatus {
    fn to_u8(self) -> u8 {
        match self {
            RpcCallStatus::Success => 0,
            RpcCallStatus::ServerInternalError => 1,
            RpcCallStatus::ServerNotReachable => 2,
        }
    }

    fn from_u8(raw: u8) -> Result<Self, WireError> {
        match raw {
            0 => Ok(RpcCallStatus::Success),
            1 => Ok(RpcCallStatus::ServerInternalError),
            2 => Ok(RpcCallStatus::ServerNotReachable),
            other => Err(WireError::InvalidValue {
                field: "rpc.status",
                value: u64::from(other),
            }),
        }
    }
}

/// A call from client to server, routed over the client's private network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub timestamp: Duration,
    pub call_uuid: Uuid,
    pub data: Vec<u8>,
}

impl Encode for FunctionCall {
    fn encode(&self, w: &mut Writer) {
        w.put_duration(self.timestamp);
        put_uuid(w, self.call_uuid);
        w.put_bytes(&self.data);
    }
}

impl Decode for FunctionCall {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            timestamp: r.duration()?,
            call_uuid: get_uuid(r)?,
            data: r.bytes()?,
        })
    }
}

impl TypedMessage for FunctionCall {
    fn type_name() -> &'static str {
        "FunctionCall"
    }
}

/// The server's answer, targeted back at the calling participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCallResponse {
    pub timestamp: Duration,
    pub call_uuid: Uuid,
    pub status: RpcCallStatus,
    pub data: Vec<u8>,
}

impl Encode for FunctionCallResponse {
    fn encode(&self, w: &mut Writer) {
        w.put_duration(self.timestamp);
        put_uuid(w, self.call_uuid);
        w.put_u8(self.status.to_u8());
        w.put_bytes(&self.data);
    }
}

impl Decode for FunctionCallResponse {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            timestamp: r.duration()?,
            call_uuid: get_uuid(r)?,
            status: RpcCallStatus::from_u8(r.u8()?)?,
            data: r.bytes()?,
        })
    }
}

impl TypedMessage for FunctionCallResponse {
    fn type_name() -> &'static str {
        "FunctionCallResponse"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_roundtrip_preserves_uuid() {
        let call = FunctionCall {
            timestamp: Duration::from_millis(3),
            call_uuid: Uuid::new_v4(),
            data: vec![1, 2, 3],
        };
        let decoded = FunctionCall::from_bytes(&call.to_bytes()).unwrap();
        assert_eq!(decoded, call);
    }
}
