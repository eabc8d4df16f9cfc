//! Internal request/reply round-trips.
//!
//! Used as a cluster-wide barrier: a call fans out to every connected peer
//! and the caller waits for the expected set to drain.

use crate::{get_uuid, put_uuid, TypedMessage};
use silbus_wire::{Decode, Encode, Reader, WireError, Writer};
use uuid::Uuid;

/// Which procedure a request/reply call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionType {
    /// Barrier: every participant answers as soon as it sees the call.
    ParticipantReplies,
    /// Not understood by this build; answered with `UnknownFunctionType`.
    Unknown(u8),
}

impl FunctionType {
    fn to_u8(self) -> u8 {
        match self {
            FunctionType::ParticipantReplies => 1,
            FunctionType::Unknown(raw) => raw,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FunctionType::ParticipantReplies,
            other => FunctionType::Unknown(other),
        }
    }
}

/// Outcome of a single peer's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestReplyStatus {
    Success,
    UnknownFunctionType,
    ProcedureError,
}

impl RequestReplyStatus {
    fn to_u8(self) -> u8 {
        match self {
            RequestReplyStatus::Success => 0,
            RequestReplyStatus::UnknownFunctionType => 1,
            RequestReplyStatus::ProcedureError => 2,
        }
    }

    fn from_u8(raw: u8) -> Result<Self, WireError> {
        match raw {
            0 => Ok(RequestReplyStatus::Success),
            1 => Ok(RequestReplyStatus::UnknownFunctionType),
            2 => Ok(RequestReplyStatus::ProcedureError),
            other => Err(WireError::InvalidValue {
                field: "request_reply.status",
                value: u64::from(other),
            }),
        }
    }
}

/// Multicast to every connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReplyCall {
    pub call_uuid: Uuid,
    pub function_type: FunctionType,
    pub data: Vec<u8>,
}

impl Encode for RequestReplyCall {
    fn encode(&self, w: &mut Writer) {
        put_uuid(w, self.call_uuid);
        w.put_u8(self.function_type.to_u8());
        w.put_bytes(&self.data);
    }
}

impl Decode for RequestReplyCall {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            call_uuid: get_uuid(r)?,
            function_type: FunctionType::from_u8(r.u8()?),
            data: r.bytes()?,
        })
    }
}

impl TypedMessage for RequestReplyCall {
    fn type_name() -> &'static str {
        "RequestReplyCall"
    }
}

/// A peer's answer, targeted back at the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReplyCallReturn {
    pub call_uuid: Uuid,
    pub function_type: FunctionType,
    pub status: RequestReplyStatus,
    pub data: Vec<u8>,
}

impl Encode for RequestReplyCallReturn {
    fn encode(&self, w: &mut Writer) {
        put_uuid(w, self.call_uuid);
        w.put_u8(self.function_type.to_u8());
        w.put_u8(self.status.to_u8());
        w.put_bytes(&self.data);
    }
}

impl Decode for RequestReplyCallReturn {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            call_uuid: get_uuid(r)?,
            function_type: FunctionType::from_u8(r.u8()?),
            status: RequestReplyStatus::from_u8(r.u8()?)?,
            data: r.bytes()?,
        })
    }
}

impl TypedMessage for RequestReplyCallReturn {
    fn type_name() -> &'static str {
        "RequestReplyCallReturn"
    }
}
