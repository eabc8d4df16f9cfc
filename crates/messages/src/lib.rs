//! Typed protocol messages for the silbus middleware.
//!
//! Two families live here:
//!
//! - **Handshake payloads** ([`handshake`]): announcements, the known
//!   participants roster, and subscription records. These are decoded by the
//!   connection itself, keyed on the frame's message kind.
//! - **Typed messages** ([`TypedMessage`] implementors): everything routed
//!   through the subscription table by `(network, type name, version)` and
//!   dispatched via receiver index.

pub mod discovery;
pub mod handshake;
pub mod orchestration;
pub mod pubsub;
pub mod requests;
pub mod rpc;

pub use discovery::{ParticipantDiscoveryEvent, ServiceDiscoveryEvent, ServiceDiscoveryEventType};
pub use handshake::{
    KnownParticipants, ParticipantAnnouncement, ParticipantAnnouncementReply, ParticipantInfo,
    RegistryMsgHeader, ReplyStatus, SubscriberRecord, SubscriptionAcknowledge,
};
pub use orchestration::{
    NextSimTask, ParticipantStatus, SystemCommand, SystemCommandKind, WorkflowConfiguration,
};
pub use pubsub::DataMessageEvent;
pub use requests::{
    FunctionType, RequestReplyCall, RequestReplyCallReturn, RequestReplyStatus,
};
pub use rpc::{FunctionCall, FunctionCallResponse, RpcCallStatus};

use silbus_wire::{Decode, Encode};

/// A message routed through the per-type subscription table.
///
/// The `(type_name, version)` pair is part of the subscription key; the
/// name must be stable ASCII and never reused across incompatible layouts.
pub trait TypedMessage: Encode + Decode + Clone + Send + std::fmt::Debug + 'static {
    /// Stable wire identifier for this message type.
    fn type_name() -> &'static str;

    /// Wire version of this message type.
    ///
    /// Versions may grow trailing fields; readers tolerate trailing unknown
    /// bytes, so a bump is only needed for incompatible layout changes.
    fn version() -> u32 {
        1
    }
}

/// Encode a UUID as its 16 raw bytes.
pub(crate) fn put_uuid(w: &mut silbus_wire::Writer, uuid: uuid::Uuid) {
    w.put_raw(uuid.as_bytes());
}

/// Decode a UUID from its 16 raw bytes.
pub(crate) fn get_uuid(
    r: &mut silbus_wire::Reader<'_>,
) -> Result<uuid::Uuid, silbus_wire::WireError> {
    let mut raw = [0u8; 16];
    for byte in raw.iter_mut() {
        *byte = r.u8()?;
    }
    Ok(uuid::Uuid::from_bytes(raw))
}
