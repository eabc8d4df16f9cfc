//! Handshake and registry payloads.
//!
//! These ride in their own frame kinds and are decoded by the connection
//! before any subscription table exists.

use silbus_types::{ParticipantId, ProtocolVersion, CURRENT_PROTOCOL_VERSION};
use silbus_wire::{decode_vec, encode_vec, Decode, Encode, Reader, WireError, Writer};

/// Version header carried in every announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryMsgHeader {
    pub version: ProtocolVersion,
    pub reserved: u16,
}

impl RegistryMsgHeader {
    pub fn current() -> Self {
        Self {
            version: CURRENT_PROTOCOL_VERSION,
            reserved: 0,
        }
    }
}

impl Encode for RegistryMsgHeader {
    fn encode(&self, w: &mut Writer) {
        self.version.encode(w);
        w.put_u16(self.reserved);
    }
}

impl Decode for RegistryMsgHeader {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            version: ProtocolVersion::decode(r)?,
            reserved: r.u16()?,
        })
    }
}

/// First frame on every link: who is talking and how to reach them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantAnnouncement {
    pub header: RegistryMsgHeader,
    pub participant_name: String,
    pub participant_id: ParticipantId,
    /// Acceptor endpoints this participant listens on, most preferred first.
    pub acceptor_uris: Vec<String>,
}

impl Encode for ParticipantAnnouncement {
    fn encode(&self, w: &mut Writer) {
        self.header.encode(w);
        w.put_string(&self.participant_name);
        w.put_u64(self.participant_id.0);
        encode_vec(&self.acceptor_uris, w);
    }
}

impl Decode for ParticipantAnnouncement {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            header: RegistryMsgHeader::decode(r)?,
            participant_name: r.string()?,
            participant_id: ParticipantId(r.u64()?),
            acceptor_uris: decode_vec(r)?,
        })
    }
}

/// Whether the announced handshake was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Success,
    Failed,
}

impl ReplyStatus {
    fn to_u8(self) -> u8 {
        match self {
            ReplyStatus::Success => 0,
            ReplyStatus::Failed => 1,
        }
    }

    fn from_u8(raw: u8) -> Result<Self, WireError> {
        match raw {
            0 => Ok(ReplyStatus::Success),
            1 => Ok(ReplyStatus::Failed),
            other => Err(WireError::InvalidValue {
                field: "reply.status",
                value: u64::from(other),
            }),
        }
    }
}

/// Answer to a [`ParticipantAnnouncement`].
///
/// A failed reply carries the responder's own version header plus a
/// diagnostic; both ends close the link afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantAnnouncementReply {
    pub header: RegistryMsgHeader,
    pub status: ReplyStatus,
    pub diagnostic: String,
}

impl ParticipantAnnouncementReply {
    pub fn success() -> Self {
        Self {
            header: RegistryMsgHeader::current(),
            status: ReplyStatus::Success,
            diagnostic: String::new(),
        }
    }

    pub fn failure(diagnostic: impl Into<String>) -> Self {
        Self {
            header: RegistryMsgHeader::current(),
            status: ReplyStatus::Failed,
            diagnostic: diagnostic.into(),
        }
    }
}

impl Encode for ParticipantAnnouncementReply {
    fn encode(&self, w: &mut Writer) {
        self.header.encode(w);
        w.put_u8(self.status.to_u8());
        w.put_string(&self.diagnostic);
    }
}

impl Decode for ParticipantAnnouncementReply {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            header: RegistryMsgHeader::decode(r)?,
            status: ReplyStatus::from_u8(r.u8()?)?,
            diagnostic: r.string()?,
        })
    }
}

/// One roster entry in [`KnownParticipants`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub participant_name: String,
    pub participant_id: ParticipantId,
    pub acceptor_uris: Vec<String>,
}

impl Encode for ParticipantInfo {
    fn encode(&self, w: &mut Writer) {
        w.put_string(&self.participant_name);
        w.put_u64(self.participant_id.0);
        encode_vec(&self.acceptor_uris, w);
    }
}

impl Decode for ParticipantInfo {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            participant_name: r.string()?,
            participant_id: ParticipantId(r.u64()?),
            acceptor_uris: decode_vec(r)?,
        })
    }
}

/// The registry's answer to a joining participant: everyone already here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownParticipants {
    pub header: RegistryMsgHeader,
    pub participants: Vec<ParticipantInfo>,
}

impl Encode for KnownParticipants {
    fn encode(&self, w: &mut Writer) {
        self.header.encode(w);
        encode_vec(&self.participants, w);
    }
}

impl Decode for KnownParticipants {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            header: RegistryMsgHeader::decode(r)?,
            participants: decode_vec(r)?,
        })
    }
}

/// One per-message-type subscription announced to a peer.
///
/// The receiver index is assigned by the *subscriber's* local table; the
/// peer stamps it on every matching `SimMessage` so the subscriber can
/// dispatch without a string lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberRecord {
    pub receiver_index: u32,
    pub network_name: String,
    pub type_name: String,
    pub version: u32,
}

impl Encode for SubscriberRecord {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.receiver_index);
        w.put_string(&self.network_name);
        w.put_string(&self.type_name);
        w.put_u32(self.version);
    }
}

impl Decode for SubscriberRecord {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            receiver_index: r.u32()?,
            network_name: r.string()?,
            type_name: r.string()?,
            version: r.u32()?,
        })
    }
}

/// Acknowledgement of a [`SubscriberRecord`], echoed back to the
/// subscriber. Duplicates are legal and dropped by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionAcknowledge {
    pub status: ReplyStatus,
    pub subscriber: SubscriberRecord,
}

impl Encode for SubscriptionAcknowledge {
    fn encode(&self, w: &mut Writer) {
        w.put_u8(self.status.to_u8());
        self.subscriber.encode(w);
    }
}

impl Decode for SubscriptionAcknowledge {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            status: ReplyStatus::from_u8(r.u8()?)?,
            subscriber: SubscriberRecord::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_roundtrip() {
        let announcement = ParticipantAnnouncement {
            header: RegistryMsgHeader::current(),
            participant_name: "EcuSim".to_string(),
            participant_id: ParticipantId(0xFEED),
            acceptor_uris: vec!["tcp://127.0.0.1:40001".to_string()],
        };
        let decoded =
            ParticipantAnnouncement::from_bytes(&announcement.to_bytes()).unwrap();
        assert_eq!(decoded, announcement);
    }

    #[test]
    fn test_failed_reply_carries_diagnostic() {
        let reply = ParticipantAnnouncementReply::failure("protocol version 9.0 not supported");
        let decoded = ParticipantAnnouncementReply::from_bytes(&reply.to_bytes()).unwrap();
        assert_eq!(decoded.status, ReplyStatus::Failed);
        assert_eq!(decoded.diagnostic, "protocol version 9.0 not supported");
    }

    #[test]
    fn test_known_participants_roundtrip() {
        let known = KnownParticipants {
            header: RegistryMsgHeader::current(),
            participants: vec![
                ParticipantInfo {
                    participant_name: "A".to_string(),
                    participant_id: ParticipantId(1),
                    acceptor_uris: vec!["tcp://10.0.0.1:4000".to_string()],
                },
                ParticipantInfo {
                    participant_name: "B".to_string(),
                    participant_id: ParticipantId(2),
                    acceptor_uris: vec![],
                },
            ],
        };
        let decoded = KnownParticipants::from_bytes(&known.to_bytes()).unwrap();
        assert_eq!(decoded, known);
    }

    #[test]
    fn test_older_reader_tolerates_grown_announcement() {
        // A future minor version may append fields; a 1.x reader must
        // decode the known prefix and ignore the rest.
        let announcement = ParticipantAnnouncement {
            header: RegistryMsgHeader::current(),
            participant_name: "P".to_string(),
            participant_id: ParticipantId(3),
            acceptor_uris: vec![],
        };
        let mut w = silbus_wire::Writer::new();
        announcement.encode(&mut w);
        w.put_string("future-field");
        let grown = w.freeze();

        let decoded = ParticipantAnnouncement::from_bytes(&grown).unwrap();
        assert_eq!(decoded, announcement);
    }
}
