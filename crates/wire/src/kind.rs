//! The message-kind discriminator carried after the frame length.

use crate::WireError;

/// What the frame payload contains.
///
/// Kinds 1-6 are handshake/bookkeeping traffic decoded by the connection
/// itself; [`MsgKind::SimMessage`] carries a receiver index plus a typed
/// payload dispatched through the subscription table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgKind {
    ParticipantAnnouncement = 1,
    ParticipantAnnouncementReply = 2,
    KnownParticipants = 3,
    SubscriptionAnnouncement = 4,
    SubscriptionAcknowledge = 5,
    /// Registry-forwarded traffic (late-joiner announcements).
    RegistryMessage = 6,
    /// `[u32 receiver_index][type payload]`.
    SimMessage = 7,
}

impl MsgKind {
    pub fn from_u8(raw: u8) -> Result<Self, WireError> {
        match raw {
            1 => Ok(MsgKind::ParticipantAnnouncement),
            2 => Ok(MsgKind::ParticipantAnnouncementReply),
            3 => Ok(MsgKind::KnownParticipants),
            4 => Ok(MsgKind::SubscriptionAnnouncement),
            5 => Ok(MsgKind::SubscriptionAcknowledge),
            6 => Ok(MsgKind::RegistryMessage),
            7 => Ok(MsgKind::SimMessage),
            other => Err(WireError::UnknownMsgKind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for raw in 1..=7u8 {
            assert_eq!(MsgKind::from_u8(raw).unwrap() as u8, raw);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert_eq!(MsgKind::from_u8(0), Err(WireError::UnknownMsgKind(0)));
        assert_eq!(MsgKind::from_u8(99), Err(WireError::UnknownMsgKind(99)));
    }
}
