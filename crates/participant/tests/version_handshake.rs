//! Protocol-version negotiation: a peer announcing an incompatible
//! version is answered with a failure reply and the link closes, while
//! the participant keeps serving everyone else.

use silbus_connection::{Connection, ConnectionConfig};
use silbus_messages::{
    ParticipantAnnouncement, ParticipantAnnouncementReply, RegistryMsgHeader, ReplyStatus,
};
use silbus_registry::Registry;
use silbus_types::{hash_participant_name, ProtocolVersion, Uri};
use silbus_wire::{encode_frame, split_frame, Decode, Encode, MsgKind, Reader};
use std::io::{Read, Write};
use std::time::Duration;

fn tcp_endpoint(connection: &Connection) -> (String, u16) {
    connection
        .acceptor_uris()
        .iter()
        .find_map(|raw| match Uri::parse(raw) {
            Ok(Uri::Tcp { host, port }) => Some((host, port)),
            _ => None,
        })
        .expect("a tcp acceptor is advertised")
}

fn read_frame_body(stream: &mut std::net::TcpStream) -> Vec<u8> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).expect("frame length");
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).expect("frame body");
    body
}

#[test]
fn incompatible_peer_is_rejected_and_the_participant_keeps_working() {
    let registry = Registry::start("silkit://127.0.0.1:0").expect("registry");

    let participant = Connection::new("Local", ConnectionConfig::default()).expect("bind");
    participant.join_registry(registry.uri()).expect("join");

    // A peer from the future dials us directly and announces 9.0.0.
    let (host, port) = tcp_endpoint(&participant);
    let mut stream =
        std::net::TcpStream::connect((host.as_str(), port)).expect("dial the acceptor");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("timeout");

    let announcement = ParticipantAnnouncement {
        header: RegistryMsgHeader {
            version: ProtocolVersion::new(9, 0, 0),
            reserved: 0,
        },
        participant_name: "Futureware".to_string(),
        participant_id: hash_participant_name("Futureware"),
        acceptor_uris: vec![],
    };
    stream
        .write_all(&encode_frame(
            MsgKind::ParticipantAnnouncement,
            &announcement.to_bytes(),
        ))
        .expect("send announcement");

    let body = read_frame_body(&mut stream);
    let (kind, payload) = split_frame(&body).expect("reply frame");
    assert_eq!(kind, MsgKind::ParticipantAnnouncementReply);
    let reply =
        ParticipantAnnouncementReply::decode(&mut Reader::new(payload)).expect("reply payload");
    assert_eq!(reply.status, ReplyStatus::Failed);
    assert!(
        reply.diagnostic.contains("9.0.0"),
        "diagnostic names the offending version: {}",
        reply.diagnostic
    );

    // The rejecting side closes the link.
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).unwrap_or(0), 0, "link closed");

    // Other peers are unaffected: a compatible participant joins and the
    // barrier drains across it.
    let other = Connection::new("Other", ConnectionConfig::default()).expect("bind");
    other.join_registry(registry.uri()).expect("join");
    std::thread::sleep(Duration::from_millis(300));
    participant
        .await_participant_replies()
        .expect("barrier across the healthy peer");
}
