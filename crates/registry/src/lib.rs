//! The rendezvous registry.
//!
//! The registry is a distinguished participant with the fixed id 0. It
//! answers announcements with the roster of everyone already present,
//! forwards later announcements to the existing roster, and otherwise
//! carries no traffic: all payload messages flow over direct peer links.

use bytes::Bytes;
use silbus_connection::framing::{read_frame, write_frame};
use silbus_messages::{
    KnownParticipants, ParticipantAnnouncement, ParticipantAnnouncementReply, ParticipantInfo,
    RegistryMsgHeader, ReplyStatus,
};
use silbus_types::{Uri, CURRENT_PROTOCOL_VERSION, REGISTRY_PARTICIPANT_ID};
use silbus_wire::{encode_frame, split_frame, Decode, Encode, MsgKind, Reader};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// The registry's own participant name.
pub const REGISTRY_PARTICIPANT_NAME: &str = "SilKitRegistry";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid registry uri: {0}")]
    Uri(#[from] silbus_types::UriError),

    #[error("registry uri must use the silkit:// scheme, got {0}")]
    NotASilKitUri(String),
}

struct ConnectedParticipant {
    name: String,
    info: ParticipantInfo,
    outbound: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct RegistryState {
    /// Connection id → announced participant.
    participants: HashMap<u64, ConnectedParticipant>,
}

impl RegistryState {
    fn roster_excluding(&self, conn_id: u64) -> KnownParticipants {
        KnownParticipants {
            header: RegistryMsgHeader::current(),
            participants: self
                .participants
                .iter()
                .filter(|(id, _)| **id != conn_id)
                .map(|(_, p)| p.info.clone())
                .collect(),
        }
    }
}

/// A running registry. Dropping it stops the listener and disconnects
/// every participant link.
pub struct Registry {
    uri: String,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Registry {
    /// Bind the listener and start serving. `silkit://host:0` picks an
    /// ephemeral port; the effective URI is available via [`Registry::uri`].
    pub fn start(listen_uri: &str) -> Result<Self, RegistryError> {
        let uri = Uri::parse(listen_uri)?;
        let Uri::SilKit { host, port } = uri else {
            return Err(RegistryError::NotASilKitUri(listen_uri.to_string()));
        };

        let listener = std::net::TcpListener::bind((host.as_str(), port))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let effective_uri = Uri::silkit(local.ip().to_string(), local.port()).to_string();
        info!(uri = %effective_uri, "registry listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name("silbus-registry".to_string())
            .spawn(move || registry_thread(listener, shutdown_rx))?;

        Ok(Self {
            uri: effective_uri,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// The URI participants should join, with the bound port filled in.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Stop listening and drop every link. Idempotent.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.stop();
    }
}

fn registry_thread(listener: std::net::TcpListener, shutdown: oneshot::Receiver<()>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            warn!(error = %e, "could not build registry runtime");
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        let Ok(listener) = TcpListener::from_std(listener) else {
            return;
        };
        let state = Rc::new(RefCell::new(RegistryState::default()));
        let mut next_conn_id: u64 = 1;

        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let Ok((stream, addr)) = accepted else { break };
                    stream.set_nodelay(true).ok();
                    let conn_id = next_conn_id;
                    next_conn_id += 1;
                    debug!(conn_id, %addr, "participant connected");
                    tokio::task::spawn_local(serve_participant(
                        conn_id,
                        stream,
                        Rc::clone(&state),
                    ));
                }
            }
        }
        info!("registry stopped");
    });
}

async fn serve_participant(
    conn_id: u64,
    stream: tokio::net::TcpStream,
    state: Rc<RefCell<RegistryState>>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();

    let writer = tokio::task::spawn_local(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if write_frame(&mut write_half, &frame).await.is_err() {
                return;
            }
        }
    });

    while let Ok(Some(body)) = read_frame(&mut read_half).await {
        let Ok((kind, payload)) = split_frame(&body) else {
            warn!(conn_id, "malformed frame, dropping participant");
            break;
        };
        match kind {
            MsgKind::ParticipantAnnouncement => {
                let Ok(announcement) = ParticipantAnnouncement::decode(&mut Reader::new(payload))
                else {
                    warn!(conn_id, "malformed announcement, dropping participant");
                    break;
                };
                if !handle_announcement(conn_id, announcement, &outbound_tx, &state) {
                    break;
                }
            }
            other => {
                // The registry never mediates payload traffic.
                debug!(conn_id, kind = ?other, "ignoring non-handshake frame");
            }
        }
    }

    // Participant gone: drop it from the roster. Direct peers notice
    // through their own links.
    if let Some(p) = state.borrow_mut().participants.remove(&conn_id) {
        info!(participant = %p.name, "participant left the registry");
    }
    writer.abort();
}

/// Answer an announcement: reply, roster, forward. Returns `false` when
/// the link must close (incompatible version).
fn handle_announcement(
    conn_id: u64,
    announcement: ParticipantAnnouncement,
    outbound: &mpsc::UnboundedSender<Bytes>,
    state: &Rc<RefCell<RegistryState>>,
) -> bool {
    let remote_version = announcement.header.version;
    if !CURRENT_PROTOCOL_VERSION.is_compatible_with(remote_version) {
        warn!(
            participant = %announcement.participant_name,
            version = %remote_version,
            "incompatible participant version"
        );
        let reply = ParticipantAnnouncementReply::failure(format!(
            "registry speaks {CURRENT_PROTOCOL_VERSION}, participant announced {remote_version}"
        ));
        let _ = outbound.send(encode_frame(
            MsgKind::ParticipantAnnouncementReply,
            &reply.to_bytes(),
        ));
        return false;
    }

    info!(
        participant = %announcement.participant_name,
        id = %announcement.participant_id,
        "participant announced"
    );

    let _ = outbound.send(encode_frame(
        MsgKind::ParticipantAnnouncementReply,
        &ParticipantAnnouncementReply::success().to_bytes(),
    ));

    let mut state = state.borrow_mut();

    // Roster of everyone already here, then register the newcomer.
    let roster = state.roster_excluding(conn_id);
    let _ = outbound.send(encode_frame(MsgKind::KnownParticipants, &roster.to_bytes()));

    // Forward the announcement to the existing roster; the newcomer dials
    // them directly, this only primes their lookup tables.
    let forward = encode_frame(MsgKind::RegistryMessage, &announcement.to_bytes());
    for participant in state.participants.values() {
        let _ = participant.outbound.send(forward.clone());
    }

    state.participants.insert(
        conn_id,
        ConnectedParticipant {
            name: announcement.participant_name.clone(),
            info: ParticipantInfo {
                participant_name: announcement.participant_name,
                participant_id: announcement.participant_id,
                acceptor_uris: announcement.acceptor_uris,
            },
            outbound: outbound.clone(),
        },
    );
    true
}

/// The registry's own identity, as seen in diagnostics.
pub fn registry_identity() -> ParticipantInfo {
    ParticipantInfo {
        participant_name: REGISTRY_PARTICIPANT_NAME.to_string(),
        participant_id: REGISTRY_PARTICIPANT_ID,
        acceptor_uris: Vec::new(),
    }
}
