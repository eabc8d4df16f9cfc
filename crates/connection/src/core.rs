//! The connection protocol state machine.
//!
//! `ConnectionCore` owns every table: peers and their handshake state, the
//! per-`(network, type)` links, the receiver-index dispatch vector, pending
//! subscription acknowledgements, and the request/reply barrier. It is
//! sans-IO: events go in through [`ConnectionCore::handle_internal`] or as
//! posted commands, and [`Action`]s come out for the driver to execute
//! against real sockets. That keeps the whole protocol testable without a
//! single socket.
//!
//! Everything here runs on the connection's I/O thread. Handlers
//! registered through [`ConnectionCore::subscribe`] are invoked inline on
//! that thread and must not block.

use crate::request_reply::{CallCompletion, RequestReplyCalls};
use crate::ConnectionError;
use bytes::Bytes;
use silbus_messages::{
    FunctionType, KnownParticipants, ParticipantAnnouncement, ParticipantAnnouncementReply,
    RegistryMsgHeader, ReplyStatus, RequestReplyCall, RequestReplyCallReturn, RequestReplyStatus,
    SubscriberRecord, SubscriptionAcknowledge, TypedMessage,
};
use silbus_types::{ParticipantId, Uri, CURRENT_PROTOCOL_VERSION};
use silbus_wire::{encode_frame, split_frame, Decode, Encode, MsgKind, Reader, WireError, Writer};
use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Network name reserved for internal middleware services.
pub const INTERNAL_NETWORK: &str = "internal";

/// Driver-local handle to a peer link. Only ever compared and hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerRef(pub u64);

/// Identity of a connected peer, as learned from its announcement or the
/// registry roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub participant_name: String,
    pub participant_id: ParticipantId,
    pub acceptor_uris: Vec<String>,
}

/// Typed handler invoked on the I/O thread for each received message.
/// The first argument is the sending participant's name.
pub type MessageHandler<M> = Box<dyn Fn(&str, &M) + Send>;

/// Callback fired when a peer link dies, exactly once per peer.
pub type PeerShutdownCallback = Box<dyn Fn(&PeerInfo) + Send>;

/// Callback fired when a peer announces a subscription. Used by service
/// discovery to dump its table once the new peer can actually receive it.
pub type RemoteSubscriptionCallback = Box<dyn Fn(&PeerInfo, &SubscriberRecord) + Send>;

/// What the driver must do after an event was processed.
#[derive(Debug)]
pub enum Action {
    /// Queue a frame on the peer's outbound channel, awaiting when full.
    SendFrame { peer: PeerRef, frame: Bytes },
    /// Dial the peer's endpoints, most preferred first.
    Dial { peer: PeerRef, uris: Vec<Uri> },
    /// Tear down the peer's transport tasks.
    ClosePeer { peer: PeerRef },
    /// Stop the executor loop. Emitted once, by shutdown.
    Stop,
}

/// Events posted onto the executor.
pub enum CoreEvent {
    /// A closure from a public entry point, run on the I/O thread.
    Command(Box<dyn FnOnce(&mut ConnectionCore) -> Vec<Action> + Send>),
    /// Transport-level happenings from peer/dial tasks.
    Internal(InternalEvent),
}

/// Transport events produced by the driver's tasks.
#[derive(Debug)]
pub enum InternalEvent {
    DialSucceeded { peer: PeerRef },
    DialFailed { peer: PeerRef, error: String },
    FrameReceived { peer: PeerRef, body: Bytes },
    PeerClosed { peer: PeerRef, error: Option<String> },
}

// ─── Receivers ───

/// Subscription-table entry behind a receiver index.
trait RawReceiver {
    fn receive_bytes(&self, sender: &str, payload: &[u8]) -> Result<(), WireError>;
    fn as_any(&self) -> &dyn Any;
}

struct TypedReceiver<M: TypedMessage> {
    handlers: RefCell<Vec<MessageHandler<M>>>,
}

impl<M: TypedMessage> TypedReceiver<M> {
    /// Faults inside user handlers must not escape onto the executor; a
    /// panicking handler is logged and the remaining handlers still run.
    fn dispatch(&self, sender: &str, msg: &M) {
        for handler in self.handlers.borrow().iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(sender, msg)
            }));
            if result.is_err() {
                warn!(
                    type_name = M::type_name(),
                    sender, "message handler panicked"
                );
            }
        }
    }
}

impl<M: TypedMessage> RawReceiver for TypedReceiver<M> {
    fn receive_bytes(&self, sender: &str, payload: &[u8]) -> Result<(), WireError> {
        let msg = M::decode(&mut Reader::new(payload))?;
        self.dispatch(sender, &msg);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The two request/reply receivers are built into the core itself; their
/// payloads mutate the pending-call table instead of reaching user code.
enum ReceiverKind {
    Typed(Rc<dyn RawReceiver>),
    RequestReplyCall,
    RequestReplyCallReturn,
}

struct ReceiverSlot {
    record: SubscriberRecord,
    kind: ReceiverKind,
}

// ─── Links ───

type LinkKey = (String, String); // (network name, message type name)

#[derive(Default)]
struct Link {
    /// Wire version of this key as known locally.
    version: Option<u32>,
    /// Index into the receiver vector, if anyone local listens.
    local_receiver: Option<u32>,
    /// Peers that announced a subscription for this key.
    remote_peers: Vec<PeerRef>,
    /// 0 or 1. With 1, the most recent payload is replayed to late
    /// subscribers.
    history_depth: usize,
    retained: Option<Bytes>,
}

// ─── Peers ───

#[derive(Debug, PartialEq, Eq)]
enum PeerLinkState {
    /// Outbound dial in flight.
    Dialing,
    /// Dialed and announced; waiting for the announcement reply.
    AwaitingReply,
    /// Inbound link; waiting for the peer's announcement.
    AwaitingAnnouncement,
    Active,
}

struct PeerEntry {
    state: PeerLinkState,
    is_registry: bool,
    info: Option<PeerInfo>,
    /// Their receiver index per key, stamped on every outgoing frame.
    remote_subscriptions: HashMap<LinkKey, u32>,
}

impl PeerEntry {
    fn label(&self) -> &str {
        self.info
            .as_ref()
            .map(|i| i.participant_name.as_str())
            .unwrap_or("<unannounced>")
    }
}

// ─── Pending handshakes ───

struct JoinState {
    uri: String,
    notify: Option<oneshot::Sender<Result<(), ConnectionError>>>,
    pending_replies: HashSet<PeerRef>,
    roster_received: bool,
}

struct SyncRegistration {
    remaining: usize,
    notify: Option<oneshot::Sender<()>>,
}

/// The connection state machine. See the module docs for the contract.
pub struct ConnectionCore {
    participant_name: String,
    participant_id: ParticipantId,
    acceptor_uris: Vec<String>,

    peers: HashMap<PeerRef, PeerEntry>,
    peers_by_name: HashMap<String, PeerRef>,
    next_peer_ref: u64,
    registry_peer: Option<PeerRef>,

    receivers: Vec<ReceiverSlot>,
    links: HashMap<LinkKey, Link>,

    join: Option<JoinState>,

    sync_registrations: HashMap<u64, SyncRegistration>,
    next_sync_registration: u64,
    /// (peer, key) → sync registrations waiting for that acknowledge.
    pending_acks: HashMap<(PeerRef, LinkKey), Vec<u64>>,

    request_reply: RequestReplyCalls,

    peer_shutdown_callbacks: Vec<PeerShutdownCallback>,
    remote_subscription_callbacks: Vec<RemoteSubscriptionCallback>,

    /// Names learned from registry forwards, before the direct link exists.
    announced_participants: HashMap<String, ParticipantId>,

    shutting_down: bool,
}

impl ConnectionCore {
    pub fn new(
        participant_name: String,
        participant_id: ParticipantId,
        acceptor_uris: Vec<String>,
    ) -> Self {
        let mut core = Self {
            participant_name,
            participant_id,
            acceptor_uris,
            peers: HashMap::new(),
            peers_by_name: HashMap::new(),
            next_peer_ref: 1,
            registry_peer: None,
            receivers: Vec::new(),
            links: HashMap::new(),
            join: None,
            sync_registrations: HashMap::new(),
            next_sync_registration: 1,
            pending_acks: HashMap::new(),
            request_reply: RequestReplyCalls::new(),
            peer_shutdown_callbacks: Vec::new(),
            remote_subscription_callbacks: Vec::new(),
            announced_participants: HashMap::new(),
            shutting_down: false,
        };

        // The request/reply barrier is part of the connection itself; its
        // receivers are present from the first handshake on.
        core.add_builtin_receiver::<RequestReplyCall>(ReceiverKind::RequestReplyCall);
        core.add_builtin_receiver::<RequestReplyCallReturn>(ReceiverKind::RequestReplyCallReturn);
        core
    }

    fn add_builtin_receiver<M: TypedMessage>(&mut self, kind: ReceiverKind) {
        let record = SubscriberRecord {
            receiver_index: self.receivers.len() as u32,
            network_name: INTERNAL_NETWORK.to_string(),
            type_name: M::type_name().to_string(),
            version: M::version(),
        };
        let key = (record.network_name.clone(), record.type_name.clone());
        let link = self.links.entry(key).or_default();
        link.version = Some(M::version());
        link.local_receiver = Some(record.receiver_index);
        self.receivers.push(ReceiverSlot { record, kind });
    }

    pub fn participant_name(&self) -> &str {
        &self.participant_name
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    /// Number of peers with a completed handshake.
    pub fn active_peer_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == PeerLinkState::Active)
            .count()
    }

    /// Participants known from registry forwards but not yet linked.
    pub fn announced_participant_count(&self) -> usize {
        self.announced_participants.len()
    }

    // ─── Peer bookkeeping (driver entry points) ───

    /// Register an inbound link accepted by one of our acceptors.
    pub fn on_peer_accepted(&mut self, endpoint_label: &str) -> PeerRef {
        let peer = self.allocate_peer_ref();
        debug!(?peer, endpoint = endpoint_label, "inbound link accepted");
        self.peers.insert(
            peer,
            PeerEntry {
                state: PeerLinkState::AwaitingAnnouncement,
                is_registry: false,
                info: None,
                remote_subscriptions: HashMap::new(),
            },
        );
        peer
    }

    fn allocate_peer_ref(&mut self) -> PeerRef {
        let peer = PeerRef(self.next_peer_ref);
        self.next_peer_ref += 1;
        peer
    }

    // ─── Commands ───

    /// Join the simulation through the registry at `uri`.
    pub fn join_registry(
        &mut self,
        uri: Uri,
        notify: oneshot::Sender<Result<(), ConnectionError>>,
    ) -> Vec<Action> {
        let peer = self.allocate_peer_ref();
        self.peers.insert(
            peer,
            PeerEntry {
                state: PeerLinkState::Dialing,
                is_registry: true,
                info: None,
                remote_subscriptions: HashMap::new(),
            },
        );
        self.registry_peer = Some(peer);
        self.join = Some(JoinState {
            uri: uri.to_string(),
            notify: Some(notify),
            pending_replies: HashSet::new(),
            roster_received: false,
        });
        info!(registry = %uri, "joining simulation");
        vec![Action::Dial {
            peer,
            uris: vec![uri],
        }]
    }

    /// Register a typed receiver on `network`. Returns the actions plus the
    /// completion a synchronous registration must wait on (`None` when no
    /// acknowledgements are outstanding).
    pub fn subscribe<M: TypedMessage>(
        &mut self,
        network: &str,
        handler: MessageHandler<M>,
        synchronous: bool,
    ) -> (Vec<Action>, Option<oneshot::Receiver<()>>) {
        let key: LinkKey = (network.to_string(), M::type_name().to_string());

        if let Some(existing) = self.links.get(&key).and_then(|l| l.local_receiver) {
            if let ReceiverKind::Typed(receiver) = &self.receivers[existing as usize].kind {
                let typed = receiver
                    .as_any()
                    .downcast_ref::<TypedReceiver<M>>()
                    .expect("receiver slot type mismatch for registered key");
                typed.handlers.borrow_mut().push(handler);
            }
            // No new record, nothing to announce, nothing to wait for.
            return (Vec::new(), None);
        }

        let record = SubscriberRecord {
            receiver_index: self.receivers.len() as u32,
            network_name: network.to_string(),
            type_name: M::type_name().to_string(),
            version: M::version(),
        };
        trace!(
            network,
            type_name = M::type_name(),
            index = record.receiver_index,
            "new local receiver"
        );

        let receiver = Rc::new(TypedReceiver::<M> {
            handlers: RefCell::new(vec![handler]),
        });
        self.receivers.push(ReceiverSlot {
            record: record.clone(),
            kind: ReceiverKind::Typed(receiver),
        });

        let link = self.links.entry(key.clone()).or_default();
        link.version = Some(M::version());
        link.local_receiver = Some(record.receiver_index);

        // Announce to every active peer; a synchronous registration waits
        // for all of them to acknowledge.
        let active_peers: Vec<PeerRef> = self
            .peers
            .iter()
            .filter(|(_, p)| p.state == PeerLinkState::Active)
            .map(|(r, _)| *r)
            .collect();

        let completion = if synchronous && !active_peers.is_empty() {
            let reg_id = self.next_sync_registration;
            self.next_sync_registration += 1;
            let (tx, rx) = oneshot::channel();
            self.sync_registrations.insert(
                reg_id,
                SyncRegistration {
                    remaining: active_peers.len(),
                    notify: Some(tx),
                },
            );
            for peer in &active_peers {
                self.pending_acks
                    .entry((*peer, key.clone()))
                    .or_default()
                    .push(reg_id);
            }
            Some(rx)
        } else {
            None
        };

        let actions = active_peers
            .into_iter()
            .map(|peer| Action::SendFrame {
                peer,
                frame: encode_frame(MsgKind::SubscriptionAnnouncement, &record.to_bytes()),
            })
            .collect();
        (actions, completion)
    }

    /// Bind a sender for `(network, M)` so history configuration and version
    /// checks know the key before the first send.
    pub fn add_sender<M: TypedMessage>(&mut self, network: &str) {
        let key: LinkKey = (network.to_string(), M::type_name().to_string());
        let link = self.links.entry(key).or_default();
        link.version = Some(M::version());
    }

    /// Configure history for `(network, M)`. Depth above 1 is rejected.
    pub fn set_history_depth<M: TypedMessage>(
        &mut self,
        network: &str,
        depth: usize,
    ) -> Result<(), ConnectionError> {
        if depth > 1 {
            return Err(ConnectionError::UnsupportedHistoryDepth(depth));
        }
        let key: LinkKey = (network.to_string(), M::type_name().to_string());
        let link = self.links.entry(key).or_default();
        link.version = Some(M::version());
        link.history_depth = depth;
        Ok(())
    }

    /// Broadcast `msg` to every subscriber of its key, local side first.
    pub fn send_msg<M: TypedMessage>(&mut self, network: &str, msg: &M) -> Vec<Action> {
        self.send_internal(network, msg, None)
    }

    /// Deliver `msg` to a single participant (or locally, when targeting
    /// ourselves).
    pub fn send_msg_to<M: TypedMessage>(
        &mut self,
        network: &str,
        target_participant: &str,
        msg: &M,
    ) -> Vec<Action> {
        self.send_internal(network, msg, Some(target_participant))
    }

    fn send_internal<M: TypedMessage>(
        &mut self,
        network: &str,
        msg: &M,
        target: Option<&str>,
    ) -> Vec<Action> {
        let key: LinkKey = (network.to_string(), M::type_name().to_string());

        // Local delivery first.
        let local_wanted = target.is_none() || target == Some(self.participant_name.as_str());
        if local_wanted {
            if let Some(idx) = self.links.get(&key).and_then(|l| l.local_receiver) {
                if let ReceiverKind::Typed(receiver) = &self.receivers[idx as usize].kind {
                    let receiver = receiver.clone();
                    let sender_name = self.participant_name.clone();
                    if let Some(typed) = receiver.as_any().downcast_ref::<TypedReceiver<M>>() {
                        typed.dispatch(&sender_name, msg);
                    }
                }
            }
            if target.is_some() {
                return Vec::new();
            }
        }

        let Some(link) = self.links.get_mut(&key) else {
            return Vec::new();
        };

        let payload = msg.to_bytes();
        if link.history_depth > 0 && target.is_none() {
            link.retained = Some(payload.clone());
        }

        let recipients: Vec<PeerRef> = match target {
            None => link.remote_peers.clone(),
            Some(name) => self
                .peers_by_name
                .get(name)
                .into_iter()
                .copied()
                .collect(),
        };

        recipients
            .into_iter()
            .filter_map(|peer| {
                let remote_index = *self.peers.get(&peer)?.remote_subscriptions.get(&key)?;
                Some(Action::SendFrame {
                    peer,
                    frame: sim_message_frame(remote_index, &payload),
                })
            })
            .collect()
    }

    /// Start a `ParticipantReplies` barrier across every peer currently
    /// subscribed to the request/reply service. The completion runs on the
    /// I/O thread.
    pub fn call_participant_replies(&mut self, notify: CallCompletion) -> Vec<Action> {
        let key: LinkKey = (
            INTERNAL_NETWORK.to_string(),
            RequestReplyCall::type_name().to_string(),
        );
        let expected: HashSet<PeerRef> = self
            .peers
            .iter()
            .filter(|(_, p)| {
                p.state == PeerLinkState::Active && p.remote_subscriptions.contains_key(&key)
            })
            .map(|(r, _)| *r)
            .collect();

        let call = RequestReplyCall {
            call_uuid: Uuid::new_v4(),
            function_type: FunctionType::ParticipantReplies,
            data: Vec::new(),
        };
        trace!(uuid = %call.call_uuid, peers = expected.len(), "participant replies barrier");
        self.request_reply
            .start_call(call.call_uuid, expected, notify);
        self.send_msg(INTERNAL_NETWORK, &call)
    }

    /// Register a peer-shutdown callback, fired exactly once per lost peer.
    pub fn on_peer_shutdown(&mut self, callback: PeerShutdownCallback) {
        self.peer_shutdown_callbacks.push(callback);
    }

    /// Register a remote-subscription callback.
    pub fn on_remote_subscription(&mut self, callback: RemoteSubscriptionCallback) {
        self.remote_subscription_callbacks.push(callback);
    }

    /// Begin an orderly shutdown. The driver drains every link's outbound
    /// queue before tearing the transports down, so already-queued frames
    /// (final statuses, removal events) still reach their peers.
    pub fn notify_shutdown(&mut self) -> Vec<Action> {
        if self.shutting_down {
            return Vec::new();
        }
        self.shutting_down = true;
        info!(participant = %self.participant_name, "connection shutting down");
        vec![Action::Stop]
    }

    // ─── Internal events ───

    pub fn handle_internal(&mut self, event: InternalEvent) -> Vec<Action> {
        if self.shutting_down {
            return Vec::new();
        }
        match event {
            InternalEvent::DialSucceeded { peer } => self.on_dial_succeeded(peer),
            InternalEvent::DialFailed { peer, error } => self.on_dial_failed(peer, &error),
            InternalEvent::FrameReceived { peer, body } => self.on_frame(peer, &body),
            InternalEvent::PeerClosed { peer, error } => self.on_peer_closed(peer, error),
        }
    }

    fn on_dial_succeeded(&mut self, peer: PeerRef) -> Vec<Action> {
        let Some(entry) = self.peers.get_mut(&peer) else {
            // The peer was dropped while the dial was in flight.
            return vec![Action::ClosePeer { peer }];
        };
        entry.state = PeerLinkState::AwaitingReply;
        let announcement = ParticipantAnnouncement {
            header: RegistryMsgHeader::current(),
            participant_name: self.participant_name.clone(),
            participant_id: self.participant_id,
            acceptor_uris: self.acceptor_uris.clone(),
        };
        vec![Action::SendFrame {
            peer,
            frame: encode_frame(MsgKind::ParticipantAnnouncement, &announcement.to_bytes()),
        }]
    }

    fn on_dial_failed(&mut self, peer: PeerRef, error: &str) -> Vec<Action> {
        let Some(entry) = self.peers.remove(&peer) else {
            return Vec::new();
        };
        if entry.is_registry {
            self.registry_peer = None;
            let uri = self.join.as_ref().map(|j| j.uri.clone()).unwrap_or_default();
            warn!(registry = %uri, error, "could not reach registry");
            self.fail_join(ConnectionError::RegistryUnreachable {
                uri,
                reason: error.to_string(),
            });
            return Vec::new();
        }
        // A roster peer may have left between the roster snapshot and our
        // dial; drop it from the pending set and move on.
        warn!(peer = entry.label(), error, "dial to roster peer failed");
        self.resolve_pending_reply(peer);
        Vec::new()
    }

    fn on_frame(&mut self, peer: PeerRef, body: &[u8]) -> Vec<Action> {
        let (kind, payload) = match split_frame(body) {
            Ok(split) => split,
            Err(e) => return self.protocol_error(peer, &e),
        };
        let result = match kind {
            MsgKind::ParticipantAnnouncement => self.receive_announcement(peer, payload),
            MsgKind::ParticipantAnnouncementReply => self.receive_announcement_reply(peer, payload),
            MsgKind::KnownParticipants => self.receive_known_participants(peer, payload),
            MsgKind::SubscriptionAnnouncement => self.receive_subscription(peer, payload),
            MsgKind::SubscriptionAcknowledge => self.receive_subscription_ack(peer, payload),
            MsgKind::RegistryMessage => self.receive_registry_message(peer, payload),
            MsgKind::SimMessage => self.receive_sim_message(peer, payload),
        };
        match result {
            Ok(actions) => actions,
            Err(e) => self.protocol_error(peer, &e),
        }
    }

    fn protocol_error(&mut self, peer: PeerRef, error: &WireError) -> Vec<Action> {
        let label = self
            .peers
            .get(&peer)
            .map(|p| p.label().to_string())
            .unwrap_or_default();
        warn!(peer = %label, %error, "malformed frame, closing link");
        let mut actions = vec![Action::ClosePeer { peer }];
        actions.extend(self.on_peer_closed(peer, Some(error.to_string())));
        actions
    }

    fn receive_announcement(
        &mut self,
        peer: PeerRef,
        payload: &[u8],
    ) -> Result<Vec<Action>, WireError> {
        let announcement = ParticipantAnnouncement::decode(&mut Reader::new(payload))?;
        let remote_version = announcement.header.version;

        if !CURRENT_PROTOCOL_VERSION.is_compatible_with(remote_version) {
            warn!(
                peer = %announcement.participant_name,
                version = %remote_version,
                "incompatible protocol version, closing link"
            );
            let reply = ParticipantAnnouncementReply::failure(format!(
                "protocol version {remote_version} is not supported by {}",
                CURRENT_PROTOCOL_VERSION
            ));
            let mut actions = vec![
                Action::SendFrame {
                    peer,
                    frame: encode_frame(MsgKind::ParticipantAnnouncementReply, &reply.to_bytes()),
                },
                Action::ClosePeer { peer },
            ];
            actions.extend(self.on_peer_closed(peer, None));
            return Ok(actions);
        }

        let info = PeerInfo {
            participant_name: announcement.participant_name.clone(),
            participant_id: announcement.participant_id,
            acceptor_uris: announcement.acceptor_uris.clone(),
        };
        debug!(peer = %info.participant_name, "participant announced");

        if let Some(entry) = self.peers.get_mut(&peer) {
            entry.state = PeerLinkState::Active;
            entry.info = Some(info.clone());
        } else {
            return Ok(Vec::new());
        }
        self.peers_by_name.insert(info.participant_name, peer);

        let mut actions = vec![Action::SendFrame {
            peer,
            frame: encode_frame(
                MsgKind::ParticipantAnnouncementReply,
                &ParticipantAnnouncementReply::success().to_bytes(),
            ),
        }];
        actions.extend(self.announce_local_subscriptions(peer));
        Ok(actions)
    }

    fn receive_announcement_reply(
        &mut self,
        peer: PeerRef,
        payload: &[u8],
    ) -> Result<Vec<Action>, WireError> {
        let reply = ParticipantAnnouncementReply::decode(&mut Reader::new(payload))?;
        let is_registry = self.peers.get(&peer).map(|p| p.is_registry).unwrap_or(false);

        if reply.status == ReplyStatus::Failed {
            warn!(
                peer = self
                    .peers
                    .get(&peer)
                    .map(|p| p.label().to_string())
                    .unwrap_or_default(),
                version = %reply.header.version,
                diagnostic = %reply.diagnostic,
                "announcement rejected"
            );
            if is_registry {
                let uri = self.join.as_ref().map(|j| j.uri.clone()).unwrap_or_default();
                self.fail_join(ConnectionError::RegistryRejected {
                    uri,
                    diagnostic: reply.diagnostic.clone(),
                });
            }
            let mut actions = vec![Action::ClosePeer { peer }];
            actions.extend(self.on_peer_closed(peer, None));
            return Ok(actions);
        }

        if is_registry {
            // Success: the roster follows as a KnownParticipants frame.
            return Ok(Vec::new());
        }

        let mut became_active = false;
        let mut peer_name = None;
        if let Some(entry) = self.peers.get_mut(&peer) {
            if entry.state == PeerLinkState::AwaitingReply {
                entry.state = PeerLinkState::Active;
                became_active = true;
                peer_name = entry.info.as_ref().map(|i| i.participant_name.clone());
            }
        }

        let mut actions = Vec::new();
        if became_active {
            if let Some(name) = peer_name {
                self.peers_by_name.insert(name, peer);
            }
            actions.extend(self.announce_local_subscriptions(peer));
        }
        self.resolve_pending_reply(peer);
        Ok(actions)
    }

    fn receive_known_participants(
        &mut self,
        peer: PeerRef,
        payload: &[u8],
    ) -> Result<Vec<Action>, WireError> {
        if Some(peer) != self.registry_peer {
            warn!("known participants from a non-registry peer, ignoring");
            return Ok(Vec::new());
        }
        let known = KnownParticipants::decode(&mut Reader::new(payload))?;
        info!(count = known.participants.len(), "received participant roster");

        let mut actions = Vec::new();
        for info in known.participants {
            if info.participant_name == self.participant_name {
                continue;
            }
            let uris: Vec<Uri> = info
                .acceptor_uris
                .iter()
                .filter_map(|u| Uri::parse(u).ok())
                .collect();
            if uris.is_empty() {
                warn!(peer = %info.participant_name, "roster entry without usable endpoints");
                continue;
            }
            let new_peer = self.allocate_peer_ref();
            self.peers.insert(
                new_peer,
                PeerEntry {
                    state: PeerLinkState::Dialing,
                    is_registry: false,
                    info: Some(PeerInfo {
                        participant_name: info.participant_name,
                        participant_id: info.participant_id,
                        acceptor_uris: info.acceptor_uris,
                    }),
                    remote_subscriptions: HashMap::new(),
                },
            );
            if let Some(join) = self.join.as_mut() {
                join.pending_replies.insert(new_peer);
            }
            actions.push(Action::Dial {
                peer: new_peer,
                uris,
            });
        }

        if let Some(join) = self.join.as_mut() {
            join.roster_received = true;
        }
        self.try_complete_join();
        Ok(actions)
    }

    fn receive_registry_message(
        &mut self,
        peer: PeerRef,
        payload: &[u8],
    ) -> Result<Vec<Action>, WireError> {
        if Some(peer) != self.registry_peer {
            return Ok(Vec::new());
        }
        // The registry forwards announcements of late joiners; the newcomer
        // dials us directly, so this is a lookup update only.
        let announcement = ParticipantAnnouncement::decode(&mut Reader::new(payload))?;
        debug!(peer = %announcement.participant_name, "late joiner announced via registry");
        self.announced_participants
            .insert(announcement.participant_name, announcement.participant_id);
        Ok(Vec::new())
    }

    fn receive_subscription(
        &mut self,
        peer: PeerRef,
        payload: &[u8],
    ) -> Result<Vec<Action>, WireError> {
        let record = SubscriberRecord::decode(&mut Reader::new(payload))?;
        let key: LinkKey = (record.network_name.clone(), record.type_name.clone());

        let compatible = match self.links.get(&key).and_then(|l| l.version) {
            Some(local_version) => local_version == record.version,
            // Keys we neither send nor receive are accepted; a sender
            // registered later never reaches a mismatched peer because the
            // record stays keyed by version.
            None => true,
        };

        let peer_info = match self.peers.get(&peer) {
            Some(entry) => entry.info.clone(),
            None => return Ok(Vec::new()),
        };

        let ack = SubscriptionAcknowledge {
            status: if compatible {
                ReplyStatus::Success
            } else {
                ReplyStatus::Failed
            },
            subscriber: record.clone(),
        };
        let mut actions = vec![Action::SendFrame {
            peer,
            frame: encode_frame(MsgKind::SubscriptionAcknowledge, &ack.to_bytes()),
        }];

        if !compatible {
            warn!(
                peer = peer_info
                    .as_ref()
                    .map(|i| i.participant_name.as_str())
                    .unwrap_or("<unannounced>"),
                network = %record.network_name,
                type_name = %record.type_name,
                version = record.version,
                "subscription version mismatch, rejecting"
            );
            return Ok(actions);
        }

        let newly_added = match self.peers.get_mut(&peer) {
            Some(entry) => entry
                .remote_subscriptions
                .insert(key.clone(), record.receiver_index)
                .is_none(),
            None => return Ok(Vec::new()),
        };
        let link = self.links.entry(key).or_default();
        if newly_added {
            link.remote_peers.push(peer);
        }

        // Late subscriber recovery: replay the retained message.
        if link.history_depth > 0 {
            if let Some(retained) = link.retained.clone() {
                actions.push(Action::SendFrame {
                    peer,
                    frame: sim_message_frame(record.receiver_index, &retained),
                });
            }
        }

        if newly_added {
            if let Some(info) = peer_info {
                for callback in &self.remote_subscription_callbacks {
                    callback(&info, &record);
                }
            }
        }
        Ok(actions)
    }

    fn receive_subscription_ack(
        &mut self,
        peer: PeerRef,
        payload: &[u8],
    ) -> Result<Vec<Action>, WireError> {
        let ack = SubscriptionAcknowledge::decode(&mut Reader::new(payload))?;
        if ack.status == ReplyStatus::Failed {
            warn!(
                network = %ack.subscriber.network_name,
                type_name = %ack.subscriber.type_name,
                "peer rejected subscription"
            );
        }
        let key: LinkKey = (
            ack.subscriber.network_name.clone(),
            ack.subscriber.type_name.clone(),
        );
        // Duplicate acknowledgements find no pending entry and fall through.
        let Some(registrations) = self.pending_acks.remove(&(peer, key)) else {
            return Ok(Vec::new());
        };
        for reg_id in registrations {
            self.resolve_sync_registration(reg_id);
        }
        Ok(Vec::new())
    }

    fn receive_sim_message(
        &mut self,
        peer: PeerRef,
        payload: &[u8],
    ) -> Result<Vec<Action>, WireError> {
        let mut reader = Reader::new(payload);
        let receiver_index = reader.u32()? as usize;
        let body = &payload[4..];

        let sender_name = self
            .peers
            .get(&peer)
            .and_then(|p| p.info.as_ref())
            .map(|i| i.participant_name.clone())
            .unwrap_or_default();

        enum Dispatch {
            Typed(Rc<dyn RawReceiver>),
            RequestReplyCall,
            RequestReplyCallReturn,
        }
        let dispatch = match self.receivers.get(receiver_index).map(|s| &s.kind) {
            Some(ReceiverKind::Typed(receiver)) => Dispatch::Typed(receiver.clone()),
            Some(ReceiverKind::RequestReplyCall) => Dispatch::RequestReplyCall,
            Some(ReceiverKind::RequestReplyCallReturn) => Dispatch::RequestReplyCallReturn,
            None => {
                warn!(receiver_index, "message for unknown receiver index");
                return Ok(Vec::new());
            }
        };

        match dispatch {
            Dispatch::Typed(receiver) => {
                receiver.receive_bytes(&sender_name, body)?;
                Ok(Vec::new())
            }
            Dispatch::RequestReplyCall => {
                let call = RequestReplyCall::decode(&mut Reader::new(body))?;
                let status = match call.function_type {
                    FunctionType::ParticipantReplies => RequestReplyStatus::Success,
                    FunctionType::Unknown(_) => RequestReplyStatus::UnknownFunctionType,
                };
                let call_return = RequestReplyCallReturn {
                    call_uuid: call.call_uuid,
                    function_type: call.function_type,
                    status,
                    data: Vec::new(),
                };
                Ok(self.send_msg_to(INTERNAL_NETWORK, &sender_name, &call_return))
            }
            Dispatch::RequestReplyCallReturn => {
                let call_return = RequestReplyCallReturn::decode(&mut Reader::new(body))?;
                self.request_reply.on_reply(call_return.call_uuid, peer);
                Ok(Vec::new())
            }
        }
    }

    fn on_peer_closed(&mut self, peer: PeerRef, error: Option<String>) -> Vec<Action> {
        let Some(entry) = self.peers.remove(&peer) else {
            return Vec::new();
        };

        if entry.is_registry {
            self.registry_peer = None;
            let join_in_flight = self
                .join
                .as_ref()
                .map(|j| j.notify.is_some() && !j.roster_received)
                .unwrap_or(false);
            if join_in_flight {
                let uri = self.join.as_ref().map(|j| j.uri.clone()).unwrap_or_default();
                self.fail_join(ConnectionError::RegistryUnreachable {
                    uri,
                    reason: error.unwrap_or_else(|| "connection closed".to_string()),
                });
            } else {
                // Non-fatal after the roster exchange: peer links carry on.
                warn!("registry connection lost; continuing with direct peer links");
            }
            return Vec::new();
        }

        if let Some(info) = &entry.info {
            info!(peer = %info.participant_name, ?error, "peer disconnected");
            self.peers_by_name.remove(&info.participant_name);
            self.announced_participants.remove(&info.participant_name);
        }

        for key in entry.remote_subscriptions.keys() {
            if let Some(link) = self.links.get_mut(key) {
                link.remote_peers.retain(|r| *r != peer);
            }
        }

        // Outstanding handshakes must not wait on a dead peer.
        let stale_acks: Vec<_> = self
            .pending_acks
            .keys()
            .filter(|(p, _)| *p == peer)
            .cloned()
            .collect();
        for ack_key in stale_acks {
            if let Some(registrations) = self.pending_acks.remove(&ack_key) {
                for reg_id in registrations {
                    self.resolve_sync_registration(reg_id);
                }
            }
        }
        self.request_reply.on_peer_removed(peer);
        self.resolve_pending_reply(peer);

        if let Some(info) = entry.info {
            for callback in &self.peer_shutdown_callbacks {
                callback(&info);
            }
        }
        Vec::new()
    }

    // ─── Handshake helpers ───

    fn announce_local_subscriptions(&self, peer: PeerRef) -> Vec<Action> {
        self.receivers
            .iter()
            .map(|slot| Action::SendFrame {
                peer,
                frame: encode_frame(MsgKind::SubscriptionAnnouncement, &slot.record.to_bytes()),
            })
            .collect()
    }

    fn resolve_sync_registration(&mut self, reg_id: u64) {
        if let Some(reg) = self.sync_registrations.get_mut(&reg_id) {
            reg.remaining = reg.remaining.saturating_sub(1);
            if reg.remaining == 0 {
                if let Some(notify) = reg.notify.take() {
                    let _ = notify.send(());
                }
                self.sync_registrations.remove(&reg_id);
            }
        }
    }

    fn resolve_pending_reply(&mut self, peer: PeerRef) {
        if let Some(join) = self.join.as_mut() {
            join.pending_replies.remove(&peer);
        }
        self.try_complete_join();
    }

    fn try_complete_join(&mut self) {
        let complete = self
            .join
            .as_ref()
            .map(|j| j.roster_received && j.pending_replies.is_empty() && j.notify.is_some())
            .unwrap_or(false);
        if complete {
            if let Some(join) = self.join.as_mut() {
                if let Some(notify) = join.notify.take() {
                    info!(participant = %self.participant_name, "all participant replies received");
                    let _ = notify.send(Ok(()));
                }
            }
        }
    }

    fn fail_join(&mut self, error: ConnectionError) {
        if let Some(join) = self.join.as_mut() {
            if let Some(notify) = join.notify.take() {
                let _ = notify.send(Err(error));
            }
        }
    }
}

/// Assemble a `SimMessage` frame: receiver index plus pre-encoded payload.
fn sim_message_frame(receiver_index: u32, payload: &[u8]) -> Bytes {
    let mut w = Writer::new();
    w.put_u32(receiver_index);
    w.put_raw(payload);
    encode_frame(MsgKind::SimMessage, &w.freeze())
}
