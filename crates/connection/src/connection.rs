//! The public connection handle and its I/O driver.
//!
//! `Connection::new` binds the acceptors, then spawns a dedicated thread
//! running a current-thread tokio runtime. The driver loop on that thread
//! owns the [`ConnectionCore`] and the per-peer transport tasks; public
//! entry points post closures onto the command channel and, where the call
//! is blocking, wait on a oneshot completion. Blocking entry points must
//! not be invoked from handlers (they already run on the I/O thread).

use crate::core::{
    Action, ConnectionCore, CoreEvent, InternalEvent, MessageHandler, PeerRef,
    PeerShutdownCallback, RemoteSubscriptionCallback,
};
use crate::peer::{dial, spawn_peer_tasks, PeerLink, PeerStream};
use crate::request_reply::{CallCompletion, CallOutcome};
use crate::ConnectionError;
use silbus_messages::TypedMessage;
use silbus_types::{hash_participant_name, ParticipantId, Uri};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Transport configuration of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TCP acceptor addresses; port 0 picks an ephemeral port. IPv4 and
    /// IPv6 addresses may be mixed.
    pub tcp_listen: Vec<SocketAddr>,
    /// Also accept same-host peers over a Unix-domain socket.
    pub enable_local_domain: bool,
    /// Directory for the per-instance local-domain socket name.
    pub local_socket_dir: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tcp_listen: vec!["127.0.0.1:0".parse().expect("static addr")],
            enable_local_domain: cfg!(unix),
            local_socket_dir: None,
        }
    }
}

/// Whether a service registration blocks until every connected peer has
/// acknowledged its subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Block the calling thread until all acknowledgements arrived. This
    /// is what prevents message loss for non-async services.
    Sync,
    /// Return immediately; messages may race the handshake.
    Async,
}

/// Events produced by the accept loops and dial tasks. Kept apart from
/// [`CoreEvent`] because they carry live sockets.
enum DriverEvent {
    Accepted {
        stream: PeerStream,
    },
    DialOutcome {
        peer: PeerRef,
        result: std::io::Result<PeerStream>,
    },
}

/// A participant's connection to the simulation.
///
/// Dropping the connection performs an orderly shutdown: every link closes,
/// peer-shutdown callbacks quiesce, and the I/O thread joins.
pub struct Connection {
    participant_name: String,
    participant_id: ParticipantId,
    acceptor_uris: Vec<String>,
    events: mpsc::UnboundedSender<CoreEvent>,
    io_thread: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
    local_socket_path: std::sync::Mutex<Option<PathBuf>>,
}

impl Connection {
    /// Bind the acceptors and start the I/O thread.
    pub fn new(participant_name: &str, config: ConnectionConfig) -> Result<Self, ConnectionError> {
        let participant_id = hash_participant_name(participant_name);

        // Bind with std so the ephemeral ports are known before the
        // runtime exists; the driver converts to tokio listeners.
        let mut tcp_listeners = Vec::new();
        let mut acceptor_uris = Vec::new();
        for addr in &config.tcp_listen {
            let listener = std::net::TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            let local = listener.local_addr()?;
            acceptor_uris.push(advertised_uri(local));
            tcp_listeners.push(listener);
        }

        #[cfg(unix)]
        let (unix_listener, local_socket_path) = if config.enable_local_domain {
            let dir = config
                .local_socket_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            // Unique per instance: pid plus a process-wide counter, so two
            // same-named connections in one process cannot collide.
            static INSTANCE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
            let instance = INSTANCE.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let path = dir.join(format!(
                "silbus-{}-{}-{}.sock",
                sanitize(participant_name),
                std::process::id(),
                instance
            ));
            let listener = std::os::unix::net::UnixListener::bind(&path)?;
            listener.set_nonblocking(true)?;
            acceptor_uris.insert(0, Uri::local(path.to_string_lossy()).to_string());
            (Some(listener), Some(path))
        } else {
            (None, None)
        };
        #[cfg(not(unix))]
        let (unix_listener, local_socket_path): (Option<()>, Option<PathBuf>) = (None, None);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // The core holds `Rc`s and must be born on the thread that owns it.
        let core_name = participant_name.to_string();
        let core_uris = acceptor_uris.clone();
        let thread_events = events_tx.clone();
        let thread_name = format!("silbus-io-{participant_name}");
        let io_thread = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let core = ConnectionCore::new(core_name, participant_id, core_uris);
                io_thread_main(core, events_rx, thread_events, tcp_listeners, unix_listener)
            })?;

        Ok(Self {
            participant_name: participant_name.to_string(),
            participant_id,
            acceptor_uris,
            events: events_tx,
            io_thread: std::sync::Mutex::new(Some(io_thread)),
            local_socket_path: std::sync::Mutex::new(local_socket_path),
        })
    }

    pub fn participant_name(&self) -> &str {
        &self.participant_name
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    /// The endpoints advertised to peers, most preferred first.
    pub fn acceptor_uris(&self) -> &[String] {
        &self.acceptor_uris
    }

    /// Post a closure onto the I/O executor.
    pub fn post(
        &self,
        f: impl FnOnce(&mut ConnectionCore) -> Vec<Action> + Send + 'static,
    ) {
        let _ = self.events.send(CoreEvent::Command(Box::new(f)));
    }

    /// Connect to the registry, exchange the roster, and link up with every
    /// known peer. Blocks until all announcement replies arrived.
    pub fn join_registry(&self, registry_uri: &str) -> Result<(), ConnectionError> {
        let uri = Uri::parse(registry_uri)?;
        let (tx, rx) = oneshot::channel();
        self.post(move |core| core.join_registry(uri, tx));
        rx.blocking_recv().map_err(|_| ConnectionError::ExecutorGone)?
    }

    /// Register a typed receiver. `SubscriptionMode::Sync` blocks until
    /// every currently connected peer acknowledged the subscription.
    pub fn subscribe<M: TypedMessage>(
        &self,
        network: &str,
        mode: SubscriptionMode,
        handler: MessageHandler<M>,
    ) -> Result<(), ConnectionError> {
        let network = network.to_string();
        match mode {
            SubscriptionMode::Async => {
                self.post(move |core| core.subscribe(&network, handler, false).0);
                Ok(())
            }
            SubscriptionMode::Sync => {
                let (tx, rx) = oneshot::channel();
                self.post(move |core| {
                    let (actions, completion) = core.subscribe(&network, handler, true);
                    let _ = tx.send(completion);
                    actions
                });
                let completion = rx
                    .blocking_recv()
                    .map_err(|_| ConnectionError::ExecutorGone)?;
                if let Some(all_acked) = completion {
                    debug!(participant = %self.participant_name,
                           "waiting for subscription acknowledgements");
                    all_acked
                        .blocking_recv()
                        .map_err(|_| ConnectionError::ExecutorGone)?;
                }
                Ok(())
            }
        }
    }

    /// Bind a sender for `(network, M)`.
    pub fn add_sender<M: TypedMessage>(&self, network: &str) {
        let network = network.to_string();
        self.post(move |core| {
            core.add_sender::<M>(&network);
            Vec::new()
        });
    }

    /// Configure per-type history. Only depths 0 and 1 are supported.
    pub fn set_history_depth<M: TypedMessage>(
        &self,
        network: &str,
        depth: usize,
    ) -> Result<(), ConnectionError> {
        let network = network.to_string();
        let (tx, rx) = oneshot::channel();
        self.post(move |core| {
            let _ = tx.send(core.set_history_depth::<M>(&network, depth));
            Vec::new()
        });
        rx.blocking_recv().map_err(|_| ConnectionError::ExecutorGone)?
    }

    /// Broadcast `msg` to every subscriber of its type on `network`.
    pub fn send<M: TypedMessage>(&self, network: &str, msg: M) {
        let network = network.to_string();
        self.post(move |core| core.send_msg(&network, &msg));
    }

    /// Deliver `msg` to a single participant.
    pub fn send_to<M: TypedMessage>(&self, network: &str, target_participant: &str, msg: M) {
        let network = network.to_string();
        let target = target_participant.to_string();
        self.post(move |core| core.send_msg_to(&network, &target, &msg));
    }

    /// Run a `ParticipantReplies` barrier; the completion fires on the I/O
    /// thread once every connected peer has answered (or left).
    pub fn participant_replies(&self, completion: CallCompletion) {
        self.post(move |core| core.call_participant_replies(completion));
    }

    /// Blocking variant of [`Connection::participant_replies`] for
    /// application threads.
    pub fn await_participant_replies(&self) -> Result<CallOutcome, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.participant_replies(Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }));
        rx.blocking_recv().map_err(|_| ConnectionError::ExecutorGone)
    }

    /// Register a callback fired exactly once when a peer disappears.
    pub fn on_peer_shutdown(&self, callback: PeerShutdownCallback) {
        self.post(move |core| {
            core.on_peer_shutdown(callback);
            Vec::new()
        });
    }

    /// Register a callback fired when a peer announces a subscription.
    pub fn on_remote_subscription(&self, callback: RemoteSubscriptionCallback) {
        self.post(move |core| {
            core.on_remote_subscription(callback);
            Vec::new()
        });
    }

    /// Orderly shutdown: close every link, stop the executor, and join the
    /// I/O thread. Idempotent; also drops the callbacks held by the core,
    /// which breaks any `Arc` cycles services formed with this connection.
    pub fn notify_shutdown(&self) {
        self.post(|core| core.notify_shutdown());
        let handle = self.io_thread.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let path = self.local_socket_path.lock().ok().and_then(|mut p| p.take());
        if let Some(path) = path {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.notify_shutdown();
    }
}

fn advertised_uri(local: SocketAddr) -> String {
    // An unspecified bind address is not dialable; advertise loopback.
    let host = match local.ip() {
        ip if ip.is_unspecified() && ip.is_ipv4() => "127.0.0.1".to_string(),
        ip if ip.is_unspecified() => "::1".to_string(),
        ip => ip.to_string(),
    };
    Uri::tcp(host, local.port()).to_string()
}

#[cfg(unix)]
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

// ─── Driver ───

#[cfg(unix)]
type UnixStdListener = std::os::unix::net::UnixListener;
#[cfg(not(unix))]
type UnixStdListener = ();

fn io_thread_main(
    core: ConnectionCore,
    events: mpsc::UnboundedReceiver<CoreEvent>,
    events_tx: mpsc::UnboundedSender<CoreEvent>,
    tcp_listeners: Vec<std::net::TcpListener>,
    unix_listener: Option<UnixStdListener>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            warn!(error = %e, "could not build connection runtime");
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, driver_loop(core, events, events_tx, tcp_listeners, unix_listener));
}

async fn driver_loop(
    mut core: ConnectionCore,
    mut events: mpsc::UnboundedReceiver<CoreEvent>,
    events_tx: mpsc::UnboundedSender<CoreEvent>,
    tcp_listeners: Vec<std::net::TcpListener>,
    unix_listener: Option<UnixStdListener>,
) {
    let (driver_tx, mut driver_rx) = mpsc::unbounded_channel::<DriverEvent>();

    for listener in tcp_listeners {
        let accept_tx = driver_tx.clone();
        tokio::task::spawn_local(async move {
            let Ok(listener) = tokio::net::TcpListener::from_std(listener) else {
                return;
            };
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        stream.set_nodelay(true).ok();
                        if accept_tx
                            .send(DriverEvent::Accepted {
                                stream: PeerStream::Tcp(stream),
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        return;
                    }
                }
            }
        });
    }

    #[cfg(unix)]
    if let Some(listener) = unix_listener {
        let accept_tx = driver_tx.clone();
        tokio::task::spawn_local(async move {
            let Ok(listener) = tokio::net::UnixListener::from_std(listener) else {
                return;
            };
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if accept_tx
                            .send(DriverEvent::Accepted {
                                stream: PeerStream::Unix(stream),
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "local-domain accept failed");
                        return;
                    }
                }
            }
        });
    }
    #[cfg(not(unix))]
    let _ = unix_listener;

    let mut links: HashMap<PeerRef, PeerLink> = HashMap::new();

    'driver: loop {
        let actions = tokio::select! {
            event = events.recv() => match event {
                Some(CoreEvent::Command(command)) => command(&mut core),
                Some(CoreEvent::Internal(internal)) => core.handle_internal(internal),
                None => break 'driver,
            },
            event = driver_rx.recv() => match event {
                Some(DriverEvent::Accepted { stream }) => {
                    let label = stream.endpoint_label();
                    let peer = core.on_peer_accepted(&label);
                    links.insert(peer, spawn_peer_tasks(peer, stream, events_tx.clone()));
                    Vec::new()
                }
                Some(DriverEvent::DialOutcome { peer, result }) => match result {
                    Ok(stream) => {
                        links.insert(peer, spawn_peer_tasks(peer, stream, events_tx.clone()));
                        core.handle_internal(InternalEvent::DialSucceeded { peer })
                    }
                    Err(e) => core.handle_internal(InternalEvent::DialFailed {
                        peer,
                        error: e.to_string(),
                    }),
                },
                None => Vec::new(),
            },
        };

        for action in actions {
            match action {
                Action::SendFrame { peer, frame } => {
                    if let Some(link) = links.get(&peer) {
                        // Awaiting here is the backpressure point: a full
                        // queue suspends the whole executor until drained.
                        if link.sender().send(frame).await.is_err() {
                            debug!(?peer, "send to closing link dropped");
                        }
                    }
                }
                Action::Dial { peer, uris } => {
                    let outcome_tx = driver_tx.clone();
                    tokio::task::spawn_local(async move {
                        let result = dial(&uris).await;
                        let _ = outcome_tx.send(DriverEvent::DialOutcome { peer, result });
                    });
                }
                Action::ClosePeer { peer } => {
                    if let Some(link) = links.remove(&peer) {
                        // Drain the outbound queue first so a final frame
                        // (failure reply, rejection ack) still goes out; a
                        // dead socket fails the drain immediately.
                        link.shutdown().await;
                    }
                }
                Action::Stop => break 'driver,
            }
        }
    }

    // Drain outbound queues before the transports go away.
    for (_, link) in links.drain() {
        link.shutdown().await;
    }
    info!("connection executor stopped");
}
