//! Peer transport tasks.
//!
//! Each peer link runs two tasks on the connection's local executor: a
//! reader that reassembles frames and posts them as events, and a writer
//! that drains a bounded outbound queue. The bounded queue is the
//! backpressure point: when it is full, the executor suspends on `send`
//! until the writer drains.

use crate::core::{CoreEvent, InternalEvent, PeerRef};
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Outbound frames queued per link before the sender suspends.
pub const SEND_QUEUE_DEPTH: usize = 128;

/// A connected transport, before identity is known.
pub enum PeerStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl PeerStream {
    /// Human-readable endpoint description for logs.
    pub fn endpoint_label(&self) -> String {
        match self {
            PeerStream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            #[cfg(unix)]
            PeerStream::Unix(_) => "local".to_string(),
        }
    }
}

/// Writer-side handle of a live link.
pub struct PeerLink {
    tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerLink {
    /// Queue a frame without blocking; the driver awaits on the slow path.
    pub fn sender(&self) -> mpsc::Sender<Bytes> {
        self.tx.clone()
    }

    /// Tear the link down: stop reading, let the writer drain its queue
    /// (bounded by a timeout, and cut short by a dead socket), then stop.
    /// The reader's closed-event (if any) is already in flight or
    /// suppressed by the core's peer removal.
    pub async fn shutdown(self) {
        self.reader.abort();
        drop(self.tx);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(500), self.writer).await;
    }
}

/// Spawn reader/writer tasks for a connected stream.
///
/// Must be called from within the connection's `LocalSet`.
pub fn spawn_peer_tasks(
    peer: PeerRef,
    stream: PeerStream,
    events: mpsc::UnboundedSender<CoreEvent>,
) -> PeerLink {
    match stream {
        PeerStream::Tcp(s) => {
            let (r, w) = s.into_split();
            spawn_halves(peer, r, w, events)
        }
        #[cfg(unix)]
        PeerStream::Unix(s) => {
            let (r, w) = s.into_split();
            spawn_halves(peer, r, w, events)
        }
    }
}

fn spawn_halves<R, W>(
    peer: PeerRef,
    mut read_half: R,
    mut write_half: W,
    events: mpsc::UnboundedSender<CoreEvent>,
) -> PeerLink
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(SEND_QUEUE_DEPTH);

    let reader_events = events.clone();
    let reader = tokio::task::spawn_local(async move {
        let error = loop {
            match crate::framing::read_frame(&mut read_half).await {
                Ok(Some(body)) => {
                    trace!(?peer, len = body.len(), "frame received");
                    if reader_events
                        .send(CoreEvent::Internal(InternalEvent::FrameReceived {
                            peer,
                            body,
                        }))
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };
        debug!(?peer, ?error, "peer link closed");
        let _ = reader_events.send(CoreEvent::Internal(InternalEvent::PeerClosed {
            peer,
            error: error.map(|e| e.to_string()),
        }));
    });

    let writer = tokio::task::spawn_local(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = crate::framing::write_frame(&mut write_half, &frame).await {
                debug!(?peer, error = %e, "peer write failed");
                let _ = events.send(CoreEvent::Internal(InternalEvent::PeerClosed {
                    peer,
                    error: Some(e.to_string()),
                }));
                return;
            }
        }
    });

    PeerLink { tx, reader, writer }
}

/// Dial one of the peer's advertised endpoints, most preferred first.
pub async fn dial(uris: &[silbus_types::Uri]) -> io::Result<PeerStream> {
    let mut last_error = io::Error::new(io::ErrorKind::AddrNotAvailable, "no endpoint to dial");
    for uri in uris {
        match uri {
            #[cfg(unix)]
            silbus_types::Uri::Local { path } => match UnixStream::connect(path).await {
                Ok(s) => return Ok(PeerStream::Unix(s)),
                Err(e) => last_error = e,
            },
            #[cfg(not(unix))]
            silbus_types::Uri::Local { .. } => {}
            silbus_types::Uri::Tcp { host, port } | silbus_types::Uri::SilKit { host, port } => {
                match TcpStream::connect((host.as_str(), *port)).await {
                    Ok(s) => {
                        s.set_nodelay(true).ok();
                        return Ok(PeerStream::Tcp(s));
                    }
                    Err(e) => last_error = e,
                }
            }
        }
    }
    Err(last_error)
}
