//! Peer-to-peer connection layer.
//!
//! A [`Connection`] owns every peer link, the listening acceptors, the
//! per-message-type routing tables, and the single-threaded I/O executor
//! that mutates them. The protocol itself is a sans-IO state machine
//! ([`core::ConnectionCore`]): events go in, actions come out, and the
//! driver thread executes the actions against real sockets. External
//! threads never touch the tables directly; they post closures onto the
//! executor's command channel.
//!
//! ```text
//! user thread ──post──► command channel ──► ConnectionCore ──► actions ──► sockets
//!                                            ▲
//! reader tasks ──frames────────────────────┘
//! ```

pub mod connection;
pub mod core;
pub mod framing;
pub mod peer;
pub mod request_reply;

pub use crate::connection::{Connection, ConnectionConfig, SubscriptionMode};
pub use crate::core::{MessageHandler, PeerInfo, PeerRef};

use thiserror::Error;

/// Errors surfaced by connection entry points.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid uri: {0}")]
    Uri(#[from] silbus_types::UriError),

    #[error("registry at {uri} rejected the announcement: {diagnostic}")]
    RegistryRejected { uri: String, diagnostic: String },

    #[error("could not reach the registry at {uri}: {reason}")]
    RegistryUnreachable { uri: String, reason: String },

    #[error("history depth {0} is not supported (0 or 1)")]
    UnsupportedHistoryDepth(usize),

    #[error("the connection executor is shut down")]
    ExecutorGone,
}
