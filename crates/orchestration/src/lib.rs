//! Lifecycle coordination and virtual time synchronization.
//!
//! The two protocol cores are pure state machines:
//!
//! - [`lifecycle_machine`]: the per-participant state machine from the
//!   coordinated/autonomous lifecycle, driven by system states, system
//!   commands, and user-handler completions
//! - [`time_machine`]: the distributed time-quantum barrier
//!
//! The services ([`LifecycleService`], [`TimeSyncService`]) wire the
//! machines into a connection, publish [`ParticipantStatus`] transitions,
//! and run user callbacks on the serialized executor stream. The
//! [`SystemMonitor`] derives the cluster state from required-participant
//! statuses; the [`SystemController`] issues cluster commands.
//!
//! [`ParticipantStatus`]: silbus_messages::ParticipantStatus

pub mod lifecycle;
pub mod lifecycle_machine;
pub mod system_controller;
pub mod system_monitor;
pub mod system_state;
pub mod time_machine;
pub mod time_provider;
pub mod time_sync;

pub use lifecycle::{LifecycleCompletion, LifecycleHandler, LifecycleService};
pub use system_controller::SystemController;
pub use system_monitor::SystemMonitor;
pub use system_state::SystemStateTracker;
pub use time_provider::{TimeProvider, TimeProviderKind};
pub use time_sync::{SimulationStepHandler, TimeSyncService};

use silbus_types::ParticipantState;
use thiserror::Error;

/// Errors surfaced by lifecycle entry points.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("the lifecycle was already started")]
    AlreadyStarted,

    #[error("operation {operation} is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ParticipantState,
    },

    #[error("timed out waiting for the final state")]
    Timeout,

    #[error("the lifecycle service is gone")]
    ServiceGone,
}
