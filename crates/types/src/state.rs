//! Lifecycle and system state enums.

use std::fmt;

/// Per-participant lifecycle state.
///
/// The numeric ordering follows the normal progression; it is used by the
/// system monitor to aggregate the cluster-wide minimum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ParticipantState {
    Invalid = 0,
    ServicesCreated = 1,
    CommunicationInitializing = 2,
    CommunicationInitialized = 3,
    ReadyToRun = 4,
    Running = 5,
    Paused = 6,
    Stopping = 7,
    Stopped = 8,
    ShuttingDown = 9,
    Shutdown = 10,
    Error = 11,
    Aborting = 12,
}

impl ParticipantState {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ParticipantState::ServicesCreated,
            2 => ParticipantState::CommunicationInitializing,
            3 => ParticipantState::CommunicationInitialized,
            4 => ParticipantState::ReadyToRun,
            5 => ParticipantState::Running,
            6 => ParticipantState::Paused,
            7 => ParticipantState::Stopping,
            8 => ParticipantState::Stopped,
            9 => ParticipantState::ShuttingDown,
            10 => ParticipantState::Shutdown,
            11 => ParticipantState::Error,
            12 => ParticipantState::Aborting,
            _ => ParticipantState::Invalid,
        }
    }

    /// Whether this state terminates the lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ParticipantState::Shutdown)
    }
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Cluster-wide state aggregated from all required participants.
///
/// Ordered by the normal progression, like [`ParticipantState`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Invalid,
    ServicesCreated,
    CommunicationInitializing,
    CommunicationInitialized,
    ReadyToRun,
    Running,
    Paused,
    Stopping,
    Stopped,
    ShuttingDown,
    Shutdown,
    Error,
    Aborting,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
