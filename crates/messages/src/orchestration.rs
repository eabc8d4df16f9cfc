//! Lifecycle, system control, and virtual time messages.

use crate::TypedMessage;
use silbus_types::ParticipantState;
use silbus_wire::{decode_vec, encode_vec, Decode, Encode, Reader, WireError, Writer};
use std::time::Duration;

/// Emitted by a lifecycle service on every state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantStatus {
    pub participant_name: String,
    pub state: ParticipantState,
    pub enter_reason: String,
    /// Wall-clock nanoseconds since the Unix epoch at transition time.
    pub enter_time_ns: i64,
}

impl Encode for ParticipantStatus {
    fn encode(&self, w: &mut Writer) {
        w.put_string(&self.participant_name);
        w.put_u8(self.state as u8);
        w.put_string(&self.enter_reason);
        w.put_i64(self.enter_time_ns);
    }
}

impl Decode for ParticipantStatus {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            participant_name: r.string()?,
            state: ParticipantState::from_u8(r.u8()?),
            enter_reason: r.string()?,
            enter_time_ns: r.i64()?,
        })
    }
}

impl TypedMessage for ParticipantStatus {
    fn type_name() -> &'static str {
        "ParticipantStatus"
    }
}

/// Cluster commands issued by a system controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemCommandKind {
    Run,
    Stop,
    Shutdown,
    Restart,
    AbortSimulation,
}

impl SystemCommandKind {
    fn to_u8(self) -> u8 {
        match self {
            SystemCommandKind::Run => 1,
            SystemCommandKind::Stop => 2,
            SystemCommandKind::Shutdown => 3,
            SystemCommandKind::Restart => 4,
            SystemCommandKind::AbortSimulation => 5,
        }
    }

    fn from_u8(raw: u8) -> Result<Self, WireError> {
        match raw {
            1 => Ok(SystemCommandKind::Run),
            2 => Ok(SystemCommandKind::Stop),
            3 => Ok(SystemCommandKind::Shutdown),
            4 => Ok(SystemCommandKind::Restart),
            5 => Ok(SystemCommandKind::AbortSimulation),
            other => Err(WireError::InvalidValue {
                field: "system_command.kind",
                value: u64::from(other),
            }),
        }
    }
}

/// A command addressed to the whole cluster or to a single participant.
///
/// An empty `target_participant` means broadcast semantics; lifecycles
/// ignore targeted commands addressed to someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemCommand {
    pub kind: SystemCommandKind,
    pub target_participant: String,
}

impl SystemCommand {
    pub fn broadcast(kind: SystemCommandKind) -> Self {
        Self {
            kind,
            target_participant: String::new(),
        }
    }

    pub fn targeted(kind: SystemCommandKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target_participant: target.into(),
        }
    }

    pub fn is_for(&self, participant_name: &str) -> bool {
        self.target_participant.is_empty() || self.target_participant == participant_name
    }
}

impl Encode for SystemCommand {
    fn encode(&self, w: &mut Writer) {
        w.put_u8(self.kind.to_u8());
        w.put_string(&self.target_participant);
    }
}

impl Decode for SystemCommand {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            kind: SystemCommandKind::from_u8(r.u8()?)?,
            target_participant: r.string()?,
        })
    }
}

impl TypedMessage for SystemCommand {
    fn type_name() -> &'static str {
        "SystemCommand"
    }
}

/// The set of participants whose states feed the system state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkflowConfiguration {
    pub required_participant_names: Vec<String>,
}

impl Encode for WorkflowConfiguration {
    fn encode(&self, w: &mut Writer) {
        encode_vec(&self.required_participant_names, w);
    }
}

impl Decode for WorkflowConfiguration {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            required_participant_names: decode_vec(r)?,
        })
    }
}

impl TypedMessage for WorkflowConfiguration {
    fn type_name() -> &'static str {
        "WorkflowConfiguration"
    }
}

/// Time-quantum proposal of the distributed virtual-time protocol.
///
/// After executing the step at `now - duration`, a participant proposes
/// `now` and may not execute it until every synchronized peer has proposed
/// a time ≥ `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextSimTask {
    /// Proposed next step time (virtual).
    pub now: Duration,
    /// The proposer's current step size.
    pub duration: Duration,
}

impl Encode for NextSimTask {
    fn encode(&self, w: &mut Writer) {
        w.put_duration(self.now);
        w.put_duration(self.duration);
    }
}

impl Decode for NextSimTask {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            now: r.duration()?,
            duration: r.duration()?,
        })
    }
}

impl TypedMessage for NextSimTask {
    fn type_name() -> &'static str {
        "NextSimTask"
    }
}
