//! Cluster system-state derivation.
//!
//! Tracks the `ParticipantStatus` of every required participant and folds
//! the set into a single [`SystemState`]: any error forces `Error`, any
//! pause shows `Paused`, otherwise the cluster is at the minimum state its
//! required members have reached (total order along the normal
//! progression). Until every required participant has reported at least
//! once, the system state is `Invalid`.

use silbus_types::{ParticipantState, SystemState};
use std::collections::HashMap;
use tracing::trace;

/// Pure fold over required-participant states.
pub struct SystemStateTracker {
    required: Vec<String>,
    states: HashMap<String, ParticipantState>,
    system_state: SystemState,
}

impl Default for SystemStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemStateTracker {
    pub fn new() -> Self {
        Self {
            required: Vec::new(),
            states: HashMap::new(),
            system_state: SystemState::Invalid,
        }
    }

    /// Install the required-participant set (workflow configuration).
    /// Returns the new system state when it changed.
    pub fn set_required_participants(&mut self, required: Vec<String>) -> Option<SystemState> {
        self.required = required;
        self.refresh()
    }

    pub fn required_participants(&self) -> &[String] {
        &self.required
    }

    /// Fold in a status update. Returns the new system state when it
    /// changed.
    pub fn on_participant_state(
        &mut self,
        participant_name: &str,
        state: ParticipantState,
    ) -> Option<SystemState> {
        self.states.insert(participant_name.to_string(), state);
        self.refresh()
    }

    /// A participant vanished without reaching `Shutdown`.
    pub fn on_participant_gone(&mut self, participant_name: &str) -> Option<SystemState> {
        if let Some(state) = self.states.get_mut(participant_name) {
            // A vanished participant that was still running is an error
            // from the cluster's point of view.
            if *state != ParticipantState::Shutdown {
                *state = ParticipantState::Error;
            }
        }
        self.refresh()
    }

    pub fn system_state(&self) -> SystemState {
        self.system_state
    }

    pub fn participant_state(&self, participant_name: &str) -> Option<ParticipantState> {
        self.states.get(participant_name).copied()
    }

    fn refresh(&mut self) -> Option<SystemState> {
        let derived = self.derive();
        if derived != self.system_state {
            trace!(from = %self.system_state, to = %derived, "system state changed");
            self.system_state = derived;
            Some(derived)
        } else {
            None
        }
    }

    fn derive(&self) -> SystemState {
        if self.required.is_empty() {
            return SystemState::Invalid;
        }
        let mut min: Option<ParticipantState> = None;
        let mut any_paused = false;
        for name in &self.required {
            let Some(state) = self.states.get(name) else {
                return SystemState::Invalid;
            };
            match state {
                ParticipantState::Error => return SystemState::Error,
                ParticipantState::Aborting => return SystemState::Aborting,
                ParticipantState::Invalid => return SystemState::Invalid,
                ParticipantState::Paused => {
                    any_paused = true;
                    // Paused sits outside the progression; rank it as
                    // Running for the minimum.
                    min = Some(min.map_or(ParticipantState::Running, |m| {
                        m.min(ParticipantState::Running)
                    }));
                }
                state => {
                    min = Some(min.map_or(*state, |m| m.min(*state)));
                }
            }
        }
        let min = min.expect("required set is non-empty");
        if any_paused && min >= ParticipantState::Running {
            return SystemState::Paused;
        }
        match min {
            ParticipantState::ServicesCreated => SystemState::ServicesCreated,
            ParticipantState::CommunicationInitializing => SystemState::CommunicationInitializing,
            ParticipantState::CommunicationInitialized => SystemState::CommunicationInitialized,
            ParticipantState::ReadyToRun => SystemState::ReadyToRun,
            ParticipantState::Running => SystemState::Running,
            ParticipantState::Stopping => SystemState::Stopping,
            ParticipantState::Stopped => SystemState::Stopped,
            ParticipantState::ShuttingDown => SystemState::ShuttingDown,
            ParticipantState::Shutdown => SystemState::Shutdown,
            // Handled above.
            ParticipantState::Invalid
            | ParticipantState::Paused
            | ParticipantState::Error
            | ParticipantState::Aborting => SystemState::Invalid,
        }
    }
}
