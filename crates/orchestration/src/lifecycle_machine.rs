//! The per-participant lifecycle state machine.
//!
//! Pure and synchronous: events in, outputs out, no I/O and no callbacks.
//! The [`LifecycleService`](crate::lifecycle::LifecycleService) drives it
//! and executes the outputs (publishing status, invoking user handlers,
//! running the communication barrier, controlling virtual time).

use silbus_messages::SystemCommandKind;
use silbus_types::{LifecycleConfiguration, OperationMode, ParticipantState, SystemState};
use tracing::{debug, warn};

/// User callback slots, in invocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    CommunicationReady,
    Starting,
    Stop,
    Shutdown,
    Abort,
}

/// Events fed into the machine.
#[derive(Debug)]
pub enum LifecycleEvent {
    /// `start_lifecycle` was called.
    Start,
    /// The (monitor-derived) system state changed.
    SystemStateChanged(SystemState),
    /// A system command addressed to this participant arrived.
    Command(SystemCommandKind),
    /// A user handler returned (or panicked).
    HandlerCompleted { kind: HandlerKind, panicked: bool },
    /// The communication-guarantee barrier completed.
    BarrierCompleted,
    /// User called `stop`.
    UserStop { reason: String },
    /// User called `pause` / `continue`.
    UserPause { reason: String },
    UserContinue,
    /// Something reported an unrecoverable fault.
    Fault { reason: String },
}

/// Virtual-time control emitted alongside state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeControl {
    Start,
    Stop,
    Pause,
    Continue,
    Reset,
}

/// What the service must do after an event.
#[derive(Debug, PartialEq, Eq)]
pub enum LifecycleOutput {
    /// Publish the new state (as a `ParticipantStatus`).
    EnterState {
        state: ParticipantState,
        reason: String,
    },
    /// Invoke the user callback; completion is fed back as
    /// [`LifecycleEvent::HandlerCompleted`].
    InvokeHandler(HandlerKind),
    /// Run the cluster-wide `ParticipantReplies` barrier; completion is
    /// fed back as [`LifecycleEvent::BarrierCompleted`].
    StartCommunicationBarrier,
    /// Drive the time sync service.
    Time(TimeControl),
    /// The lifecycle reached its final state; resolve the start future.
    Completed { final_state: ParticipantState },
}

/// See the transition table in the service docs; everything not listed
/// either keeps the current state or degrades to `Error`.
pub struct LifecycleMachine {
    config: LifecycleConfiguration,
    state: ParticipantState,
    system_state: SystemState,
    started: bool,
}

impl LifecycleMachine {
    pub fn new(config: LifecycleConfiguration) -> Self {
        Self {
            config,
            state: ParticipantState::Invalid,
            system_state: SystemState::Invalid,
            started: false,
        }
    }

    pub fn state(&self) -> ParticipantState {
        self.state
    }

    fn coordinated(&self) -> bool {
        self.config.operation_mode == OperationMode::Coordinated
    }

    pub fn handle(&mut self, event: LifecycleEvent) -> Vec<LifecycleOutput> {
        match event {
            LifecycleEvent::Start => self.on_start(),
            LifecycleEvent::SystemStateChanged(system_state) => self.on_system_state(system_state),
            LifecycleEvent::Command(kind) => self.on_command(kind),
            LifecycleEvent::HandlerCompleted { kind, panicked } => {
                self.on_handler_completed(kind, panicked)
            }
            LifecycleEvent::BarrierCompleted => self.on_barrier_completed(),
            LifecycleEvent::UserStop { reason } => self.on_stop(reason),
            LifecycleEvent::UserPause { reason } => {
                self.enter(ParticipantState::Paused, reason)
                    .into_iter()
                    .chain([LifecycleOutput::Time(TimeControl::Pause)])
                    .collect()
            }
            LifecycleEvent::UserContinue => self
                .enter(ParticipantState::Running, "continuing".to_string())
                .into_iter()
                .chain([LifecycleOutput::Time(TimeControl::Continue)])
                .collect(),
            LifecycleEvent::Fault { reason } => self.fail(reason),
        }
    }

    fn on_start(&mut self) -> Vec<LifecycleOutput> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        let mut outputs =
            self.enter(ParticipantState::ServicesCreated, "lifecycle started".to_string());
        if !self.coordinated() {
            outputs.extend(self.begin_communication_initialization());
        } else if self.system_state >= SystemState::ServicesCreated
            && self.system_state < SystemState::Stopping
        {
            // The cluster may already be past ServicesCreated when a late
            // participant starts; catch up immediately.
            outputs.extend(self.begin_communication_initialization());
        }
        outputs
    }

    fn begin_communication_initialization(&mut self) -> Vec<LifecycleOutput> {
        let mut outputs = self.enter(
            ParticipantState::CommunicationInitializing,
            "waiting for communication guarantees".to_string(),
        );
        // Coordinated participants normally wait for the cluster to reach
        // CommunicationInitializing; when it already has (late start), the
        // barrier runs right away.
        if !self.coordinated() || self.system_state >= SystemState::CommunicationInitializing {
            outputs.push(LifecycleOutput::StartCommunicationBarrier);
        }
        outputs
    }

    fn on_system_state(&mut self, system_state: SystemState) -> Vec<LifecycleOutput> {
        self.system_state = system_state;
        if !self.coordinated() || !self.started {
            return Vec::new();
        }
        match (self.state, system_state) {
            (ParticipantState::ServicesCreated, SystemState::ServicesCreated) => {
                self.begin_communication_initialization()
            }
            (ParticipantState::CommunicationInitializing, SystemState::CommunicationInitializing) => {
                vec![LifecycleOutput::StartCommunicationBarrier]
            }
            _ => Vec::new(),
        }
    }

    fn on_barrier_completed(&mut self) -> Vec<LifecycleOutput> {
        if self.state != ParticipantState::CommunicationInitializing {
            return Vec::new();
        }
        let mut outputs = self.enter(
            ParticipantState::CommunicationInitialized,
            "communication guaranteed".to_string(),
        );
        outputs.push(LifecycleOutput::InvokeHandler(HandlerKind::CommunicationReady));
        outputs
    }

    fn on_command(&mut self, kind: SystemCommandKind) -> Vec<LifecycleOutput> {
        if !self.started {
            // Commands may race a coordinated start; they are reissued via
            // system state, so ignore rather than fault.
            debug!(?kind, "command before lifecycle start, ignoring");
            return Vec::new();
        }
        match kind {
            SystemCommandKind::Run => match self.state {
                ParticipantState::ReadyToRun => {
                    vec![LifecycleOutput::InvokeHandler(HandlerKind::Starting)]
                }
                ParticipantState::Running | ParticipantState::Paused => Vec::new(),
                _ => self.invalid_command(kind),
            },
            SystemCommandKind::Stop => match self.state {
                ParticipantState::Running | ParticipantState::Paused => {
                    self.on_stop("stop command".to_string())
                }
                // Idempotent while already on the way down.
                ParticipantState::Stopping
                | ParticipantState::Stopped
                | ParticipantState::ShuttingDown
                | ParticipantState::Shutdown => Vec::new(),
                _ => self.invalid_command(kind),
            },
            SystemCommandKind::Shutdown => match self.state {
                ParticipantState::Stopped | ParticipantState::Error => self.begin_shutdown(),
                ParticipantState::ShuttingDown | ParticipantState::Shutdown => Vec::new(),
                _ => self.invalid_command(kind),
            },
            SystemCommandKind::Restart => match self.state {
                ParticipantState::Stopped | ParticipantState::Error => {
                    self.started = true;
                    let mut outputs = vec![LifecycleOutput::Time(TimeControl::Reset)];
                    outputs.extend(
                        self.enter(ParticipantState::ServicesCreated, "restarting".to_string()),
                    );
                    if !self.coordinated() {
                        outputs.extend(self.begin_communication_initialization());
                    }
                    outputs
                }
                _ => self.invalid_command(kind),
            },
            SystemCommandKind::AbortSimulation => match self.state {
                ParticipantState::Shutdown => Vec::new(),
                _ => {
                    let mut outputs = vec![LifecycleOutput::Time(TimeControl::Stop)];
                    outputs.extend(
                        self.enter(ParticipantState::Aborting, "abort requested".to_string()),
                    );
                    // Callbacks still fire on the abort path.
                    outputs.push(LifecycleOutput::InvokeHandler(HandlerKind::Abort));
                    outputs
                }
            },
        }
    }

    fn on_stop(&mut self, reason: String) -> Vec<LifecycleOutput> {
        let mut outputs = vec![LifecycleOutput::Time(TimeControl::Stop)];
        outputs.extend(self.enter(ParticipantState::Stopping, reason));
        outputs.push(LifecycleOutput::InvokeHandler(HandlerKind::Stop));
        outputs
    }

    fn on_handler_completed(&mut self, kind: HandlerKind, panicked: bool) -> Vec<LifecycleOutput> {
        if panicked && kind != HandlerKind::Shutdown {
            return self.fail(format!("{kind:?} handler panicked"));
        }
        match kind {
            HandlerKind::CommunicationReady => {
                let mut outputs = self.enter(
                    ParticipantState::ReadyToRun,
                    "communication ready handler returned".to_string(),
                );
                if !self.coordinated() {
                    outputs.push(LifecycleOutput::InvokeHandler(HandlerKind::Starting));
                }
                outputs
            }
            HandlerKind::Starting => {
                let mut outputs = self.enter(
                    ParticipantState::Running,
                    "starting handler returned".to_string(),
                );
                outputs.push(LifecycleOutput::Time(TimeControl::Start));
                outputs
            }
            HandlerKind::Stop => {
                if self.state != ParticipantState::Stopping {
                    // An abort overtook the stop; the abort path owns the
                    // rest of the teardown.
                    return Vec::new();
                }
                let mut outputs = self.enter(
                    ParticipantState::Stopped,
                    "stop handler returned".to_string(),
                );
                if !self.coordinated() {
                    outputs.extend(self.begin_shutdown());
                }
                outputs
            }
            HandlerKind::Abort => self.begin_shutdown(),
            HandlerKind::Shutdown => {
                if panicked {
                    // Shutdown is best-effort: log and complete anyway.
                    warn!("shutdown handler panicked; completing shutdown");
                }
                let mut outputs = self.enter(
                    ParticipantState::Shutdown,
                    "shutdown handler returned".to_string(),
                );
                outputs.push(LifecycleOutput::Completed {
                    final_state: ParticipantState::Shutdown,
                });
                outputs
            }
        }
    }

    fn begin_shutdown(&mut self) -> Vec<LifecycleOutput> {
        let mut outputs =
            self.enter(ParticipantState::ShuttingDown, "shutting down".to_string());
        outputs.push(LifecycleOutput::InvokeHandler(HandlerKind::Shutdown));
        outputs
    }

    fn invalid_command(&mut self, kind: SystemCommandKind) -> Vec<LifecycleOutput> {
        self.fail(format!("command {kind:?} is invalid in state {}", self.state))
    }

    fn fail(&mut self, reason: String) -> Vec<LifecycleOutput> {
        warn!(state = %self.state, reason, "lifecycle fault");
        let mut outputs = vec![LifecycleOutput::Time(TimeControl::Stop)];
        outputs.extend(self.enter(ParticipantState::Error, reason));
        outputs
    }

    fn enter(&mut self, state: ParticipantState, reason: String) -> Vec<LifecycleOutput> {
        debug!(from = %self.state, to = %state, reason, "state transition");
        self.state = state;
        vec![LifecycleOutput::EnterState { state, reason }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinated() -> LifecycleMachine {
        LifecycleMachine::new(LifecycleConfiguration::coordinated())
    }

    fn autonomous() -> LifecycleMachine {
        LifecycleMachine::new(LifecycleConfiguration::autonomous())
    }

    fn states(outputs: &[LifecycleOutput]) -> Vec<ParticipantState> {
        outputs
            .iter()
            .filter_map(|o| match o {
                LifecycleOutput::EnterState { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn handler_done(machine: &mut LifecycleMachine, kind: HandlerKind) -> Vec<LifecycleOutput> {
        machine.handle(LifecycleEvent::HandlerCompleted {
            kind,
            panicked: false,
        })
    }

    /// Drive a coordinated machine to `Running` through the normal path.
    fn run_coordinated_to_running(machine: &mut LifecycleMachine) {
        machine.handle(LifecycleEvent::Start);
        machine.handle(LifecycleEvent::SystemStateChanged(SystemState::ServicesCreated));
        machine.handle(LifecycleEvent::SystemStateChanged(
            SystemState::CommunicationInitializing,
        ));
        machine.handle(LifecycleEvent::BarrierCompleted);
        handler_done(machine, HandlerKind::CommunicationReady);
        machine.handle(LifecycleEvent::Command(SystemCommandKind::Run));
        handler_done(machine, HandlerKind::Starting);
        assert_eq!(machine.state(), ParticipantState::Running);
    }

    #[test]
    fn test_coordinated_full_run_emits_spec_state_sequence() {
        let mut machine = coordinated();
        let mut sequence = Vec::new();

        sequence.extend(states(&machine.handle(LifecycleEvent::Start)));
        sequence.extend(states(&machine.handle(LifecycleEvent::SystemStateChanged(
            SystemState::ServicesCreated,
        ))));
        sequence.extend(states(&machine.handle(LifecycleEvent::SystemStateChanged(
            SystemState::CommunicationInitializing,
        ))));
        sequence.extend(states(&machine.handle(LifecycleEvent::BarrierCompleted)));
        sequence.extend(states(&handler_done(&mut machine, HandlerKind::CommunicationReady)));
        sequence.extend(states(&machine.handle(LifecycleEvent::Command(
            SystemCommandKind::Run,
        ))));
        sequence.extend(states(&handler_done(&mut machine, HandlerKind::Starting)));
        sequence.extend(states(&machine.handle(LifecycleEvent::Command(
            SystemCommandKind::Stop,
        ))));
        sequence.extend(states(&handler_done(&mut machine, HandlerKind::Stop)));
        sequence.extend(states(&machine.handle(LifecycleEvent::Command(
            SystemCommandKind::Shutdown,
        ))));
        sequence.extend(states(&handler_done(&mut machine, HandlerKind::Shutdown)));

        assert_eq!(
            sequence,
            vec![
                ParticipantState::ServicesCreated,
                ParticipantState::CommunicationInitializing,
                ParticipantState::CommunicationInitialized,
                ParticipantState::ReadyToRun,
                ParticipantState::Running,
                ParticipantState::Stopping,
                ParticipantState::Stopped,
                ParticipantState::ShuttingDown,
                ParticipantState::Shutdown,
            ]
        );
    }

    #[test]
    fn test_coordinated_waits_for_run_command() {
        let mut machine = coordinated();
        machine.handle(LifecycleEvent::Start);
        machine.handle(LifecycleEvent::SystemStateChanged(SystemState::ServicesCreated));
        machine.handle(LifecycleEvent::SystemStateChanged(
            SystemState::CommunicationInitializing,
        ));
        machine.handle(LifecycleEvent::BarrierCompleted);
        handler_done(&mut machine, HandlerKind::CommunicationReady);

        // Even with the whole cluster ReadyToRun, no Running without the
        // Run command.
        machine.handle(LifecycleEvent::SystemStateChanged(SystemState::ReadyToRun));
        assert_eq!(machine.state(), ParticipantState::ReadyToRun);
    }

    #[test]
    fn test_autonomous_runs_without_commands() {
        let mut machine = autonomous();
        machine.handle(LifecycleEvent::Start);
        machine.handle(LifecycleEvent::BarrierCompleted);
        handler_done(&mut machine, HandlerKind::CommunicationReady);
        handler_done(&mut machine, HandlerKind::Starting);
        assert_eq!(machine.state(), ParticipantState::Running);

        machine.handle(LifecycleEvent::UserStop {
            reason: "done".to_string(),
        });
        handler_done(&mut machine, HandlerKind::Stop);
        // Autonomous shutdown needs no command.
        assert_eq!(machine.state(), ParticipantState::ShuttingDown);
        let outputs = handler_done(&mut machine, HandlerKind::Shutdown);
        assert_eq!(machine.state(), ParticipantState::Shutdown);
        assert!(outputs.iter().any(|o| matches!(
            o,
            LifecycleOutput::Completed {
                final_state: ParticipantState::Shutdown
            }
        )));
    }

    #[test]
    fn test_pause_and_continue() {
        let mut machine = coordinated();
        run_coordinated_to_running(&mut machine);

        let outputs = machine.handle(LifecycleEvent::UserPause {
            reason: "breakpoint".to_string(),
        });
        assert_eq!(machine.state(), ParticipantState::Paused);
        assert!(outputs.contains(&LifecycleOutput::Time(TimeControl::Pause)));

        let outputs = machine.handle(LifecycleEvent::UserContinue);
        assert_eq!(machine.state(), ParticipantState::Running);
        assert!(outputs.contains(&LifecycleOutput::Time(TimeControl::Continue)));
    }

    #[test]
    fn test_abort_during_stop_handler_still_runs_shutdown_handler() {
        let mut machine = coordinated();
        run_coordinated_to_running(&mut machine);

        machine.handle(LifecycleEvent::Command(SystemCommandKind::Stop));
        assert_eq!(machine.state(), ParticipantState::Stopping);

        // Abort lands while the stop handler is executing; the machine
        // processes it first because the handler completion is still queued.
        let outputs = machine.handle(LifecycleEvent::Command(SystemCommandKind::AbortSimulation));
        assert_eq!(machine.state(), ParticipantState::Aborting);
        assert!(outputs.contains(&LifecycleOutput::InvokeHandler(HandlerKind::Abort)));

        // The stop handler's completion is ignored on the abort path.
        handler_done(&mut machine, HandlerKind::Stop);
        assert_eq!(machine.state(), ParticipantState::Aborting);

        handler_done(&mut machine, HandlerKind::Abort);
        assert_eq!(machine.state(), ParticipantState::ShuttingDown);
        handler_done(&mut machine, HandlerKind::Shutdown);
        assert_eq!(machine.state(), ParticipantState::Shutdown);
    }

    #[test]
    fn test_handler_panic_drives_to_error() {
        let mut machine = coordinated();
        run_coordinated_to_running(&mut machine);

        machine.handle(LifecycleEvent::Command(SystemCommandKind::Stop));
        let outputs = machine.handle(LifecycleEvent::HandlerCompleted {
            kind: HandlerKind::Stop,
            panicked: true,
        });
        assert_eq!(machine.state(), ParticipantState::Error);
        assert!(outputs.contains(&LifecycleOutput::Time(TimeControl::Stop)));
    }

    #[test]
    fn test_shutdown_handler_panic_is_swallowed() {
        let mut machine = autonomous();
        machine.handle(LifecycleEvent::Start);
        machine.handle(LifecycleEvent::BarrierCompleted);
        handler_done(&mut machine, HandlerKind::CommunicationReady);
        handler_done(&mut machine, HandlerKind::Starting);
        machine.handle(LifecycleEvent::UserStop {
            reason: "done".to_string(),
        });
        handler_done(&mut machine, HandlerKind::Stop);

        let outputs = machine.handle(LifecycleEvent::HandlerCompleted {
            kind: HandlerKind::Shutdown,
            panicked: true,
        });
        assert_eq!(machine.state(), ParticipantState::Shutdown);
        assert!(outputs.iter().any(|o| matches!(o, LifecycleOutput::Completed { .. })));
    }

    #[test]
    fn test_invalid_command_drives_to_error() {
        let mut machine = coordinated();
        machine.handle(LifecycleEvent::Start);
        // Run is not valid in ServicesCreated.
        machine.handle(LifecycleEvent::Command(SystemCommandKind::Run));
        assert_eq!(machine.state(), ParticipantState::Error);
    }

    #[test]
    fn test_restart_from_error_begins_fresh_cycle() {
        let mut machine = coordinated();
        machine.handle(LifecycleEvent::Start);
        machine.handle(LifecycleEvent::Command(SystemCommandKind::Run));
        assert_eq!(machine.state(), ParticipantState::Error);

        let outputs = machine.handle(LifecycleEvent::Command(SystemCommandKind::Restart));
        assert_eq!(machine.state(), ParticipantState::ServicesCreated);
        assert!(outputs.contains(&LifecycleOutput::Time(TimeControl::Reset)));
    }

    #[test]
    fn test_shutdown_from_error_runs_callbacks() {
        let mut machine = coordinated();
        machine.handle(LifecycleEvent::Start);
        machine.handle(LifecycleEvent::Command(SystemCommandKind::Run));
        assert_eq!(machine.state(), ParticipantState::Error);

        let outputs = machine.handle(LifecycleEvent::Command(SystemCommandKind::Shutdown));
        assert!(outputs.contains(&LifecycleOutput::InvokeHandler(HandlerKind::Shutdown)));
        handler_done(&mut machine, HandlerKind::Shutdown);
        assert_eq!(machine.state(), ParticipantState::Shutdown);
    }

    #[test]
    fn test_repeated_stop_commands_are_idempotent() {
        let mut machine = coordinated();
        run_coordinated_to_running(&mut machine);

        machine.handle(LifecycleEvent::Command(SystemCommandKind::Stop));
        let outputs = machine.handle(LifecycleEvent::Command(SystemCommandKind::Stop));
        assert!(outputs.is_empty());
        assert_eq!(machine.state(), ParticipantState::Stopping);
    }

    #[test]
    fn test_abort_after_shutdown_is_ignored() {
        let mut machine = autonomous();
        machine.handle(LifecycleEvent::Start);
        machine.handle(LifecycleEvent::BarrierCompleted);
        handler_done(&mut machine, HandlerKind::CommunicationReady);
        handler_done(&mut machine, HandlerKind::Starting);
        machine.handle(LifecycleEvent::UserStop {
            reason: "done".to_string(),
        });
        handler_done(&mut machine, HandlerKind::Stop);
        handler_done(&mut machine, HandlerKind::Shutdown);
        assert_eq!(machine.state(), ParticipantState::Shutdown);

        let outputs = machine.handle(LifecycleEvent::Command(SystemCommandKind::AbortSimulation));
        assert!(outputs.is_empty());
        assert_eq!(machine.state(), ParticipantState::Shutdown);
    }
}
