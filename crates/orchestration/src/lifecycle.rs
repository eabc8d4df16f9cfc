//! The lifecycle service: drives the pure machine, publishes status,
//! invokes user callbacks, and controls virtual time.
//!
//! All events funnel through the connection executor, so user callbacks
//! observe one serialized stream. Public entry points validate against
//! the current state synchronously, then post the event.

use crate::lifecycle_machine::{
    HandlerKind, LifecycleEvent, LifecycleMachine, LifecycleOutput, TimeControl,
};
use crate::system_state::SystemStateTracker;
use crate::time_sync::TimeSyncService;
use crate::LifecycleError;
use parking_lot::Mutex;
use silbus_connection::core::INTERNAL_NETWORK;
use silbus_connection::{Connection, SubscriptionMode};
use silbus_messages::{ParticipantStatus, SystemCommand, WorkflowConfiguration};
use silbus_types::{LifecycleConfiguration, ParticipantState};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Parameterless user callback.
pub type LifecycleHandler = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct LifecycleHandlers {
    communication_ready: Option<LifecycleHandler>,
    starting: Option<LifecycleHandler>,
    stop: Option<LifecycleHandler>,
    shutdown: Option<LifecycleHandler>,
    abort: Option<LifecycleHandler>,
}

impl LifecycleHandlers {
    fn slot(&mut self, kind: HandlerKind) -> &mut Option<LifecycleHandler> {
        match kind {
            HandlerKind::CommunicationReady => &mut self.communication_ready,
            HandlerKind::Starting => &mut self.starting,
            HandlerKind::Stop => &mut self.stop,
            HandlerKind::Shutdown => &mut self.shutdown,
            HandlerKind::Abort => &mut self.abort,
        }
    }
}

/// Blocks on the lifecycle's final state.
pub struct LifecycleCompletion {
    receiver: std::sync::mpsc::Receiver<ParticipantState>,
}

impl LifecycleCompletion {
    /// Wait until the lifecycle reaches its final state.
    pub fn wait(&self) -> Result<ParticipantState, LifecycleError> {
        self.receiver
            .recv()
            .map_err(|_| LifecycleError::ServiceGone)
    }

    /// Wait with a timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<ParticipantState, LifecycleError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(state) => Ok(state),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Err(LifecycleError::Timeout),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                Err(LifecycleError::ServiceGone)
            }
        }
    }
}

pub struct LifecycleService {
    inner: Arc<LifecycleInner>,
}

struct LifecycleInner {
    connection: Arc<Connection>,
    machine: Mutex<LifecycleMachine>,
    handlers: Mutex<LifecycleHandlers>,
    tracker: Mutex<SystemStateTracker>,
    time_sync: Mutex<Option<Arc<TimeSyncService>>>,
    completion: Mutex<Option<std::sync::mpsc::SyncSender<ParticipantState>>>,
    started: AtomicBool,
}

impl LifecycleService {
    /// Create the lifecycle service and wire its subscriptions. One per
    /// participant; the facade enforces the singleton.
    pub fn new(connection: Arc<Connection>, config: LifecycleConfiguration) -> Arc<Self> {
        let inner = Arc::new(LifecycleInner {
            connection: Arc::clone(&connection),
            machine: Mutex::new(LifecycleMachine::new(config)),
            handlers: Mutex::new(LifecycleHandlers::default()),
            tracker: Mutex::new(SystemStateTracker::new()),
            time_sync: Mutex::new(None),
            completion: Mutex::new(None),
            started: AtomicBool::new(false),
        });

        connection.add_sender::<ParticipantStatus>(INTERNAL_NETWORK);
        // Our own status link retains the last transition so participants
        // joining later still learn where we are.
        connection
            .set_history_depth::<ParticipantStatus>(INTERNAL_NETWORK, 1)
            .ok();

        // Synchronous registration: block until every connected peer has
        // acknowledged these subscriptions, so no status, workflow, or
        // command published afterwards can be lost.
        let on_status = Arc::clone(&inner);
        connection
            .subscribe::<ParticipantStatus>(
                INTERNAL_NETWORK,
                SubscriptionMode::Sync,
                Box::new(move |_sender, status| {
                    let changed = on_status
                        .tracker
                        .lock()
                        .on_participant_state(&status.participant_name, status.state);
                    if let Some(system_state) = changed {
                        on_status.process(LifecycleEvent::SystemStateChanged(system_state));
                    }
                }),
            )
            .ok();

        let on_workflow = Arc::clone(&inner);
        connection
            .subscribe::<WorkflowConfiguration>(
                INTERNAL_NETWORK,
                SubscriptionMode::Sync,
                Box::new(move |_sender, workflow| {
                    debug!(required = ?workflow.required_participant_names, "workflow configuration");
                    let changed = on_workflow
                        .tracker
                        .lock()
                        .set_required_participants(workflow.required_participant_names.clone());
                    if let Some(system_state) = changed {
                        on_workflow.process(LifecycleEvent::SystemStateChanged(system_state));
                    }
                }),
            )
            .ok();

        let own_name = connection.participant_name().to_string();
        let on_command = Arc::clone(&inner);
        connection
            .subscribe::<SystemCommand>(
                INTERNAL_NETWORK,
                SubscriptionMode::Sync,
                Box::new(move |_sender, command| {
                    if command.is_for(&own_name) {
                        on_command.process(LifecycleEvent::Command(command.kind));
                    }
                }),
            )
            .ok();

        let on_peer_gone = Arc::clone(&inner);
        connection.on_peer_shutdown(Box::new(move |peer| {
            let changed = on_peer_gone
                .tracker
                .lock()
                .on_participant_gone(&peer.participant_name);
            if let Some(system_state) = changed {
                on_peer_gone.process(LifecycleEvent::SystemStateChanged(system_state));
            }
        }));

        Arc::new(Self { inner })
    }

    /// Begin the lifecycle. Returns a completion resolved with the final
    /// state once the participant reaches `Shutdown`.
    pub fn start_lifecycle(&self) -> Result<LifecycleCompletion, LifecycleError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(LifecycleError::AlreadyStarted);
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        *self.inner.completion.lock() = Some(tx);

        info!(participant = %self.inner.connection.participant_name(), "starting lifecycle");
        let inner = Arc::clone(&self.inner);
        self.inner.connection.post(move |_core| {
            inner.process(LifecycleEvent::Start);
            Vec::new()
        });
        Ok(LifecycleCompletion { receiver: rx })
    }

    pub fn state(&self) -> ParticipantState {
        self.inner.machine.lock().state()
    }

    /// Stop the running simulation on this participant.
    pub fn stop(&self, reason: &str) -> Result<(), LifecycleError> {
        let state = self.state();
        if !matches!(state, ParticipantState::Running | ParticipantState::Paused) {
            return Err(LifecycleError::InvalidState {
                operation: "stop",
                state,
            });
        }
        let reason = reason.to_string();
        let inner = Arc::clone(&self.inner);
        self.inner.connection.post(move |_core| {
            inner.process(LifecycleEvent::UserStop { reason });
            Vec::new()
        });
        Ok(())
    }

    /// Pause between simulation steps. A second pause without an
    /// intervening continue is an error.
    pub fn pause(&self, reason: &str) -> Result<(), LifecycleError> {
        let state = self.state();
        if state != ParticipantState::Running {
            return Err(LifecycleError::InvalidState {
                operation: "pause",
                state,
            });
        }
        let reason = reason.to_string();
        let inner = Arc::clone(&self.inner);
        self.inner.connection.post(move |_core| {
            inner.process(LifecycleEvent::UserPause { reason });
            Vec::new()
        });
        Ok(())
    }

    /// Resume after a pause.
    pub fn continue_simulation(&self) -> Result<(), LifecycleError> {
        let state = self.state();
        if state != ParticipantState::Paused {
            return Err(LifecycleError::InvalidState {
                operation: "continue",
                state,
            });
        }
        let inner = Arc::clone(&self.inner);
        self.inner.connection.post(move |_core| {
            inner.process(LifecycleEvent::UserContinue);
            Vec::new()
        });
        Ok(())
    }

    /// Report an unrecoverable application fault; drives to `Error`.
    pub fn report_error(&self, reason: &str) {
        let reason = reason.to_string();
        let inner = Arc::clone(&self.inner);
        self.inner.connection.post(move |_core| {
            inner.process(LifecycleEvent::Fault { reason });
            Vec::new()
        });
    }

    pub fn set_communication_ready_handler(&self, handler: LifecycleHandler) {
        self.inner.handlers.lock().communication_ready = Some(handler);
    }

    pub fn set_starting_handler(&self, handler: LifecycleHandler) {
        self.inner.handlers.lock().starting = Some(handler);
    }

    pub fn set_stop_handler(&self, handler: LifecycleHandler) {
        self.inner.handlers.lock().stop = Some(handler);
    }

    pub fn set_shutdown_handler(&self, handler: LifecycleHandler) {
        self.inner.handlers.lock().shutdown = Some(handler);
    }

    pub fn set_abort_handler(&self, handler: LifecycleHandler) {
        self.inner.handlers.lock().abort = Some(handler);
    }

    /// Attach the time sync service created for this participant; its
    /// clock follows the lifecycle from now on.
    pub fn attach_time_sync(&self, time_sync: Arc<TimeSyncService>) {
        let inner = Arc::downgrade(&self.inner);
        time_sync.set_fault_handler(Box::new(move |reason| {
            if let Some(inner) = inner.upgrade() {
                inner.process(LifecycleEvent::Fault { reason });
            }
        }));
        *self.inner.time_sync.lock() = Some(time_sync);
    }
}

impl LifecycleInner {
    /// Run one machine step and execute its outputs. Runs on the I/O
    /// thread; nested calls (handler completions) recurse through here.
    fn process(self: &Arc<Self>, event: LifecycleEvent) {
        let outputs = self.machine.lock().handle(event);
        for output in outputs {
            match output {
                LifecycleOutput::EnterState { state, reason } => {
                    self.publish_status(state, reason);
                }
                LifecycleOutput::InvokeHandler(kind) => {
                    self.run_handler(kind);
                }
                LifecycleOutput::StartCommunicationBarrier => {
                    let inner = Arc::clone(self);
                    self.connection.participant_replies(Box::new(move |_outcome| {
                        inner.process(LifecycleEvent::BarrierCompleted);
                    }));
                }
                LifecycleOutput::Time(control) => self.drive_time(control),
                LifecycleOutput::Completed { final_state } => {
                    if let Some(tx) = self.completion.lock().take() {
                        let _ = tx.send(final_state);
                    }
                }
            }
        }
    }

    fn publish_status(&self, state: ParticipantState, reason: String) {
        let enter_time_ns = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        self.connection.send(
            INTERNAL_NETWORK,
            ParticipantStatus {
                participant_name: self.connection.participant_name().to_string(),
                state,
                enter_reason: reason,
                enter_time_ns,
            },
        );
    }

    fn run_handler(self: &Arc<Self>, kind: HandlerKind) {
        let handler = self.handlers.lock().slot(kind).take();
        let panicked = if let Some(mut handler) = handler {
            let result = catch_unwind(AssertUnwindSafe(|| handler()));
            *self.handlers.lock().slot(kind) = Some(handler);
            if result.is_err() {
                warn!(?kind, "user handler panicked");
            }
            result.is_err()
        } else {
            false
        };
        self.process(LifecycleEvent::HandlerCompleted { kind, panicked });
    }

    fn drive_time(&self, control: TimeControl) {
        let time_sync = self.time_sync.lock().clone();
        let Some(time_sync) = time_sync else {
            return;
        };
        match control {
            TimeControl::Start => time_sync.start(),
            TimeControl::Stop => time_sync.stop(),
            TimeControl::Pause => time_sync.pause(),
            TimeControl::Continue => time_sync.continue_simulation(),
            TimeControl::Reset => time_sync.reset(),
        }
    }
}
