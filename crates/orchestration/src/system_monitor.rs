//! Observer view of participant states and the derived system state.
//!
//! Thin wrapper around [`SystemStateTracker`] for tools and tests; the
//! lifecycle service carries its own tracker internally.

use crate::system_state::SystemStateTracker;
use parking_lot::Mutex;
use silbus_connection::core::INTERNAL_NETWORK;
use silbus_connection::{Connection, SubscriptionMode};
use silbus_messages::{ParticipantStatus, WorkflowConfiguration};
use silbus_types::{ParticipantState, SystemState};
use std::sync::Arc;

/// Called with every participant status update.
pub type ParticipantStatusHandler = Box<dyn Fn(&ParticipantStatus) + Send>;
/// Called whenever the derived system state changes.
pub type SystemStateHandler = Box<dyn Fn(SystemState) + Send>;

pub struct SystemMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    tracker: Mutex<SystemStateTracker>,
    status_handlers: Mutex<Vec<ParticipantStatusHandler>>,
    state_handlers: Mutex<Vec<SystemStateHandler>>,
}

impl SystemMonitor {
    pub fn new(connection: Arc<Connection>) -> Arc<Self> {
        let inner = Arc::new(MonitorInner {
            tracker: Mutex::new(SystemStateTracker::new()),
            status_handlers: Mutex::new(Vec::new()),
            state_handlers: Mutex::new(Vec::new()),
        });

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
                    for handler in on_status.status_handlers.lock().iter() {
                        handler(status);
                    }
                    if let Some(system_state) = changed {
                        for handler in on_status.state_handlers.lock().iter() {
                            handler(system_state);
                        }
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
                    let changed = on_workflow
                        .tracker
                        .lock()
                        .set_required_participants(workflow.required_participant_names.clone());
                    if let Some(system_state) = changed {
                        for handler in on_workflow.state_handlers.lock().iter() {
                            handler(system_state);
                        }
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
                for handler in on_peer_gone.state_handlers.lock().iter() {
                    handler(system_state);
                }
            }
        }));

        Arc::new(Self { inner })
    }

    pub fn system_state(&self) -> SystemState {
        self.inner.tracker.lock().system_state()
    }

    pub fn participant_state(&self, participant_name: &str) -> Option<ParticipantState> {
        self.inner.tracker.lock().participant_state(participant_name)
    }

    /// Handlers run on the I/O thread; keep them lightweight.
    pub fn add_participant_status_handler(&self, handler: ParticipantStatusHandler) {
        self.inner.status_handlers.lock().push(handler);
    }

    pub fn add_system_state_handler(&self, handler: SystemStateHandler) {
        self.inner.state_handlers.lock().push(handler);
    }
}
