//! Issues cluster-wide commands and the workflow configuration.

use silbus_connection::core::INTERNAL_NETWORK;
use silbus_connection::Connection;
use silbus_messages::{SystemCommand, SystemCommandKind, WorkflowConfiguration};
use std::sync::Arc;
use tracing::info;

pub struct SystemController {
    connection: Arc<Connection>,
}

impl SystemController {
    pub fn new(connection: Arc<Connection>) -> Self {
        connection.add_sender::<SystemCommand>(INTERNAL_NETWORK);
        connection.add_sender::<WorkflowConfiguration>(INTERNAL_NETWORK);
        // Late-joining participants must still learn the required set;
        // depth-1 history replays it on their subscription handshake.
        connection
            .set_history_depth::<WorkflowConfiguration>(INTERNAL_NETWORK, 1)
            .ok();
        Self { connection }
    }

    /// Declare the participants whose states define the system state.
    pub fn set_workflow_configuration(&self, required_participant_names: Vec<String>) {
        info!(required = ?required_participant_names, "workflow configuration");
        self.connection.send(
            INTERNAL_NETWORK,
            WorkflowConfiguration {
                required_participant_names,
            },
        );
    }

    /// Let all ready participants enter `Running`.
    pub fn run(&self) {
        self.broadcast(SystemCommandKind::Run);
    }

    /// Stop the simulation cluster-wide.
    pub fn stop(&self) {
        self.broadcast(SystemCommandKind::Stop);
    }

    /// Let stopped participants shut down.
    pub fn shutdown(&self) {
        self.broadcast(SystemCommandKind::Shutdown);
    }

    /// Emergency teardown; every participant aborts to `Shutdown`.
    pub fn abort_simulation(&self) {
        self.broadcast(SystemCommandKind::AbortSimulation);
    }

    /// Restart a single participant out of `Stopped` or `Error`.
    pub fn restart(&self, participant_name: &str) {
        info!(target = participant_name, "restart command");
        self.connection.send(
            INTERNAL_NETWORK,
            SystemCommand::targeted(SystemCommandKind::Restart, participant_name),
        );
    }

    fn broadcast(&self, kind: SystemCommandKind) {
        info!(command = ?kind, "system command");
        self.connection
            .send(INTERNAL_NETWORK, SystemCommand::broadcast(kind));
    }
}
