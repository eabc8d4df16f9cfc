//! The participant facade.
//!
//! A [`Participant`] owns one connection to the simulation: it joins the
//! registry, wires up service discovery, and creates controllers (data
//! publishers/subscribers, RPC clients/servers) and the orchestration
//! services (lifecycle, time sync, system monitor/controller).
//!
//! ```no_run
//! use silbus_participant::{Participant, ParticipantConfig, PubSubSpec};
//!
//! let participant = Participant::connect(
//!     ParticipantConfig::default(),
//!     "EcuSim",
//!     "silkit://localhost:8500",
//! )?;
//! let publisher =
//!     participant.create_data_publisher("TempPub", &PubSubSpec::new("Temperature"), 0)?;
//! publisher.publish(&[21, 5]);
//! # Ok::<(), silbus_participant::ParticipantError>(())
//! ```

pub mod logging;
pub mod pubsub;
pub mod rpc;

pub use pubsub::{DataMessageHandler, DataPublisher, DataSubscriber, PubSubSpec};
pub use rpc::{
    RpcCallEvent, RpcCallHandler, RpcCallResult, RpcCallResultHandler, RpcClient, RpcServer,
    RpcSpec,
};
pub use silbus_messages::RpcCallStatus;
pub use silbus_orchestration::{
    LifecycleService, SystemController, SystemMonitor, TimeProvider, TimeSyncService,
};
pub use silbus_types::{
    LifecycleConfiguration, MatchingLabel, OperationMode, ParticipantConfig, ParticipantState,
    SystemState,
};

use parking_lot::Mutex;
use silbus_connection::{Connection, ConnectionConfig, ConnectionError};
use silbus_discovery::ServiceDiscovery;
use silbus_types::{
    hash_participant_name, supplemental_keys, EndpointId, NetworkType, ServiceDescriptor,
    ServiceType,
};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Errors surfaced by participant entry points.
#[derive(Debug, Error)]
pub enum ParticipantError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Lifecycle(#[from] silbus_orchestration::LifecycleError),
}

struct ParticipantServices {
    next_endpoint_id: u64,
    service_names: HashSet<String>,
    lifecycle: Option<Arc<LifecycleService>>,
    time_sync: Option<Arc<TimeSyncService>>,
}

/// A process's membership in the simulation.
///
/// Dropping the participant leaves the simulation: links close, peers
/// observe the disconnect, and their discovery planes synthesize the
/// removal of every service this participant announced.
pub struct Participant {
    connection: Arc<Connection>,
    discovery: Arc<ServiceDiscovery>,
    config: ParticipantConfig,
    time_provider: TimeProvider,
    services: Mutex<ParticipantServices>,
}

impl Participant {
    /// Join the simulation: set up logging, open the connection, join the
    /// registry, and link up with every known peer.
    pub fn connect(
        config: ParticipantConfig,
        participant_name: &str,
        registry_uri: &str,
    ) -> Result<Self, ParticipantError> {
        logging::init(&config.logging);

        let name = config.effective_name(participant_name).to_string();
        let uri = config.effective_registry_uri(registry_uri).to_string();

        let connection = Arc::new(Connection::new(&name, ConnectionConfig::default())?);
        let discovery = ServiceDiscovery::attach(Arc::clone(&connection));
        connection.join_registry(&uri)?;
        info!(participant = %name, registry = %uri, "joined simulation");

        Ok(Self {
            connection,
            discovery,
            config,
            time_provider: TimeProvider::new(),
            services: Mutex::new(ParticipantServices {
                next_endpoint_id: 1,
                service_names: HashSet::new(),
                lifecycle: None,
                time_sync: None,
            }),
        })
    }

    pub fn participant_name(&self) -> &str {
        self.connection.participant_name()
    }

    /// The time source used for message timestamps: synchronized virtual
    /// time once a time sync service exists, otherwise no time.
    pub fn time_provider(&self) -> TimeProvider {
        self.time_provider.clone()
    }

    /// Access to the discovery plane (handler registration for tests and
    /// tooling).
    pub fn service_discovery(&self) -> &Arc<ServiceDiscovery> {
        &self.discovery
    }

    // ─── Controllers ───

    /// Create a data publisher. `history` 0 or 1; with 1, the most recent
    /// message is replayed to subscribers that match later.
    ///
    /// A `dataPublishers` configuration block with this controller's name
    /// overrides the topic.
    pub fn create_data_publisher(
        &self,
        name: &str,
        spec: &PubSubSpec,
        history: usize,
    ) -> Result<DataPublisher, ParticipantError> {
        let spec = &self.apply_topic_override(&self.config.data_publishers, name, spec);
        let descriptor = pubsub::pubsub_descriptor(
            self.new_descriptor(
                name,
                &unique_network(),
                NetworkType::Data,
                ServiceType::DataPublisher,
            )?,
            spec,
        );
        info!(service = %descriptor, topic = %spec.topic, "created data publisher");
        DataPublisher::new(
            Arc::clone(&self.connection),
            Arc::clone(&self.discovery),
            descriptor,
            self.time_provider.clone(),
            history,
        )
    }

    /// Create a data subscriber; `handler` fires for every message from a
    /// matching publisher.
    pub fn create_data_subscriber(
        &self,
        name: &str,
        spec: &PubSubSpec,
        handler: DataMessageHandler,
    ) -> Result<DataSubscriber, ParticipantError> {
        let spec = &self.apply_topic_override(&self.config.data_subscribers, name, spec);
        let descriptor = pubsub::pubsub_descriptor(
            self.new_descriptor(name, "default", NetworkType::Data, ServiceType::DataSubscriber)?,
            spec,
        );
        info!(service = %descriptor, topic = %spec.topic, "created data subscriber");
        DataSubscriber::new(
            Arc::clone(&self.connection),
            Arc::clone(&self.discovery),
            descriptor,
            spec,
            handler,
        )
    }

    /// Create an RPC client for `spec.function_name`.
    pub fn create_rpc_client(
        &self,
        name: &str,
        spec: &RpcSpec,
        result_handler: RpcCallResultHandler,
    ) -> Result<RpcClient, ParticipantError> {
        let spec = &self.apply_function_override(&self.config.rpc_clients, name, spec);
        let network = unique_network();
        let descriptor = rpc::rpc_descriptor(
            self.new_descriptor(name, &network, NetworkType::Rpc, ServiceType::RpcClient)?,
            spec,
        )
        .with_supplemental(supplemental_keys::RPC_CLIENT_UUID, network.clone());
        info!(service = %descriptor, function = %spec.function_name, "created rpc client");
        RpcClient::new(
            Arc::clone(&self.connection),
            Arc::clone(&self.discovery),
            descriptor,
            spec,
            result_handler,
            self.time_provider.clone(),
        )
    }

    /// Create an RPC server for `spec.function_name`.
    pub fn create_rpc_server(
        &self,
        name: &str,
        spec: &RpcSpec,
        call_handler: RpcCallHandler,
    ) -> Result<RpcServer, ParticipantError> {
        let spec = &self.apply_function_override(&self.config.rpc_servers, name, spec);
        let descriptor = rpc::rpc_descriptor(
            self.new_descriptor(name, "default", NetworkType::Rpc, ServiceType::RpcServer)?,
            spec,
        );
        info!(service = %descriptor, function = %spec.function_name, "created rpc server");
        RpcServer::new(
            Arc::clone(&self.connection),
            Arc::clone(&self.discovery),
            descriptor,
            spec,
            call_handler,
            self.time_provider.clone(),
        )
    }

    // ─── Orchestration services ───

    /// Create the lifecycle service. At most one per participant.
    pub fn create_lifecycle_service(
        &self,
        lifecycle_config: LifecycleConfiguration,
    ) -> Result<Arc<LifecycleService>, ParticipantError> {
        let mut services = self.services.lock();
        if services.lifecycle.is_some() {
            return Err(ParticipantError::Configuration(
                "a lifecycle service was already created".to_string(),
            ));
        }
        let lifecycle = LifecycleService::new(Arc::clone(&self.connection), lifecycle_config);
        services.lifecycle = Some(Arc::clone(&lifecycle));
        Ok(lifecycle)
    }

    /// Create the time sync service on an existing lifecycle. At most one
    /// per participant; its descriptor marks this participant as
    /// synchronizing virtual time.
    pub fn create_time_sync_service(
        &self,
        lifecycle: &LifecycleService,
    ) -> Result<Arc<TimeSyncService>, ParticipantError> {
        {
            let services = self.services.lock();
            if services.time_sync.is_some() {
                return Err(ParticipantError::Configuration(
                    "a time sync service was already created".to_string(),
                ));
            }
        }
        let descriptor = self
            .new_descriptor(
                "TimeSyncService",
                "internal",
                NetworkType::Internal,
                ServiceType::Internal,
            )?
            .with_supplemental(supplemental_keys::TIME_SYNC_ACTIVE, "1");

        let time_sync = TimeSyncService::new(
            Arc::clone(&self.connection),
            &self.discovery,
            self.time_provider.clone(),
            self.config.health_check.clone(),
        );
        lifecycle.attach_time_sync(Arc::clone(&time_sync));
        self.discovery.notify_service_created(descriptor);

        self.services.lock().time_sync = Some(Arc::clone(&time_sync));
        Ok(time_sync)
    }

    /// Create a system monitor (observer of participant states).
    pub fn create_system_monitor(&self) -> Arc<SystemMonitor> {
        SystemMonitor::new(Arc::clone(&self.connection))
    }

    /// Create a system controller (issues cluster commands).
    pub fn create_system_controller(&self) -> SystemController {
        SystemController::new(Arc::clone(&self.connection))
    }

    // ─── Internals ───

    fn apply_topic_override(
        &self,
        blocks: &[silbus_types::config::DataOrRpcConfig],
        controller_name: &str,
        spec: &PubSubSpec,
    ) -> PubSubSpec {
        let mut spec = spec.clone();
        if let Some(block) = blocks.iter().find(|b| b.name == controller_name) {
            if let Some(topic) = &block.topic {
                info!(controller = controller_name, topic, "configured topic override");
                spec.topic = topic.clone();
            }
        }
        spec
    }

    fn apply_function_override(
        &self,
        blocks: &[silbus_types::config::DataOrRpcConfig],
        controller_name: &str,
        spec: &RpcSpec,
    ) -> RpcSpec {
        let mut spec = spec.clone();
        if let Some(block) = blocks.iter().find(|b| b.name == controller_name) {
            if let Some(function_name) = &block.function_name {
                info!(
                    controller = controller_name,
                    function_name, "configured function override"
                );
                spec.function_name = function_name.clone();
            }
        }
        spec
    }

    fn new_descriptor(
        &self,
        service_name: &str,
        network_name: &str,
        network_type: NetworkType,
        service_type: ServiceType,
    ) -> Result<ServiceDescriptor, ParticipantError> {
        let mut services = self.services.lock();
        if !services.service_names.insert(service_name.to_string()) {
            return Err(ParticipantError::Configuration(format!(
                "duplicate controller name: {service_name}"
            )));
        }
        let endpoint_id = EndpointId(services.next_endpoint_id);
        services.next_endpoint_id += 1;

        Ok(ServiceDescriptor::new(
            self.connection.participant_name(),
            self.connection.participant_id(),
            network_name,
            network_type,
            service_name,
            endpoint_id,
            service_type,
        ))
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        // Break the connection-core ↔ service callback cycle explicitly;
        // peers observe the disconnect and cascade removals.
        self.connection.notify_shutdown();
    }
}

/// Fresh per-instance network name for publisher/client private links.
fn unique_network() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A participant without a registry; the connection itself works
    /// standalone for table-level tests.
    fn standalone(name: &str) -> Participant {
        let connection =
            Arc::new(Connection::new(name, ConnectionConfig::default()).expect("bind loopback"));
        Participant {
            discovery: ServiceDiscovery::attach(Arc::clone(&connection)),
            connection,
            config: ParticipantConfig::default(),
            time_provider: TimeProvider::new(),
            services: Mutex::new(ParticipantServices {
                next_endpoint_id: 1,
                service_names: HashSet::new(),
                lifecycle: None,
                time_sync: None,
            }),
        }
    }

    #[test]
    fn test_duplicate_controller_name_is_a_configuration_error() {
        let participant = standalone("Solo");
        participant
            .new_descriptor("Ctrl", "net", NetworkType::Data, ServiceType::DataPublisher)
            .unwrap();
        let err = participant
            .new_descriptor("Ctrl", "net", NetworkType::Data, ServiceType::DataPublisher)
            .unwrap_err();
        assert!(matches!(err, ParticipantError::Configuration(_)));
    }

    #[test]
    fn test_endpoint_ids_are_monotonic() {
        let participant = standalone("Mono");
        let a = participant
            .new_descriptor("A", "net", NetworkType::Data, ServiceType::DataPublisher)
            .unwrap();
        let b = participant
            .new_descriptor("B", "net", NetworkType::Data, ServiceType::DataPublisher)
            .unwrap();
        assert!(b.service_id > a.service_id);
    }

    #[test]
    fn test_configured_topic_override_wins() {
        let mut participant = standalone("Configured");
        participant.config.data_publishers = vec![silbus_types::config::DataOrRpcConfig {
            name: "Pub".to_string(),
            topic: Some("ConfiguredTopic".to_string()),
            function_name: None,
        }];

        let publisher = participant
            .create_data_publisher("Pub", &PubSubSpec::new("CodeTopic"), 0)
            .unwrap();
        assert_eq!(
            publisher
                .descriptor()
                .supplemental(silbus_types::supplemental_keys::DATA_TOPIC),
            Some("ConfiguredTopic")
        );
    }

    #[test]
    fn test_descriptor_carries_identity() {
        let participant = standalone("Ident");
        let d = participant
            .new_descriptor("Ctrl", "net", NetworkType::Data, ServiceType::DataPublisher)
            .unwrap();
        assert_eq!(d.participant_name, "Ident");
        assert_eq!(d.participant_id, hash_participant_name("Ident"));
        assert_eq!(d.service_name, "Ctrl");
    }
}
