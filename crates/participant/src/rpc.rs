//! Remote procedure call controllers.
//!
//! Each client owns a private network named by a fresh UUID and announces
//! it in its descriptor. Servers discover matching clients and attach to
//! their networks; calls broadcast on the client network, responses are
//! targeted back at the calling participant. `user_context` never crosses
//! the wire; the client keeps it keyed by call UUID.

use crate::ParticipantError;
use parking_lot::Mutex;
use silbus_connection::{Connection, SubscriptionMode};
use silbus_discovery::ServiceDiscovery;
use silbus_messages::{
    FunctionCall, FunctionCallResponse, RpcCallStatus, ServiceDiscoveryEventType,
};
use silbus_orchestration::TimeProvider;
use silbus_types::{supplemental_keys, MatchingLabel, ServiceDescriptor, ServiceType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Function name plus matching labels, shared by clients and servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcSpec {
    pub function_name: String,
    pub labels: Vec<MatchingLabel>,
}

impl RpcSpec {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: MatchingLabel) -> Self {
        self.labels.push(label);
        self
    }
}

/// Outcome of one call, delivered to the client's result handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCallResult {
    pub status: RpcCallStatus,
    pub data: Vec<u8>,
    pub user_context: u64,
}

/// Handler for call results on the client side.
pub type RpcCallResultHandler = Arc<dyn Fn(&RpcCallResult) + Send + Sync>;

/// An incoming call on the server side.
#[derive(Debug, Clone)]
pub struct RpcCallEvent {
    pub call_uuid: Uuid,
    pub data: Vec<u8>,
}

/// Handler for incoming calls; answer via [`RpcServer::submit_result`].
pub type RpcCallHandler = Arc<dyn Fn(&RpcCallEvent) + Send + Sync>;

pub struct RpcClient {
    connection: Arc<Connection>,
    discovery: Arc<ServiceDiscovery>,
    descriptor: ServiceDescriptor,
    network: String,
    time_provider: TimeProvider,
    result_handler: RpcCallResultHandler,
    pending: Arc<Mutex<HashMap<Uuid, u64>>>,
    matched_servers: Arc<AtomicUsize>,
}

impl RpcClient {
    pub(crate) fn new(
        connection: Arc<Connection>,
        discovery: Arc<ServiceDiscovery>,
        descriptor: ServiceDescriptor,
        spec: &RpcSpec,
        result_handler: RpcCallResultHandler,
        time_provider: TimeProvider,
    ) -> Result<Self, ParticipantError> {
        let network = descriptor.network_name.clone();
        connection.add_sender::<FunctionCall>(&network);

        let pending: Arc<Mutex<HashMap<Uuid, u64>>> = Arc::new(Mutex::new(HashMap::new()));
        let on_response_pending = Arc::clone(&pending);
        let on_response_handler = Arc::clone(&result_handler);
        connection.subscribe::<FunctionCallResponse>(
            &network,
            SubscriptionMode::Sync,
            Box::new(move |_sender, response| {
                let Some(user_context) = on_response_pending.lock().remove(&response.call_uuid)
                else {
                    warn!(uuid = %response.call_uuid, "response for unknown call");
                    return;
                };
                on_response_handler(&RpcCallResult {
                    status: response.status,
                    data: response.data.clone(),
                    user_context,
                });
            }),
        )?;

        // Track reachable servers so calls without one fail fast.
        let matched_servers = Arc::new(AtomicUsize::new(0));
        let matched = Arc::clone(&matched_servers);
        discovery.register_specific_handler(
            ServiceType::RpcServer,
            &spec.function_name,
            &spec.labels,
            Arc::new(move |event_type, server| {
                debug!(server = %server, ?event_type, "matched rpc server");
                match event_type {
                    ServiceDiscoveryEventType::Created => {
                        matched.fetch_add(1, Ordering::SeqCst);
                    }
                    ServiceDiscoveryEventType::Removed => {
                        matched.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }),
        );

        discovery.notify_service_created(descriptor.clone());
        Ok(Self {
            connection,
            discovery,
            descriptor,
            network,
            time_provider,
            result_handler,
            pending,
            matched_servers,
        })
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Number of currently discovered matching servers.
    pub fn matched_server_count(&self) -> usize {
        self.matched_servers.load(Ordering::SeqCst)
    }

    /// Fire a call. The result handler receives one result per answering
    /// server, with `user_context` attached; with no reachable server it
    /// fires immediately with `ServerNotReachable`.
    pub fn call(&self, data: &[u8], user_context: u64) {
        if self.matched_server_count() == 0 {
            (self.result_handler)(&RpcCallResult {
                status: RpcCallStatus::ServerNotReachable,
                data: Vec::new(),
                user_context,
            });
            return;
        }
        let call_uuid = Uuid::new_v4();
        self.pending.lock().insert(call_uuid, user_context);
        self.connection.send(
            &self.network,
            FunctionCall {
                timestamp: self.time_provider.now(),
                call_uuid,
                data: data.to_vec(),
            },
        );
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.discovery.notify_service_removed(&self.descriptor);
    }
}

pub struct RpcServer {
    connection: Arc<Connection>,
    discovery: Arc<ServiceDiscovery>,
    descriptor: ServiceDescriptor,
    time_provider: TimeProvider,
    /// call uuid → (client network, calling participant).
    in_flight: Arc<Mutex<HashMap<Uuid, (String, String)>>>,
}

impl RpcServer {
    pub(crate) fn new(
        connection: Arc<Connection>,
        discovery: Arc<ServiceDiscovery>,
        descriptor: ServiceDescriptor,
        spec: &RpcSpec,
        call_handler: RpcCallHandler,
        time_provider: TimeProvider,
    ) -> Result<Self, ParticipantError> {
        let in_flight: Arc<Mutex<HashMap<Uuid, (String, String)>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Attach to each matching client's private network; calls carry
        // the sender so the response can be targeted back.
        let attach_connection = Arc::clone(&connection);
        let attach_in_flight = Arc::clone(&in_flight);
        discovery.register_specific_handler(
            ServiceType::RpcClient,
            &spec.function_name,
            &spec.labels,
            Arc::new(move |event_type, client| {
                if event_type != ServiceDiscoveryEventType::Created {
                    return;
                }
                let Some(client_network) =
                    client.supplemental(supplemental_keys::RPC_CLIENT_UUID)
                else {
                    warn!(client = %client, "rpc client without a network uuid");
                    return;
                };
                debug!(client = %client, "matched rpc client");
                attach_connection.add_sender::<FunctionCallResponse>(client_network);

                let network = client_network.to_string();
                let handler = Arc::clone(&call_handler);
                let in_flight = Arc::clone(&attach_in_flight);
                attach_connection
                    .subscribe::<FunctionCall>(
                        client_network,
                        SubscriptionMode::Async,
                        Box::new(move |sender, call| {
                            in_flight.lock().insert(
                                call.call_uuid,
                                (network.clone(), sender.to_string()),
                            );
                            handler(&RpcCallEvent {
                                call_uuid: call.call_uuid,
                                data: call.data.clone(),
                            });
                        }),
                    )
                    .ok();
            }),
        );

        discovery.notify_service_created(descriptor.clone());
        Ok(Self {
            connection,
            discovery,
            descriptor,
            time_provider,
            in_flight,
        })
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Answer a call received through the call handler.
    pub fn submit_result(&self, call_uuid: Uuid, data: &[u8]) {
        self.respond(call_uuid, RpcCallStatus::Success, data);
    }

    /// Report a failure for a received call.
    pub fn submit_error(&self, call_uuid: Uuid) {
        self.respond(call_uuid, RpcCallStatus::ServerInternalError, &[]);
    }

    fn respond(&self, call_uuid: Uuid, status: RpcCallStatus, data: &[u8]) {
        let Some((network, caller)) = self.in_flight.lock().remove(&call_uuid) else {
            warn!(uuid = %call_uuid, "result for unknown call");
            return;
        };
        self.connection.send_to(
            &network,
            &caller,
            FunctionCallResponse {
                timestamp: self.time_provider.now(),
                call_uuid,
                status,
                data: data.to_vec(),
            },
        );
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.discovery.notify_service_removed(&self.descriptor);
    }
}

/// Build the descriptor for a client or server.
pub(crate) fn rpc_descriptor(
    mut descriptor: ServiceDescriptor,
    spec: &RpcSpec,
) -> ServiceDescriptor {
    descriptor.supplemental_data.insert(
        supplemental_keys::FUNCTION_NAME.to_string(),
        spec.function_name.clone(),
    );
    descriptor.labels = spec.labels.clone();
    descriptor
}
