//! Generic publish/subscribe controllers.
//!
//! Every publisher owns a private network named by a fresh UUID; its
//! descriptor advertises the topic and labels. Subscribers watch discovery
//! for matching publishers and attach a receiver to each publisher's
//! network as it appears. Late subscribers to a publisher with history 1
//! receive the retained message on the subscription handshake.

use crate::ParticipantError;
use silbus_connection::{Connection, SubscriptionMode};
use silbus_discovery::ServiceDiscovery;
use silbus_messages::{DataMessageEvent, ServiceDiscoveryEventType};
use silbus_orchestration::TimeProvider;
use silbus_types::{supplemental_keys, MatchingLabel, ServiceDescriptor, ServiceType};
use std::sync::Arc;
use tracing::debug;

/// Topic plus matching labels, shared by publishers and subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubSpec {
    pub topic: String,
    pub labels: Vec<MatchingLabel>,
}

impl PubSubSpec {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: MatchingLabel) -> Self {
        self.labels.push(label);
        self
    }
}

/// Handler for received data messages.
pub type DataMessageHandler = Arc<dyn Fn(&DataMessageEvent) + Send + Sync>;

/// Publishing side of a topic.
pub struct DataPublisher {
    connection: Arc<Connection>,
    discovery: Arc<ServiceDiscovery>,
    descriptor: ServiceDescriptor,
    network: String,
    time_provider: TimeProvider,
}

impl DataPublisher {
    pub(crate) fn new(
        connection: Arc<Connection>,
        discovery: Arc<ServiceDiscovery>,
        descriptor: ServiceDescriptor,
        time_provider: TimeProvider,
        history: usize,
    ) -> Result<Self, ParticipantError> {
        let network = descriptor.network_name.clone();
        connection.add_sender::<DataMessageEvent>(&network);
        connection.set_history_depth::<DataMessageEvent>(&network, history)?;
        discovery.notify_service_created(descriptor.clone());
        Ok(Self {
            connection,
            discovery,
            descriptor,
            network,
            time_provider,
        })
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Publish one payload to every matched subscriber.
    pub fn publish(&self, data: &[u8]) {
        self.connection.send(
            &self.network,
            DataMessageEvent {
                timestamp: self.time_provider.now(),
                data: data.to_vec(),
            },
        );
    }
}

impl Drop for DataPublisher {
    fn drop(&mut self) {
        self.discovery.notify_service_removed(&self.descriptor);
    }
}

/// Subscribing side of a topic.
pub struct DataSubscriber {
    descriptor: ServiceDescriptor,
    discovery: Arc<ServiceDiscovery>,
    handler_id: silbus_discovery::HandlerId,
}

impl DataSubscriber {
    pub(crate) fn new(
        connection: Arc<Connection>,
        discovery: Arc<ServiceDiscovery>,
        descriptor: ServiceDescriptor,
        spec: &PubSubSpec,
        handler: DataMessageHandler,
    ) -> Result<Self, ParticipantError> {
        // Attach to each matching publisher's private network as it is
        // discovered. Runs on the I/O thread, so the subscription must be
        // asynchronous; history replay covers the handshake race for
        // retained topics.
        let attach_connection = Arc::clone(&connection);
        let handler_id = discovery.register_specific_handler(
            ServiceType::DataPublisher,
            &spec.topic,
            &spec.labels,
            Arc::new(move |event_type, publisher| {
                if event_type != ServiceDiscoveryEventType::Created {
                    return;
                }
                debug!(publisher = %publisher, "matched publisher");
                let handler = Arc::clone(&handler);
                attach_connection
                    .subscribe::<DataMessageEvent>(
                        &publisher.network_name,
                        SubscriptionMode::Async,
                        Box::new(move |_sender, event| handler(event)),
                    )
                    .ok();
            }),
        );

        discovery.notify_service_created(descriptor.clone());
        Ok(Self {
            descriptor,
            discovery,
            handler_id,
        })
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }
}

impl Drop for DataSubscriber {
    fn drop(&mut self) {
        self.discovery.remove_handler(self.handler_id);
        self.discovery.notify_service_removed(&self.descriptor);
    }
}

/// Build the descriptor for a publisher or subscriber.
pub(crate) fn pubsub_descriptor(
    mut descriptor: ServiceDescriptor,
    spec: &PubSubSpec,
) -> ServiceDescriptor {
    descriptor
        .supplemental_data
        .insert(supplemental_keys::DATA_TOPIC.to_string(), spec.topic.clone());
    descriptor.labels = spec.labels.clone();
    descriptor
}
