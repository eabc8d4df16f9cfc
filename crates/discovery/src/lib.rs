//! Service discovery.
//!
//! Every controller a participant creates is announced to all peers as a
//! [`ServiceDiscoveryEvent`]; a freshly connected peer receives the full
//! table as a [`ParticipantDiscoveryEvent`] dump. Locally, the discovery
//! keeps a per-participant cache and two handler registries:
//!
//! - **generic** handlers fire for every create/remove;
//! - **specific** handlers are keyed on (service type, topic/function name)
//!   and filtered through matching labels.
//!
//! When a peer disconnects, a `Removed` event is synthesized for each of
//! its cached descriptors, so every `Created` a handler observed yields
//! exactly one `Removed`.
//!
//! Registration replays cached entries immediately, in deterministic
//! `(participant name, service name)` order.

use parking_lot::Mutex;
use silbus_connection::core::INTERNAL_NETWORK;
use silbus_connection::{Connection, SubscriptionMode};
use silbus_messages::{
    ParticipantDiscoveryEvent, ServiceDiscoveryEvent, ServiceDiscoveryEventType, TypedMessage,
};
use silbus_types::{labels_match, supplemental_keys, MatchingLabel, ServiceDescriptor, ServiceType};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Handler invoked for discovery events. Runs on the I/O thread for live
/// events and on the registering thread for the cached replay.
pub type DiscoveryHandler = Arc<dyn Fn(ServiceDiscoveryEventType, &ServiceDescriptor) + Send + Sync>;

/// Token for removing a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct SpecificFilter {
    service_type: ServiceType,
    lookup_name: String,
    labels: Vec<MatchingLabel>,
}

impl SpecificFilter {
    fn matches(&self, descriptor: &ServiceDescriptor) -> bool {
        if descriptor.service_type != self.service_type {
            return false;
        }
        let lookup_key = match descriptor.service_type {
            ServiceType::RpcClient | ServiceType::RpcServer => supplemental_keys::FUNCTION_NAME,
            _ => supplemental_keys::DATA_TOPIC,
        };
        if descriptor.supplemental(lookup_key) != Some(self.lookup_name.as_str()) {
            return false;
        }
        labels_match(&self.labels, &descriptor.labels)
    }
}

struct RegisteredHandler {
    id: HandlerId,
    filter: Option<SpecificFilter>,
    handler: DiscoveryHandler,
}

#[derive(Default)]
struct DiscoveryState {
    /// participant name → service name → descriptor. `BTreeMap` on both
    /// levels keeps the replay order deterministic.
    cache: BTreeMap<String, BTreeMap<String, ServiceDescriptor>>,
    /// This participant's own announced services (the dump source).
    local_services: BTreeMap<String, ServiceDescriptor>,
    handlers: Vec<RegisteredHandler>,
    next_handler_id: u64,
}

/// The discovery plane of one participant.
pub struct ServiceDiscovery {
    connection: Arc<Connection>,
    state: Mutex<DiscoveryState>,
}

impl ServiceDiscovery {
    /// Wire the discovery into a connection: subscribe to the discovery
    /// message types, dump the table to peers as they subscribe, and
    /// cascade removals on peer shutdown.
    pub fn attach(connection: Arc<Connection>) -> Arc<Self> {
        let discovery = Arc::new(Self {
            connection: Arc::clone(&connection),
            state: Mutex::new(DiscoveryState::default()),
        });

        let on_event = Arc::clone(&discovery);
        connection
            .subscribe::<ServiceDiscoveryEvent>(
                INTERNAL_NETWORK,
                SubscriptionMode::Async,
                Box::new(move |_sender, event| {
                    on_event.apply_event(event.event_type, &event.service);
                }),
            )
            .ok();

        let on_dump = Arc::clone(&discovery);
        connection
            .subscribe::<ParticipantDiscoveryEvent>(
                INTERNAL_NETWORK,
                SubscriptionMode::Async,
                Box::new(move |_sender, dump| {
                    trace!(
                        participant = %dump.participant_name,
                        services = dump.services.len(),
                        "received discovery dump"
                    );
                    for service in &dump.services {
                        on_dump.apply_event(ServiceDiscoveryEventType::Created, service);
                    }
                }),
            )
            .ok();

        // Dump our table to a new peer the moment it can receive it.
        let on_subscription = Arc::clone(&discovery);
        connection.on_remote_subscription(Box::new(move |peer, record| {
            if record.network_name == INTERNAL_NETWORK
                && record.type_name == ParticipantDiscoveryEvent::type_name()
            {
                on_subscription.send_dump_to(&peer.participant_name);
            }
        }));

        let on_shutdown = Arc::clone(&discovery);
        connection.on_peer_shutdown(Box::new(move |peer| {
            on_shutdown.on_participant_gone(&peer.participant_name);
        }));

        discovery
    }

    /// Announce a locally created service to all peers (and to local
    /// handlers, through the loopback delivery).
    pub fn notify_service_created(&self, descriptor: ServiceDescriptor) {
        debug!(service = %descriptor, "service created");
        self.state
            .lock()
            .local_services
            .insert(descriptor.service_name.clone(), descriptor.clone());
        self.connection.send(
            INTERNAL_NETWORK,
            ServiceDiscoveryEvent {
                event_type: ServiceDiscoveryEventType::Created,
                service: descriptor,
            },
        );
    }

    /// Announce an explicit removal of a locally created service.
    pub fn notify_service_removed(&self, descriptor: &ServiceDescriptor) {
        debug!(service = %descriptor, "service removed");
        self.state
            .lock()
            .local_services
            .remove(&descriptor.service_name);
        self.connection.send(
            INTERNAL_NETWORK,
            ServiceDiscoveryEvent {
                event_type: ServiceDiscoveryEventType::Removed,
                service: descriptor.clone(),
            },
        );
    }

    /// Register a handler for every create/remove event. Cached services
    /// are replayed as `Created` before the call returns.
    pub fn register_handler(&self, handler: DiscoveryHandler) -> HandlerId {
        self.register(None, handler)
    }

    /// Register a handler filtered on (service type, topic/function name)
    /// plus matching labels.
    pub fn register_specific_handler(
        &self,
        service_type: ServiceType,
        lookup_name: &str,
        labels: &[MatchingLabel],
        handler: DiscoveryHandler,
    ) -> HandlerId {
        self.register(
            Some(SpecificFilter {
                service_type,
                lookup_name: lookup_name.to_string(),
                labels: labels.to_vec(),
            }),
            handler,
        )
    }

    /// Drop a handler. Unknown ids are ignored.
    pub fn remove_handler(&self, id: HandlerId) {
        self.state.lock().handlers.retain(|h| h.id != id);
    }

    /// All cached descriptors in deterministic order.
    pub fn cached_services(&self) -> Vec<ServiceDescriptor> {
        self.state
            .lock()
            .cache
            .values()
            .flat_map(|services| services.values().cloned())
            .collect()
    }

    // ─── Internals ───

    fn register(&self, filter: Option<SpecificFilter>, handler: DiscoveryHandler) -> HandlerId {
        let replay: Vec<ServiceDescriptor>;
        let id;
        {
            let mut state = self.state.lock();
            id = HandlerId(state.next_handler_id);
            state.next_handler_id += 1;

            replay = state
                .cache
                .values()
                .flat_map(|services| services.values())
                .filter(|d| filter.as_ref().map(|f| f.matches(d)).unwrap_or(true))
                .cloned()
                .collect();

            state.handlers.push(RegisteredHandler {
                id,
                filter,
                handler: Arc::clone(&handler),
            });
        }
        // Replay outside the lock so the handler may re-enter the registry.
        for descriptor in &replay {
            handler(ServiceDiscoveryEventType::Created, descriptor);
        }
        id
    }

    fn apply_event(&self, event_type: ServiceDiscoveryEventType, descriptor: &ServiceDescriptor) {
        let to_fire: Vec<DiscoveryHandler>;
        {
            let mut state = self.state.lock();
            let participant = state
                .cache
                .entry(descriptor.participant_name.clone())
                .or_default();
            let changed = match event_type {
                ServiceDiscoveryEventType::Created => participant
                    .insert(descriptor.service_name.clone(), descriptor.clone())
                    .is_none(),
                ServiceDiscoveryEventType::Removed => {
                    participant.remove(&descriptor.service_name).is_some()
                }
            };
            if !changed {
                // Duplicate dump entry or removal of something never seen;
                // handlers observe each descriptor exactly once per edge.
                return;
            }
            to_fire = state
                .handlers
                .iter()
                .filter(|h| h.filter.as_ref().map(|f| f.matches(descriptor)).unwrap_or(true))
                .map(|h| Arc::clone(&h.handler))
                .collect();
        }
        for handler in to_fire {
            handler(event_type, descriptor);
        }
    }

    fn send_dump_to(&self, participant_name: &str) {
        let services: Vec<ServiceDescriptor> =
            self.state.lock().local_services.values().cloned().collect();
        trace!(
            to = participant_name,
            services = services.len(),
            "sending discovery dump"
        );
        self.connection.send_to(
            INTERNAL_NETWORK,
            participant_name,
            ParticipantDiscoveryEvent {
                participant_name: self.connection.participant_name().to_string(),
                services,
            },
        );
    }

    fn on_participant_gone(&self, participant_name: &str) {
        let removed: Vec<ServiceDescriptor>;
        let to_fire: Vec<(DiscoveryHandler, Vec<usize>)>;
        {
            let mut state = self.state.lock();
            let Some(services) = state.cache.remove(participant_name) else {
                return;
            };
            removed = services.into_values().collect();
            to_fire = state
                .handlers
                .iter()
                .map(|h| {
                    let matching = removed
                        .iter()
                        .enumerate()
                        .filter(|(_, d)| {
                            h.filter.as_ref().map(|f| f.matches(d)).unwrap_or(true)
                        })
                        .map(|(i, _)| i)
                        .collect();
                    (Arc::clone(&h.handler), matching)
                })
                .collect();
        }
        if removed.is_empty() {
            return;
        }
        warn!(
            participant = participant_name,
            services = removed.len(),
            "participant gone, removing its services"
        );
        for (handler, indices) in to_fire {
            for i in indices {
                handler(ServiceDiscoveryEventType::Removed, &removed[i]);
            }
        }
    }
}
