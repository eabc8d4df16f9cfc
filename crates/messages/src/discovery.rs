//! Service discovery messages.

use crate::TypedMessage;
use silbus_types::ServiceDescriptor;
use silbus_wire::{decode_vec, encode_vec, Decode, Encode, Reader, WireError, Writer};

/// Full service-table dump sent to a freshly connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantDiscoveryEvent {
    pub participant_name: String,
    pub services: Vec<ServiceDescriptor>,
}

impl Encode for ParticipantDiscoveryEvent {
    fn encode(&self, w: &mut Writer) {
        w.put_string(&self.participant_name);
        encode_vec(&self.services, w);
    }
}

impl Decode for ParticipantDiscoveryEvent {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            participant_name: r.string()?,
            services: decode_vec(r)?,
        })
    }
}

impl TypedMessage for ParticipantDiscoveryEvent {
    fn type_name() -> &'static str {
        "ParticipantDiscoveryEvent"
    }
}

/// Incremental create/remove update for a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceDiscoveryEventType {
    Created,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDiscoveryEvent {
    pub event_type: ServiceDiscoveryEventType,
    pub service: ServiceDescriptor,
}

impl Encode for ServiceDiscoveryEvent {
    fn encode(&self, w: &mut Writer) {
        w.put_u8(match self.event_type {
            ServiceDiscoveryEventType::Created => 1,
            ServiceDiscoveryEventType::Removed => 2,
        });
        self.service.encode(w);
    }
}

impl Decode for ServiceDiscoveryEvent {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let event_type = match r.u8()? {
            1 => ServiceDiscoveryEventType::Created,
            2 => ServiceDiscoveryEventType::Removed,
            other => {
                return Err(WireError::InvalidValue {
                    field: "discovery.event_type",
                    value: u64::from(other),
                })
            }
        };
        Ok(Self {
            event_type,
            service: ServiceDescriptor::decode(r)?,
        })
    }
}

impl TypedMessage for ServiceDiscoveryEvent {
    fn type_name() -> &'static str {
        "ServiceDiscoveryEvent"
    }
}
