//! Service descriptors: the identity of a controller instance as seen by
//! discovery and routing.

use crate::label::MatchingLabel;
use crate::participant::{EndpointId, ParticipantId};
use silbus_wire::{
    decode_string_map, decode_vec, encode_string_map, encode_vec, Decode, Encode, Reader,
    WireError, Writer,
};
use std::collections::BTreeMap;
use std::fmt;

/// Fixed id of the registry participant.
pub const REGISTRY_PARTICIPANT_ID: ParticipantId = ParticipantId(0);

/// Which simulated network a controller sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NetworkType {
    Undefined,
    Can,
    Lin,
    Ethernet,
    FlexRay,
    /// Generic publish/subscribe data.
    Data,
    /// Remote procedure calls.
    Rpc,
    /// Internal middleware services (lifecycle, discovery, ...).
    Internal,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Undefined => "undefined",
            NetworkType::Can => "can",
            NetworkType::Lin => "lin",
            NetworkType::Ethernet => "ethernet",
            NetworkType::FlexRay => "flexray",
            NetworkType::Data => "data",
            NetworkType::Rpc => "rpc",
            NetworkType::Internal => "internal",
        }
    }

    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => NetworkType::Can,
            2 => NetworkType::Lin,
            3 => NetworkType::Ethernet,
            4 => NetworkType::FlexRay,
            5 => NetworkType::Data,
            6 => NetworkType::Rpc,
            7 => NetworkType::Internal,
            _ => NetworkType::Undefined,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            NetworkType::Undefined => 0,
            NetworkType::Can => 1,
            NetworkType::Lin => 2,
            NetworkType::Ethernet => 3,
            NetworkType::FlexRay => 4,
            NetworkType::Data => 5,
            NetworkType::Rpc => 6,
            NetworkType::Internal => 7,
        }
    }
}

/// What kind of service a descriptor identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ServiceType {
    Undefined,
    /// A bus controller (CAN, LIN, ...) owned by an external collaborator.
    Controller,
    DataPublisher,
    DataSubscriber,
    RpcClient,
    RpcServer,
    /// Internal middleware helper (time sync, lifecycle, request/reply, ...).
    Internal,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Undefined => "undefined",
            ServiceType::Controller => "controller",
            ServiceType::DataPublisher => "datapublisher",
            ServiceType::DataSubscriber => "datasubscriber",
            ServiceType::RpcClient => "rpcclient",
            ServiceType::RpcServer => "rpcserver",
            ServiceType::Internal => "internal",
        }
    }

    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ServiceType::Controller,
            2 => ServiceType::DataPublisher,
            3 => ServiceType::DataSubscriber,
            4 => ServiceType::RpcClient,
            5 => ServiceType::RpcServer,
            6 => ServiceType::Internal,
            _ => ServiceType::Undefined,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ServiceType::Undefined => 0,
            ServiceType::Controller => 1,
            ServiceType::DataPublisher => 2,
            ServiceType::DataSubscriber => 3,
            ServiceType::RpcClient => 4,
            ServiceType::RpcServer => 5,
            ServiceType::Internal => 6,
        }
    }
}

/// Well-known supplemental data keys.
pub mod supplemental_keys {
    /// Topic of a data publisher or subscriber.
    pub const DATA_TOPIC: &str = "dataTopic";
    /// Function name of an RPC client or server.
    pub const FUNCTION_NAME: &str = "functionName";
    /// Per-client RPC response network, so the server can answer directly.
    pub const RPC_CLIENT_UUID: &str = "rpcClientUuid";
    /// Present with value "1" on participants that synchronize virtual time.
    pub const TIME_SYNC_ACTIVE: &str = "timeSyncActive";
}

/// Identity of a controller instance.
///
/// Two descriptors denote the same service iff participant name and service
/// name agree. The supplemental map uses a `BTreeMap` so serialization is
/// deterministic.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ServiceDescriptor {
    pub participant_name: String,
    pub participant_id: ParticipantId,
    /// Logical grouping of endpoints on the same simulated bus (e.g. "LIN_1").
    pub network_name: String,
    pub network_type: NetworkType,
    /// Unique within the owning participant.
    pub service_name: String,
    pub service_id: EndpointId,
    pub service_type: ServiceType,
    pub labels: Vec<MatchingLabel>,
    pub supplemental_data: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(
        participant_name: impl Into<String>,
        participant_id: ParticipantId,
        network_name: impl Into<String>,
        network_type: NetworkType,
        service_name: impl Into<String>,
        service_id: EndpointId,
        service_type: ServiceType,
    ) -> Self {
        Self {
            participant_name: participant_name.into(),
            participant_id,
            network_name: network_name.into(),
            network_type,
            service_name: service_name.into(),
            service_id,
            service_type,
            labels: Vec::new(),
            supplemental_data: BTreeMap::new(),
        }
    }

    /// Key under which this descriptor is cached per participant.
    pub fn service_key(&self) -> String {
        self.service_name.clone()
    }

    /// Same-service equivalence: participant name + service name.
    pub fn is_same_service(&self, other: &ServiceDescriptor) -> bool {
        self.participant_name == other.participant_name && self.service_name == other.service_name
    }

    pub fn supplemental(&self, key: &str) -> Option<&str> {
        self.supplemental_data.get(key).map(String::as_str)
    }

    pub fn with_supplemental(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.supplemental_data.insert(key.into(), value.into());
        self
    }

    pub fn with_labels(mut self, labels: Vec<MatchingLabel>) -> Self {
        self.labels = labels;
        self
    }
}

impl Encode for ServiceDescriptor {
    fn encode(&self, w: &mut Writer) {
        w.put_string(&self.participant_name);
        w.put_u64(self.participant_id.0);
        w.put_string(&self.network_name);
        w.put_u8(self.network_type.to_u8());
        w.put_string(&self.service_name);
        w.put_u64(self.service_id.0);
        w.put_u8(self.service_type.to_u8());
        encode_vec(&self.labels, w);
        encode_string_map(&self.supplemental_data, w);
    }
}

impl Decode for ServiceDescriptor {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            participant_name: r.string()?,
            participant_id: ParticipantId(r.u64()?),
            network_name: r.string()?,
            network_type: NetworkType::from_u8(r.u8()?),
            service_name: r.string()?,
            service_id: EndpointId(r.u64()?),
            service_type: ServiceType::from_u8(r.u8()?),
            labels: decode_vec(r)?,
            supplemental_data: decode_string_map(r)?,
        })
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.participant_name, self.network_name, self.service_name
        )
    }
}
