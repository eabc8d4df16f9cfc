//! Generic publish/subscribe data messages.

use crate::TypedMessage;
use silbus_wire::{Decode, Encode, Reader, WireError, Writer};
use std::time::Duration;

/// An opaque published payload.
///
/// Topic routing happens through the network name of the subscription key;
/// the payload layout is the collaborating application's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessageEvent {
    /// Virtual send time, as reported by the publisher's time provider.
    pub timestamp: Duration,
    pub data: Vec<u8>,
}

impl Encode for DataMessageEvent {
    fn encode(&self, w: &mut Writer) {
        w.put_duration(self.timestamp);
        w.put_bytes(&self.data);
    }
}

impl Decode for DataMessageEvent {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            timestamp: r.duration()?,
            data: r.bytes()?,
        })
    }
}

impl TypedMessage for DataMessageEvent {
    fn type_name() -> &'static str {
        "DataMessageEvent"
    }
}
