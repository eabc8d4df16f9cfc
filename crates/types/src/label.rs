//! Matching labels for pub/sub and RPC discovery filters.

use silbus_wire::{Decode, Encode, Reader, WireError, Writer};

/// How a label participates in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LabelKind {
    /// If the key is present on the other side, the values must match.
    Optional,
    /// The key must be present on the other side with a matching value.
    Mandatory,
}

/// A key/value label attached to a publisher, subscriber, client, or server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MatchingLabel {
    pub key: String,
    pub value: String,
    pub kind: LabelKind,
}

impl MatchingLabel {
    pub fn optional(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            kind: LabelKind::Optional,
        }
    }

    pub fn mandatory(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            kind: LabelKind::Mandatory,
        }
    }
}

impl Encode for MatchingLabel {
    fn encode(&self, w: &mut Writer) {
        w.put_string(&self.key);
        w.put_string(&self.value);
        w.put_u8(match self.kind {
            LabelKind::Optional => 1,
            LabelKind::Mandatory => 2,
        });
    }
}

impl Decode for MatchingLabel {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let key = r.string()?;
        let value = r.string()?;
        let kind = match r.u8()? {
            1 => LabelKind::Optional,
            2 => LabelKind::Mandatory,
            other => {
                return Err(WireError::InvalidValue {
                    field: "label.kind",
                    value: u64::from(other),
                })
            }
        };
        Ok(Self { key, value, kind })
    }
}

/// Symmetric label-set matching.
///
/// Each side's mandatory labels must be present on the other side with equal
/// value; optional labels only constrain when the other side carries the key.
pub fn labels_match(lhs: &[MatchingLabel], rhs: &[MatchingLabel]) -> bool {
    half_matches(lhs, rhs) && half_matches(rhs, lhs)
}

fn half_matches(own: &[MatchingLabel], other: &[MatchingLabel]) -> bool {
    own.iter().all(|label| {
        match other.iter().find(|o| o.key == label.key) {
            Some(found) => found.value == label.value,
            None => label.kind == LabelKind::Optional,
        }
    })
}
