//! Duplex channel messages.
//!
//! These travel over the persistent channel each connected peer keeps
//! with the coordinator. JSON (text frames) is the canonical form;
//! MessagePack (binary frames) is accepted as a compact alternative.
//! Payload bytes are base64 in JSON and raw bytes in MessagePack.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::{AssignmentId, ContentId, PeerId, RequestId, WireError};

/// A half-open byte range `[start, end)` within a content object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte (inclusive).
    pub start: u64,
    /// Last byte (exclusive).
    pub end: u64,
}

impl ByteRange {
    /// Create a range, rejecting empty or inverted ones.
    pub fn new(start: u64, end: u64) -> Result<Self, WireError> {
        if start < end {
            Ok(Self { start, end })
        } else {
            Err(WireError::InvalidRange { start, end })
        }
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Always false for a validated range.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All messages exchanged over a peer's duplex channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Coordinator asks the source peer to deliver content.
    Deliver {
        /// Correlation id echoed in the answer.
        request_id: RequestId,
        /// Content to deliver.
        content_id: ContentId,
        /// Optional byte range; whole object when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<ByteRange>,
    },
    /// Source peer answers a `Deliver`.
    Delivered {
        /// Correlation id from the `Deliver`.
        request_id: RequestId,
        /// Content bytes.
        #[serde(with = "payload_serde")]
        payload: Vec<u8>,
        /// Size of the whole object, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_size: Option<u64>,
    },
    /// Source peer cannot deliver.
    DeliverFailed {
        /// Correlation id from the `Deliver`.
        request_id: RequestId,
        /// Human-readable reason.
        reason: String,
    },
    /// Coordinator hands a relay job to a relay-capable peer.
    HostRelay {
        /// Identifier of this hand-off.
        assignment_id: AssignmentId,
        /// Content to relay.
        content_id: ContentId,
        /// Peer holding the content.
        from: PeerId,
        /// Peer that wants it.
        to: PeerId,
        /// Optional byte range.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<ByteRange>,
    },
    /// Relay-capable peer reports a hand-off finished.
    HostRelayDone {
        /// Identifier from `HostRelay`.
        assignment_id: AssignmentId,
    },
    /// Keepalive probe.
    Ping,
    /// Keepalive answer.
    Pong,
}

impl ChannelMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec_named(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }

    /// Serialize to JSON text.
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON text.
    pub fn from_json(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Correlation id of a JSON frame that did not decode as a message,
    /// if one can still be read from it.
    pub fn peek_request_id_json(text: &str) -> Option<RequestId> {
        serde_json::from_str::<Correlation>(text).ok()?.request_id
    }

    /// Correlation id of a MessagePack frame that did not decode as a
    /// message, if one can still be read from it.
    pub fn peek_request_id_bytes(bytes: &[u8]) -> Option<RequestId> {
        rmp_serde::from_slice::<Correlation>(bytes).ok()?.request_id
    }

    /// Correlation id if this message answers a `Deliver`.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Deliver { request_id, .. }
            | Self::Delivered { request_id, .. }
            | Self::DeliverFailed { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

/// The one field worth recovering from a broken frame.
#[derive(Deserialize)]
struct Correlation {
    #[serde(default)]
    request_id: Option<RequestId>,
}

/// Encode payload bytes as text-safe base64.
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 payload.
pub fn decode_payload(text: &str) -> Result<Vec<u8>, WireError> {
    Ok(STANDARD.decode(text)?)
}

mod payload_serde {
    use super::{decode_payload, encode_payload};
    use serde::{de::Error, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&encode_payload(bytes))
        } else {
            s.serialize_bytes(bytes)
        }
    }

    /// Accepts base64 text or raw bytes regardless of the format's
    /// human-readable flag, which internally tagged enums do not forward.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        struct PayloadVisitor;

        impl<'de> serde::de::Visitor<'de> for PayloadVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("base64 text or a byte buffer")
            }

            fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
                decode_payload(v).map_err(E::custom)
            }

            fn visit_bytes<E: Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        d.deserialize_any(PayloadVisitor)
    }
}
