//! Identifier types for peerhub.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::WireError;

/// Maximum length of a peer or content identifier in characters.
pub const MAX_ID_LEN: usize = 128;

/// An opaque, unique identifier a peer chooses for itself.
///
/// 1-128 characters of `[A-Za-z0-9._:-]`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Create a PeerId, validating its character set and length.
    pub fn new(id: impl Into<String>) -> Result<Self, WireError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.chars().count() <= MAX_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
        if valid {
            Ok(Self(id))
        } else {
            Err(WireError::InvalidId(format!("peer id {id:?}")))
        }
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl FromStr for PeerId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Identifier of a content object (archive, store, blob) a peer serves.
///
/// The coordinator never interprets it; it only has to be non-empty,
/// at most 256 characters, and free of whitespace and control characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    /// Create a ContentId.
    pub fn new(id: impl Into<String>) -> Result<Self, WireError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.chars().count() <= 2 * MAX_ID_LEN
            && !id.chars().any(|c| c.is_whitespace() || c.is_control());
        if valid {
            Ok(Self(id))
        } else {
            Err(WireError::InvalidId(format!("content id {id:?}")))
        }
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContentId {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new random identifier (UUID v4).
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $name {
            type Err = WireError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| WireError::InvalidId(format!("{}: {e}", stringify!($name))))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an admitted relay session.
    SessionId
);

uuid_id!(
    /// Correlation identifier of a coordinator-mediated relay request.
    RequestId
);

uuid_id!(
    /// Identifier of a hand-off to a peer-hosted relay.
    AssignmentId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_accepts_typical_ids() {
        assert!(PeerId::new("peer-a").is_ok());
        assert!(PeerId::new("node_01.eu:west").is_ok());
        assert!(PeerId::new("x".repeat(MAX_ID_LEN)).is_ok());
    }

    #[test]
    fn peer_id_rejects_bad_ids() {
        assert!(PeerId::new("").is_err());
        assert!(PeerId::new("has space").is_err());
        assert!(PeerId::new("slash/y").is_err());
        assert!(PeerId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn peer_id_deserialization_validates() {
        let ok: Result<PeerId, _> = serde_json::from_str("\"peer-a\"");
        assert!(ok.is_ok());
        let bad: Result<PeerId, _> = serde_json::from_str("\"bad id\"");
        assert!(bad.is_err());
    }

    #[test]
    fn content_id_rejects_whitespace() {
        assert!(ContentId::new("store1").is_ok());
        assert!(ContentId::new("sha256:abcd/chunk-7").is_ok());
        assert!(ContentId::new("two words").is_err());
        assert!(ContentId::new("").is_err());
    }

    #[test]
    fn session_id_is_uuid_v4() {
        let id = SessionId::new();
        assert_eq!(id.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn request_id_parses_display() {
        let id = RequestId::new();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<RequestId>().is_err());
    }

    #[test]
    fn distinct_request_ids_differ() {
        assert_ne!(RequestId::new(), RequestId::new());
    }
}
