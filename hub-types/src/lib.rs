//! # hub-types
//!
//! Wire format types for the peerhub coordination server.
//!
//! This crate provides the vocabulary shared by peers and the coordinator:
//! - [`PeerId`], [`ContentId`], [`SessionId`], [`RequestId`], [`AssignmentId`] - identifiers
//! - [`PseudonymousAddress`] - the only address form allowed in public listings
//! - [`ChannelMessage`] - signals exchanged over a peer's duplex channel
//! - [`WireError`] - error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod address;
mod error;
mod ids;
mod messages;

pub use address::{classify_address, AddressClass, PseudonymousAddress, ADDRESS_PREFIX};
pub use error::{AddressError, WireError};
pub use ids::{AssignmentId, ContentId, PeerId, RequestId, SessionId, MAX_ID_LEN};
pub use messages::{decode_payload, encode_payload, ByteRange, ChannelMessage};
