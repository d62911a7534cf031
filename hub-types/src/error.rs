//! Error types for hub-types.

use thiserror::Error;

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// JSON encoding or decoding failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload was not valid base64
    #[error("invalid payload encoding: {0}")]
    PayloadEncoding(#[from] base64::DecodeError),

    /// Invalid identifier
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Invalid byte range
    #[error("invalid byte range: {start}..{end}")]
    InvalidRange {
        /// First byte (inclusive).
        start: u64,
        /// Last byte (exclusive).
        end: u64,
    },
}

/// Why an address string was refused as a pseudonymous address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// The string is a real transport locator (IP, socket address, URL host).
    #[error("real network address not allowed in public listing: {0}")]
    RealAddress(String),

    /// Missing the `pn1:` prefix.
    #[error("address does not use the pseudonymous scheme")]
    WrongScheme,

    /// Digest part is not 64 lowercase hex characters.
    #[error("malformed identity digest")]
    MalformedDigest,

    /// Label suffix is empty, too long, or uses forbidden characters.
    #[error("malformed address label")]
    MalformedLabel,
}
