//! Pseudonymous peer addresses.
//!
//! Grammar:
//!
//! ```text
//! address = "pn1:" digest [ "#" label ]
//! digest  = 64 * lowercase-hex           ; BLAKE3(public key)
//! label   = 1*32 ( a-z / 0-9 / "-" )
//! ```
//!
//! A pseudonymous address is stable for an identity and carries no
//! routing or location information. Public listings may contain nothing else.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::AddressError;

/// Scheme prefix of every pseudonymous address.
pub const ADDRESS_PREFIX: &str = "pn1:";

const DIGEST_HEX_LEN: usize = 64;
const MAX_LABEL_LEN: usize = 32;
const DERIVE_CONTEXT: &str = "peerhub 2024 pseudonymous address v1";

/// A locator derived from a peer's cryptographic identity.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PseudonymousAddress {
    digest: [u8; 32],
    label: Option<String>,
}

impl PseudonymousAddress {
    /// Derive the address for a public key.
    pub fn derive(public_key: &[u8]) -> Self {
        let digest = blake3::derive_key(DERIVE_CONTEXT, public_key);
        Self {
            digest,
            label: None,
        }
    }

    /// Attach an endpoint label (e.g. `"mobile"`), validating it.
    pub fn with_label(mut self, label: &str) -> Result<Self, AddressError> {
        validate_label(label)?;
        self.label = Some(label.to_string());
        Ok(self)
    }

    /// Parse a string against the grammar.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let Some(rest) = s.strip_prefix(ADDRESS_PREFIX) else {
            return Err(AddressError::WrongScheme);
        };

        let (digest_part, label) = match rest.split_once('#') {
            Some((d, l)) => {
                validate_label(l)?;
                (d, Some(l.to_string()))
            }
            None => (rest, None),
        };

        if digest_part.len() != DIGEST_HEX_LEN
            || !digest_part
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(AddressError::MalformedDigest);
        }

        let mut digest = [0u8; 32];
        hex::decode_to_slice(digest_part, &mut digest)
            .map_err(|_| AddressError::MalformedDigest)?;

        Ok(Self { digest, label })
    }

    /// The 32-byte identity digest.
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// The optional endpoint label.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

fn validate_label(label: &str) -> Result<(), AddressError> {
    let ok = !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(AddressError::MalformedLabel)
    }
}

impl FromStr for PseudonymousAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PseudonymousAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PseudonymousAddress> for String {
    fn from(addr: PseudonymousAddress) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for PseudonymousAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ADDRESS_PREFIX}{}", hex::encode(self.digest))?;
        if let Some(label) = &self.label {
            write!(f, "#{label}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PseudonymousAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PseudonymousAddress({})", &self.to_string()[..16])
    }
}

/// Classification of an arbitrary address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressClass {
    /// Valid under the pseudonymous grammar.
    Pseudonymous(PseudonymousAddress),
    /// A real transport locator.
    Real,
    /// Neither; rejected by the grammar.
    Invalid(AddressError),
}

/// Classify an address string.
///
/// Real locators are recognised structurally: IP literals, socket
/// addresses, `host:port` pairs, and URLs with an authority component.
pub fn classify_address(s: &str) -> AddressClass {
    match PseudonymousAddress::parse(s) {
        Ok(addr) => return AddressClass::Pseudonymous(addr),
        Err(AddressError::WrongScheme) => {}
        Err(e) => return AddressClass::Invalid(e),
    }

    if is_real_locator(s.trim()) {
        AddressClass::Real
    } else {
        AddressClass::Invalid(AddressError::WrongScheme)
    }
}

fn is_real_locator(s: &str) -> bool {
    if s.parse::<IpAddr>().is_ok() || s.parse::<SocketAddr>().is_ok() {
        return true;
    }

    // scheme://authority[/...]
    if let Some((_, rest)) = s.split_once("://") {
        let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
        return !authority.is_empty();
    }

    // multiaddr-style /ip4/1.2.3.4/tcp/80
    if let Some(rest) = s.strip_prefix('/') {
        let mut parts = rest.split('/');
        if let (Some(proto), Some(value)) = (parts.next(), parts.next()) {
            return matches!(proto, "ip4" | "ip6" | "dns" | "dns4" | "dns6")
                && !value.is_empty();
        }
    }

    // host:port
    if let Some((host, port)) = s.rsplit_once(':') {
        return !host.is_empty()
            && port.parse::<u16>().is_ok()
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '[' | ']'));
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_address_roundtrips_through_text() {
        let addr = PseudonymousAddress::derive(b"public-key-bytes");
        let text = addr.to_string();
        assert!(text.starts_with(ADDRESS_PREFIX));
        assert_eq!(text.len(), ADDRESS_PREFIX.len() + 64);
        assert_eq!(PseudonymousAddress::parse(&text).unwrap(), addr);
    }

    #[test]
    fn derivation_is_stable_per_key() {
        let a = PseudonymousAddress::derive(b"key-1");
        let b = PseudonymousAddress::derive(b"key-1");
        let c = PseudonymousAddress::derive(b"key-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn label_suffix_is_parsed() {
        let addr = PseudonymousAddress::derive(b"k")
            .with_label("mobile-2")
            .unwrap();
        let parsed = PseudonymousAddress::parse(&addr.to_string()).unwrap();
        assert_eq!(parsed.label(), Some("mobile-2"));
    }

    #[test]
    fn uppercase_or_short_digest_is_malformed() {
        let upper = format!("{ADDRESS_PREFIX}{}", "A".repeat(64));
        assert_eq!(
            PseudonymousAddress::parse(&upper),
            Err(AddressError::MalformedDigest)
        );
        let short = format!("{ADDRESS_PREFIX}{}", "a".repeat(10));
        assert_eq!(
            PseudonymousAddress::parse(&short),
            Err(AddressError::MalformedDigest)
        );
    }

    #[test]
    fn bad_label_is_rejected() {
        let bad = format!("{ADDRESS_PREFIX}{}#Bad_Label", "a".repeat(64));
        assert_eq!(
            PseudonymousAddress::parse(&bad),
            Err(AddressError::MalformedLabel)
        );
    }

    #[test]
    fn real_locators_are_classified_as_real() {
        for s in [
            "192.168.1.10",
            "10.0.0.1:4433",
            "[::1]:8080",
            "::1",
            "example.com:443",
            "https://relay.example.com/path",
            "/ip4/1.2.3.4/tcp/80",
        ] {
            assert_eq!(classify_address(s), AddressClass::Real, "{s}");
        }
    }

    #[test]
    fn garbage_is_invalid_not_real() {
        assert!(matches!(
            classify_address("hello"),
            AddressClass::Invalid(AddressError::WrongScheme)
        ));
    }

    #[test]
    fn pseudonymous_is_classified() {
        let addr = PseudonymousAddress::derive(b"k").to_string();
        assert!(matches!(
            classify_address(&addr),
            AddressClass::Pseudonymous(_)
        ));
    }
}
