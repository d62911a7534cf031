//! Liveness-tracked peer directory.
//!
//! Peers are keyed by [`PeerId`] in a DashMap; per-key updates are atomic
//! and nothing spans keys. Expiry is checked opportunistically by every
//! mutating call and by the periodic sweep in [`crate::cleanup`]. Reads
//! filter expired peers out but never remove them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hub_types::{classify_address, AddressClass, AddressError, ContentId, PeerId, PseudonymousAddress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::time::Instant;

use crate::config::{Config, RegistryConfig};
use crate::error::RegistryError;
use crate::unix_now;

/// Capability flag of peers willing to relay for others.
pub const CAP_RELAY: &str = "relay";

/// Largest public address list accepted.
pub const MAX_ADDRESSES: usize = 16;
/// Largest content list accepted.
pub const MAX_CONTENT_IDS: usize = 256;
/// Largest capability list accepted.
pub const MAX_CAPABILITIES: usize = 32;
const MAX_CAPABILITY_LEN: usize = 64;
const MAX_VERSION_LEN: usize = 64;

/// What a peer declares when it registers.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerDescriptor {
    /// Peer identifier.
    pub peer_id: PeerId,
    /// Public locators; must all be pseudonymous.
    pub addresses: Vec<String>,
    /// Real transport locators, only released to authorized resolvers.
    #[serde(default)]
    pub private_addresses: Vec<String>,
    /// Content the peer claims to hold.
    #[serde(default)]
    pub content_ids: Vec<ContentId>,
    /// Capability flags, e.g. `"relay"`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Peer software or protocol version.
    #[serde(default)]
    pub version: String,
    /// Concurrent relay load this peer accepts, if relay-capable.
    #[serde(default)]
    pub relay_capacity: Option<u32>,
}

/// A peer as it appears in open listings. Never carries private addresses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    /// Peer identifier.
    pub peer_id: PeerId,
    /// Pseudonymous locators.
    pub addresses: Vec<PseudonymousAddress>,
    /// Content the peer claims to hold.
    pub content_ids: BTreeSet<ContentId>,
    /// Capability flags.
    pub capabilities: BTreeSet<String>,
    /// Peer software or protocol version.
    pub version: String,
    /// Relay capacity, for relay-capable peers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_capacity: Option<u32>,
    /// Unix seconds of the last registration or heartbeat.
    pub last_seen: u64,
}

/// Result of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    /// Always true; failures are errors.
    pub accepted: bool,
    /// Peers registered after this call.
    pub total_peers: usize,
    /// Expired peers purged by this call.
    pub purged_count: usize,
    /// Token for opening the peer's duplex channel. Issued when the peer
    /// first registers; a re-registration while live keeps the old token
    /// and does not repeat it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_token: Option<String>,
}

/// Result of a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Heartbeat {
    /// Always true; failures are errors.
    pub accepted: bool,
    /// New `last_seen`, Unix seconds.
    pub last_seen: u64,
}

/// Discovery filter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerFilter {
    /// Only peers claiming this content.
    pub content_id: Option<ContentId>,
    /// Only peers with this capability.
    pub capability: Option<String>,
}

#[derive(Debug)]
struct PeerRecord {
    info: PeerInfo,
    private_addresses: Vec<String>,
    channel_token: String,
    seen_at: Instant,
}

/// Peer directory.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: DashMap<PeerId, PeerRecord>,
    ttl: Duration,
    max_peers: usize,
    resolver_token: Option<String>,
    default_relay_capacity: u32,
}

impl PeerRegistry {
    /// Create a registry from configuration.
    pub fn new(config: &Config) -> Self {
        Self::with_settings(&config.registry, config.relay.default_relay_capacity)
    }

    /// Create a registry from its own section.
    pub fn with_settings(config: &RegistryConfig, default_relay_capacity: u32) -> Self {
        Self {
            peers: DashMap::new(),
            ttl: Duration::from_secs(config.peer_ttl_secs),
            max_peers: config.max_peers,
            resolver_token: config.resolver_token.clone().filter(|t| !t.is_empty()),
            default_relay_capacity,
        }
    }

    /// Peer time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register or refresh a peer.
    ///
    /// The descriptor is fully validated before anything is touched, so a
    /// rejected registration leaves the registry unchanged.
    pub fn register(&self, descriptor: PeerDescriptor) -> Result<Registration, RegistryError> {
        let mut record = self.validate(descriptor)?;
        let fresh_token = channel_token()?;
        let purged_count = self.purge_expired();

        let peer_id = record.info.peer_id.clone();
        if !self.peers.contains_key(&peer_id) && self.peers.len() >= self.max_peers {
            return Err(RegistryError::Full {
                limit: self.max_peers,
            });
        }

        let channel_token = match self.peers.entry(peer_id.clone()) {
            Entry::Occupied(mut existing) => {
                record.channel_token = existing.get().channel_token.clone();
                existing.insert(record);
                None
            }
            Entry::Vacant(slot) => {
                record.channel_token = fresh_token.clone();
                slot.insert(record);
                Some(fresh_token)
            }
        };
        let total_peers = self.peers.len();
        if channel_token.is_some() {
            tracing::info!(peer = %peer_id, total_peers, "peer registered");
        } else {
            tracing::debug!(peer = %peer_id, "peer re-registered");
        }

        Ok(Registration {
            accepted: true,
            total_peers,
            purged_count,
            channel_token,
        })
    }

    /// Refresh a peer's `last_seen`.
    pub fn heartbeat(&self, peer_id: &PeerId) -> Result<Heartbeat, RegistryError> {
        let now = Instant::now();
        let last_seen = {
            let Some(mut entry) = self.peers.get_mut(peer_id) else {
                return Err(RegistryError::NotFound(peer_id.clone()));
            };
            if now.duration_since(entry.seen_at) > self.ttl {
                None
            } else {
                entry.seen_at = now;
                entry.info.last_seen = unix_now();
                Some(entry.info.last_seen)
            }
        };

        let purged = self.purge_expired();
        match last_seen {
            Some(last_seen) => {
                tracing::debug!(peer = %peer_id, purged, "heartbeat");
                Ok(Heartbeat {
                    accepted: true,
                    last_seen,
                })
            }
            // Expired before the beat arrived; the purge above removed it.
            None => Err(RegistryError::NotFound(peer_id.clone())),
        }
    }

    /// Live peers matching a filter, ordered by peer id.
    pub fn list(&self, filter: &PeerFilter) -> Vec<PeerInfo> {
        let now = Instant::now();
        let mut peers: Vec<PeerInfo> = self
            .peers
            .iter()
            .filter(|e| self.is_live_at(e.value(), now))
            .filter(|e| {
                filter
                    .content_id
                    .as_ref()
                    .map_or(true, |c| e.info.content_ids.contains(c))
            })
            .filter(|e| {
                filter
                    .capability
                    .as_ref()
                    .map_or(true, |c| e.info.capabilities.contains(c))
            })
            .map(|e| e.info.clone())
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Live peers claiming a content id.
    pub fn find_by_content(&self, content_id: &ContentId) -> Vec<PeerInfo> {
        self.list(&PeerFilter {
            content_id: Some(content_id.clone()),
            capability: None,
        })
    }

    /// A live peer's public listing.
    pub fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        let now = Instant::now();
        self.peers
            .get(peer_id)
            .filter(|e| self.is_live_at(e.value(), now))
            .map(|e| e.info.clone())
    }

    /// Whether a peer is registered and not expired.
    pub fn is_live(&self, peer_id: &PeerId) -> bool {
        self.get(peer_id).is_some()
    }

    /// Whether a live peer claims a content id.
    pub fn holds(&self, peer_id: &PeerId, content_id: &ContentId) -> bool {
        self.get(peer_id)
            .is_some_and(|p| p.content_ids.contains(content_id))
    }

    /// Live relay-capable peers and their capacities, excluding `exclude`.
    pub fn relay_candidates(&self, exclude: &[&PeerId]) -> Vec<(PeerId, u32)> {
        self.list(&PeerFilter {
            content_id: None,
            capability: Some(CAP_RELAY.to_string()),
        })
        .into_iter()
        .filter(|p| !exclude.contains(&&p.peer_id))
        .map(|p| {
            let capacity = p.relay_capacity.unwrap_or(self.default_relay_capacity);
            (p.peer_id, capacity)
        })
        .collect()
    }

    /// Remove a peer. Returns whether it was present.
    pub fn deregister(&self, peer_id: &PeerId) -> bool {
        let removed = self.peers.remove(peer_id).is_some();
        if removed {
            tracing::info!(peer = %peer_id, "peer deregistered");
        }
        removed
    }

    /// Release a peer's private addresses to an authorized resolver.
    pub fn resolve_private(
        &self,
        peer_id: &PeerId,
        token: &str,
    ) -> Result<Vec<String>, RegistryError> {
        let Some(expected) = self.resolver_token.as_deref() else {
            return Err(RegistryError::Unauthorized);
        };
        if !bool::from(expected.as_bytes().ct_eq(token.as_bytes())) {
            tracing::warn!(peer = %peer_id, "private address resolution refused");
            return Err(RegistryError::Unauthorized);
        }

        let now = Instant::now();
        self.peers
            .get(peer_id)
            .filter(|e| self.is_live_at(e.value(), now))
            .map(|e| e.private_addresses.clone())
            .ok_or_else(|| RegistryError::NotFound(peer_id.clone()))
    }

    /// Check the token presented when a peer opens its duplex channel.
    pub fn verify_channel_token(&self, peer_id: &PeerId, token: &str) -> Result<(), RegistryError> {
        let now = Instant::now();
        let entry = self
            .peers
            .get(peer_id)
            .filter(|e| self.is_live_at(e.value(), now))
            .ok_or_else(|| RegistryError::NotFound(peer_id.clone()))?;
        if bool::from(entry.channel_token.as_bytes().ct_eq(token.as_bytes())) {
            Ok(())
        } else {
            tracing::warn!(peer = %peer_id, "channel token refused");
            Err(RegistryError::ChannelUnauthorized)
        }
    }

    /// Remove every expired peer. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.peers.len();
        self.peers.retain(|_, record| self.is_live_at(record, now));
        let purged = before.saturating_sub(self.peers.len());
        if purged > 0 {
            tracing::info!(purged, remaining = self.peers.len(), "purged expired peers");
        }
        purged
    }

    /// Registered peers, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn is_live_at(&self, record: &PeerRecord, now: Instant) -> bool {
        now.saturating_duration_since(record.seen_at) <= self.ttl
    }

    fn validate(&self, d: PeerDescriptor) -> Result<PeerRecord, RegistryError> {
        if d.addresses.is_empty() {
            return Err(RegistryError::NoPseudonymousAddress);
        }
        if d.addresses.len() > MAX_ADDRESSES || d.private_addresses.len() > MAX_ADDRESSES {
            return Err(RegistryError::Validation(format!(
                "at most {MAX_ADDRESSES} addresses per list"
            )));
        }
        if d.content_ids.len() > MAX_CONTENT_IDS {
            return Err(RegistryError::Validation(format!(
                "at most {MAX_CONTENT_IDS} content ids"
            )));
        }
        if d.capabilities.len() > MAX_CAPABILITIES
            || d.capabilities
                .iter()
                .any(|c| c.is_empty() || c.len() > MAX_CAPABILITY_LEN)
        {
            return Err(RegistryError::Validation("invalid capability list".into()));
        }
        if d.version.len() > MAX_VERSION_LEN {
            return Err(RegistryError::Validation("version too long".into()));
        }
        if d.private_addresses.iter().any(|a| a.trim().is_empty()) {
            return Err(RegistryError::Validation("empty private address".into()));
        }

        let mut addresses = Vec::with_capacity(d.addresses.len());
        for raw in &d.addresses {
            match classify_address(raw) {
                AddressClass::Pseudonymous(addr) => {
                    if !addresses.contains(&addr) {
                        addresses.push(addr);
                    }
                }
                AddressClass::Real => {
                    tracing::warn!(peer = %d.peer_id, "registration carried a real address");
                    return Err(AddressError::RealAddress(raw.clone()).into());
                }
                AddressClass::Invalid(e) => return Err(e.into()),
            }
        }

        let capabilities: BTreeSet<String> = d.capabilities.into_iter().collect();
        let relay_capacity = if capabilities.contains(CAP_RELAY) {
            Some(d.relay_capacity.unwrap_or(self.default_relay_capacity))
        } else {
            None
        };

        Ok(PeerRecord {
            info: PeerInfo {
                peer_id: d.peer_id,
                addresses,
                content_ids: d.content_ids.into_iter().collect(),
                capabilities,
                version: d.version,
                relay_capacity,
                last_seen: unix_now(),
            },
            private_addresses: d.private_addresses,
            channel_token: String::new(),
            seen_at: Instant::now(),
        })
    }
}

fn channel_token() -> Result<String, RegistryError> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).map_err(|e| RegistryError::Entropy(e.to_string()))?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PeerRegistry {
        PeerRegistry::with_settings(
            &RegistryConfig {
                peer_ttl_secs: 600,
                sweep_interval_secs: 120,
                max_peers: 3,
                resolver_token: Some("resolver-secret".into()),
            },
            4,
        )
    }

    fn addr(seed: &str) -> String {
        PseudonymousAddress::derive(seed.as_bytes()).to_string()
    }

    fn descriptor(id: &str, content: &[&str]) -> PeerDescriptor {
        PeerDescriptor {
            peer_id: PeerId::new(id).unwrap(),
            addresses: vec![addr(id)],
            private_addresses: vec![],
            content_ids: content.iter().map(|c| ContentId::new(*c).unwrap()).collect(),
            capabilities: vec![],
            version: "1.0".into(),
            relay_capacity: None,
        }
    }

    fn pid(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    #[tokio::test]
    async fn register_and_find_by_content() {
        let reg = registry();
        let r = reg.register(descriptor("a", &["store1"])).unwrap();
        assert!(r.accepted);
        assert_eq!(r.total_peers, 1);
        reg.register(descriptor("b", &[])).unwrap();

        let found = reg.find_by_content(&ContentId::new("store1").unwrap());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].peer_id, pid("a"));
        assert_eq!(reg.list(&PeerFilter::default()).len(), 2);
    }

    #[tokio::test]
    async fn missing_pseudonymous_address_is_privacy_violation() {
        let reg = registry();
        let mut d = descriptor("a", &[]);
        d.addresses.clear();
        assert!(matches!(
            reg.register(d),
            Err(RegistryError::NoPseudonymousAddress)
        ));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn real_address_is_rejected_without_state_change() {
        let reg = registry();
        for leak in ["192.168.1.10", "10.0.0.1:4433", "https://peer.example.com/x"] {
            let mut d = descriptor("a", &[]);
            d.addresses.push(leak.into());
            let err = reg.register(d).unwrap_err();
            assert!(
                matches!(err, RegistryError::Privacy(AddressError::RealAddress(_))),
                "{leak}: {err:?}"
            );
        }
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn garbage_address_is_rejected() {
        let reg = registry();
        let mut d = descriptor("a", &[]);
        d.addresses = vec!["pn1:nothex".into()];
        assert!(matches!(reg.register(d), Err(RegistryError::Privacy(_))));
    }

    #[tokio::test]
    async fn reregistration_updates_in_place() {
        let reg = registry();
        reg.register(descriptor("a", &["x"])).unwrap();
        let r = reg.register(descriptor("a", &["y"])).unwrap();
        assert_eq!(r.total_peers, 1);
        let peer = reg.get(&pid("a")).unwrap();
        assert!(peer.content_ids.contains(&ContentId::new("y").unwrap()));
        assert!(!peer.content_ids.contains(&ContentId::new("x").unwrap()));
    }

    #[tokio::test]
    async fn channel_token_is_issued_once_per_registration() {
        let reg = registry();
        let first = reg.register(descriptor("a", &[])).unwrap();
        let token = first.channel_token.unwrap();
        assert_eq!(token.len(), 64);

        let again = reg.register(descriptor("a", &["y"])).unwrap();
        assert_eq!(again.channel_token, None);
        reg.verify_channel_token(&pid("a"), &token).unwrap();

        let other = reg.register(descriptor("b", &[])).unwrap();
        assert_ne!(other.channel_token.as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn channel_token_must_match_its_own_peer() {
        let reg = registry();
        let a = reg.register(descriptor("a", &[])).unwrap().channel_token.unwrap();
        let b = reg.register(descriptor("b", &[])).unwrap().channel_token.unwrap();

        assert!(matches!(
            reg.verify_channel_token(&pid("a"), &b),
            Err(RegistryError::ChannelUnauthorized)
        ));
        assert!(matches!(
            reg.verify_channel_token(&pid("a"), ""),
            Err(RegistryError::ChannelUnauthorized)
        ));
        assert!(matches!(
            reg.verify_channel_token(&pid("ghost"), &a),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_peer_gets_a_new_channel_token() {
        let reg = registry();
        let old = reg.register(descriptor("a", &[])).unwrap().channel_token.unwrap();
        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(matches!(
            reg.verify_channel_token(&pid("a"), &old),
            Err(RegistryError::NotFound(_))
        ));

        let fresh = reg.register(descriptor("a", &[])).unwrap().channel_token.unwrap();
        assert_ne!(fresh, old);
        assert!(reg.verify_channel_token(&pid("a"), &old).is_err());
        reg.verify_channel_token(&pid("a"), &fresh).unwrap();
    }

    #[tokio::test]
    async fn heartbeat_unknown_is_not_found() {
        let reg = registry();
        assert!(matches!(
            reg.heartbeat(&pid("ghost")),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_peer_alive_past_original_ttl() {
        let reg = registry();
        reg.register(descriptor("a", &[])).unwrap();

        tokio::time::advance(Duration::from_secs(500)).await;
        reg.heartbeat(&pid("a")).unwrap();
        tokio::time::advance(Duration::from_secs(500)).await;

        assert!(reg.is_live(&pid("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_disappears_then_is_purged() {
        let reg = registry();
        reg.register(descriptor("a", &["store1"])).unwrap();
        reg.register(descriptor("b", &[])).unwrap();

        tokio::time::advance(Duration::from_secs(400)).await;
        reg.heartbeat(&pid("b")).unwrap();
        tokio::time::advance(Duration::from_secs(201)).await;

        // Reads hide the expired peer but do not remove it.
        assert!(reg
            .find_by_content(&ContentId::new("store1").unwrap())
            .is_empty());
        assert_eq!(reg.len(), 2);

        // The next mutating call purges it.
        let r = reg.register(descriptor("c", &[])).unwrap();
        assert_eq!(r.purged_count, 1);
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_after_expiry_is_not_found() {
        let reg = registry();
        reg.register(descriptor("a", &[])).unwrap();
        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(matches!(
            reg.heartbeat(&pid("a")),
            Err(RegistryError::NotFound(_))
        ));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn full_registry_rejects_new_peers_only() {
        let reg = registry();
        for id in ["a", "b", "c"] {
            reg.register(descriptor(id, &[])).unwrap();
        }
        assert!(matches!(
            reg.register(descriptor("d", &[])),
            Err(RegistryError::Full { limit: 3 })
        ));
        assert!(reg.register(descriptor("a", &["new"])).is_ok());
    }

    #[tokio::test]
    async fn private_addresses_need_the_resolver_token() {
        let reg = registry();
        let mut d = descriptor("a", &[]);
        d.private_addresses = vec!["203.0.113.7:4433".into()];
        reg.register(d).unwrap();

        let listed = serde_json::to_string(&reg.get(&pid("a")).unwrap()).unwrap();
        assert!(!listed.contains("203.0.113.7"));

        assert!(matches!(
            reg.resolve_private(&pid("a"), "wrong"),
            Err(RegistryError::Unauthorized)
        ));
        assert_eq!(
            reg.resolve_private(&pid("a"), "resolver-secret").unwrap(),
            vec!["203.0.113.7:4433".to_string()]
        );
    }

    #[tokio::test]
    async fn resolution_disabled_without_token() {
        let reg = PeerRegistry::with_settings(&RegistryConfig::default(), 4);
        reg.register(descriptor("a", &[])).unwrap();
        assert!(matches!(
            reg.resolve_private(&pid("a"), ""),
            Err(RegistryError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn relay_candidates_use_declared_or_default_capacity() {
        let reg = registry();
        let mut r1 = descriptor("r1", &[]);
        r1.capabilities = vec![CAP_RELAY.into()];
        r1.relay_capacity = Some(10);
        let mut r2 = descriptor("r2", &[]);
        r2.capabilities = vec![CAP_RELAY.into()];
        reg.register(r1).unwrap();
        reg.register(r2).unwrap();
        reg.register(descriptor("plain", &[])).unwrap();

        let r1_id = pid("r1");
        let candidates = reg.relay_candidates(&[&r1_id]);
        assert_eq!(candidates, vec![(pid("r2"), 4)]);
        assert_eq!(reg.relay_candidates(&[]).len(), 2);
    }

    #[tokio::test]
    async fn capability_filter() {
        let reg = registry();
        let mut r = descriptor("r", &[]);
        r.capabilities = vec![CAP_RELAY.into()];
        reg.register(r).unwrap();
        reg.register(descriptor("p", &[])).unwrap();

        let relays = reg.list(&PeerFilter {
            content_id: None,
            capability: Some(CAP_RELAY.into()),
        });
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].peer_id, pid("r"));
    }

    #[tokio::test]
    async fn deregister_removes() {
        let reg = registry();
        reg.register(descriptor("a", &[])).unwrap();
        assert!(reg.deregister(&pid("a")));
        assert!(!reg.deregister(&pid("a")));
        assert!(reg.get(&pid("a")).is_none());
    }
}
