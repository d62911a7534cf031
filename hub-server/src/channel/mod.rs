//! Duplex channels to connected peers.
//!
//! The relay coordinator only needs `send` on a peer's channel; inbound
//! messages are pushed into [`crate::relay::RelayCoordinator::on_message`]
//! by whoever owns the socket. [`ws`] provides the WebSocket transport.

pub mod ws;

use async_trait::async_trait;
use dashmap::DashMap;
use hub_types::{ChannelMessage, PeerId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::ChannelError;

/// Outbound half of a peer's duplex channel.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Queue a message for the peer.
    async fn send(&self, message: ChannelMessage) -> Result<(), ChannelError>;

    /// Whether the channel can still carry messages.
    fn is_open(&self) -> bool;
}

/// A channel backed by a bounded queue drained by a writer task.
#[derive(Debug, Clone)]
pub struct QueueChannel {
    peer_id: PeerId,
    tx: mpsc::Sender<ChannelMessage>,
}

impl QueueChannel {
    /// Create a channel and the receiver its writer drains.
    pub fn pair(peer_id: PeerId, capacity: usize) -> (Self, mpsc::Receiver<ChannelMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { peer_id, tx }, rx)
    }
}

#[async_trait]
impl PeerChannel for QueueChannel {
    async fn send(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full(self.peer_id.clone()),
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed(self.peer_id.clone()),
        })
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Identifies one connection of a peer, so a stale socket closing does
/// not detach the peer's newer connection.
pub type ConnectionId = u64;

struct Attached {
    connection: ConnectionId,
    channel: Arc<dyn PeerChannel>,
}

/// Open channels keyed by peer. At most one per peer; a reconnect replaces
/// the previous channel.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<PeerId, Attached>,
    next_connection: AtomicU64,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("connected", &self.channels.len())
            .finish()
    }
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer's channel, replacing any previous one.
    pub fn attach(&self, peer_id: PeerId, channel: Arc<dyn PeerChannel>) -> ConnectionId {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .channels
            .insert(peer_id.clone(), Attached { connection, channel })
            .is_some();
        tracing::info!(peer = %peer_id, connection, replaced, "channel attached");
        connection
    }

    /// Detach a peer's channel if it is still the given connection.
    pub fn detach(&self, peer_id: &PeerId, connection: ConnectionId) -> bool {
        let removed = self
            .channels
            .remove_if(peer_id, |_, a| a.connection == connection)
            .is_some();
        if removed {
            tracing::info!(peer = %peer_id, connection, "channel detached");
        }
        removed
    }

    /// Detach whatever channel a peer has.
    pub fn detach_any(&self, peer_id: &PeerId) -> bool {
        self.channels.remove(peer_id).is_some()
    }

    /// A peer's open channel.
    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<dyn PeerChannel>> {
        self.channels
            .get(peer_id)
            .filter(|a| a.channel.is_open())
            .map(|a| a.channel.clone())
    }

    /// Whether a peer has an open channel.
    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.get(peer_id).is_some()
    }

    /// Send to a peer, failing if it has no open channel.
    pub async fn send(&self, peer_id: &PeerId, message: ChannelMessage) -> Result<(), ChannelError> {
        let channel = self
            .get(peer_id)
            .ok_or_else(|| ChannelError::NotConnected(peer_id.clone()))?;
        channel.send(message).await
    }

    /// Number of attached channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channels are attached.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Drop every channel. Writers see their queues close and exit.
    pub fn clear(&self) {
        self.channels.clear();
    }
}
