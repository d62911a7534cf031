//! The pending-relay table.
//!
//! Each coordinator-mediated relay inserts one entry holding a oneshot
//! sender. The entry is settled exactly once by whichever comes first:
//! the correlated response, its own timer, the source's channel closing,
//! or shutdown. Settling removes the entry under the lock, so a second
//! settlement finds nothing and is a no-op.

use hub_types::{ByteRange, PeerId, RequestId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How a pending relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Source delivered a payload.
    Delivered {
        /// Content bytes.
        payload: Vec<u8>,
        /// Whole-object size, when the source reported it.
        total_size: Option<u64>,
    },
    /// Source reported it could not deliver.
    Failed(String),
    /// Source answered with a frame that is not a valid response.
    Malformed(String),
    /// No response within the window.
    TimedOut,
    /// Source channel closed.
    ConnectionLost,
    /// Coordinator is shutting down.
    Abandoned,
}

/// Whole-object or byte-range transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// The entire object.
    WholeObject,
    /// A byte range of it.
    Range(ByteRange),
}

impl TransferKind {
    /// Kind for an optional range.
    pub fn from_range(range: Option<ByteRange>) -> Self {
        range.map_or(Self::WholeObject, Self::Range)
    }
}

/// Facts about a pending entry, readable without settling it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    /// Peer expected to answer.
    pub source: PeerId,
    /// What was asked for.
    pub kind: TransferKind,
    /// When the entry was created.
    pub started_at: Instant,
    /// Window before it times out.
    pub timeout: Duration,
}

struct PendingEntry {
    info: PendingInfo,
    tx: oneshot::Sender<Settlement>,
    timer: Option<JoinHandle<()>>,
}

/// Table of in-flight mediated relays.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("pending", &self.len())
            .finish()
    }
}

impl PendingTable {
    /// Create an empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert an entry and arm its timer. The receiver resolves exactly once.
    ///
    /// Must be called within a tokio runtime.
    pub fn insert(
        self: &Arc<Self>,
        request_id: RequestId,
        source: PeerId,
        kind: TransferKind,
        timeout: Duration,
    ) -> oneshot::Receiver<Settlement> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            request_id,
            PendingEntry {
                info: PendingInfo {
                    source,
                    kind,
                    started_at: Instant::now(),
                    timeout,
                },
                tx,
                timer: None,
            },
        );

        // Armed after insertion so even a zero timeout finds the entry.
        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = weak.upgrade() {
                if table.settle(&request_id, Settlement::TimedOut) {
                    tracing::warn!(request = %request_id, ?timeout, "relay timed out");
                }
            }
        });

        let mut entries = self.lock();
        match entries.get_mut(&request_id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
        rx
    }

    /// Settle an entry. Returns false if it was already settled or unknown.
    pub fn settle(&self, request_id: &RequestId, settlement: Settlement) -> bool {
        let Some(entry) = self.lock().remove(request_id) else {
            return false;
        };
        Self::finish(entry, settlement);
        true
    }

    /// Settle an entry only if `from` is the peer it is waiting on.
    pub fn settle_from(
        &self,
        request_id: &RequestId,
        from: &PeerId,
        settlement: Settlement,
    ) -> bool {
        let entry = {
            let mut entries = self.lock();
            let expected = entries.get(request_id).map(|e| &e.info.source == from);
            match expected {
                Some(true) => entries.remove(request_id),
                Some(false) => {
                    tracing::warn!(request = %request_id, peer = %from, "response from a peer the relay was not sent to");
                    None
                }
                None => None,
            }
        };
        match entry {
            Some(entry) => {
                Self::finish(entry, settlement);
                true
            }
            None => false,
        }
    }

    /// Settle every entry waiting on `source`. Returns how many.
    pub fn settle_source(&self, source: &PeerId, settlement: Settlement) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut entries = self.lock();
            let ids: Vec<RequestId> = entries
                .iter()
                .filter(|(_, e)| &e.info.source == source)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let n = drained.len();
        for entry in drained {
            Self::finish(entry, settlement.clone());
        }
        n
    }

    /// Settle every entry. Returns how many.
    pub fn settle_all(&self, settlement: Settlement) -> usize {
        let drained: Vec<PendingEntry> = self.lock().drain().map(|(_, e)| e).collect();
        let n = drained.len();
        for entry in drained {
            Self::finish(entry, settlement.clone());
        }
        n
    }

    /// Drop an entry without notifying anyone (the waiter went away).
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        let Some(entry) = self.lock().remove(request_id) else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        true
    }

    /// Facts about a pending entry.
    pub fn info(&self, request_id: &RequestId) -> Option<PendingInfo> {
        self.lock().get(request_id).map(|e| e.info.clone())
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn finish(entry: PendingEntry, settlement: Settlement) {
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        // The waiter may have gone away; nothing left to tell it.
        let _ = entry.tx.send(settlement);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cancels a pending entry if the waiting future is dropped early.
pub struct PendingGuard {
    table: Arc<PendingTable>,
    request_id: RequestId,
}

impl PendingGuard {
    /// Guard `request_id` in `table`.
    pub fn new(table: Arc<PendingTable>, request_id: RequestId) -> Self {
        Self { table, request_id }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        // No-op when the entry was already settled.
        self.table.cancel(&self.request_id);
    }
}
