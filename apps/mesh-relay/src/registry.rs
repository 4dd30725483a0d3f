use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use signal_proto::{PeerId, SignalingEnvelope};
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound half of a relay connection. A writer task drains it onto the
/// websocket; once that task stops, the sender reports closed.
pub type Outbound = mpsc::UnboundedSender<SignalingEnvelope>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Target unknown, already deregistered, or its connection has closed.
    Dropped,
}

/// Owns the identity -> connection table for every live relay connection.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    connections: DashMap<PeerId, Outbound>,
    // Serializes allocate -> enumerate -> insert so each newcomer sees
    // every identity assigned before it.
    admission: Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a fresh identity and record the connection as alive.
    pub fn register(&self, outbound: Outbound) -> PeerId {
        self.register_with(outbound, |_, _| None)
    }

    /// Register a connection, handing `greeting` the new identity and the
    /// identities alive before it. A returned envelope is queued on the
    /// connection before any other sender can reach it.
    pub fn register_with<F>(&self, outbound: Outbound, greeting: F) -> PeerId
    where
        F: FnOnce(PeerId, Vec<PeerId>) -> Option<SignalingEnvelope>,
    {
        let _admission = self.inner.admission.lock();
        let id = PeerId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let existing = self.enumerate();
        if let Some(envelope) = greeting(id, existing) {
            let _ = outbound.send(envelope);
        }
        self.inner.connections.insert(id, outbound);
        debug!(target = "relay", peer = %id, "connection registered");
        id
    }

    /// Remove an identity. Returns whether it was still registered.
    pub fn deregister(&self, id: PeerId) -> bool {
        let removed = self.inner.connections.remove(&id).is_some();
        if removed {
            debug!(target = "relay", peer = %id, "connection deregistered");
        }
        removed
    }

    /// Every alive identity in ascending order. Connections whose writer has
    /// already gone away are skipped even if not yet deregistered.
    pub fn enumerate(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .inner
            .connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_alive(&self, id: PeerId) -> bool {
        self.inner
            .connections
            .get(&id)
            .map(|outbound| !outbound.is_closed())
            .unwrap_or(false)
    }

    pub fn send_to(&self, id: PeerId, envelope: SignalingEnvelope) -> Delivery {
        // Clone out of the map so the shard guard is released before any
        // eviction below touches the same shard.
        let Some(outbound) = self
            .inner
            .connections
            .get(&id)
            .map(|entry| entry.value().clone())
        else {
            return Delivery::Dropped;
        };
        if outbound.send(envelope).is_err() {
            self.evict(id);
            return Delivery::Dropped;
        }
        Delivery::Delivered
    }

    /// Send to every alive identity except `excluded`. Returns how many
    /// connections accepted the envelope.
    pub fn broadcast_except(&self, excluded: PeerId, envelope: &SignalingEnvelope) -> usize {
        let targets: Vec<(PeerId, Outbound)> = self
            .inner
            .connections
            .iter()
            .filter(|entry| *entry.key() != excluded)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (id, outbound) in targets {
            if outbound.send(envelope.clone()).is_ok() {
                delivered += 1;
            } else {
                self.evict(id);
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.enumerate().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The identity the next connection will receive.
    pub fn next_id(&self) -> PeerId {
        PeerId(self.inner.next_id.load(Ordering::SeqCst))
    }

    fn evict(&self, id: PeerId) {
        if self.inner.connections.remove(&id).is_some() {
            debug!(target = "relay", peer = %id, "evicted closed connection");
        }
    }
}
