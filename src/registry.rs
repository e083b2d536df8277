//! Server-side session registry: every live session indexed by its
//! transport handle, plus a secondary index by application identifier
//! once a session identifies itself via `PacketIdentification`.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::envelope::CompressionThreshold;
use crate::packet::Packet;
use crate::session::Session;
use crate::transport::TransportHandle;

/// Indexes live sessions by transport handle and, once identified, by
/// application identifier. Both indexes hold the same `Arc<Session>`; the
/// identifier index is populated lazily and removed eagerly on
/// disconnect or identifier reassignment.
#[derive(Default)]
pub struct SessionRegistry {
    by_handle: DashMap<TransportHandle, Arc<Session>>,
    by_identifier: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry { by_handle: DashMap::new(), by_identifier: DashMap::new() }
    }

    pub fn register(&self, handle: TransportHandle, session: Arc<Session>) {
        self.by_handle.insert(handle, session);
    }

    pub fn get(&self, handle: &TransportHandle) -> Option<Arc<Session>> {
        self.by_handle.get(handle).map(|entry| entry.clone())
    }

    pub fn get_by_identifier(&self, identifier: &str) -> Option<Arc<Session>> {
        self.by_identifier.get(identifier).map(|entry| entry.clone())
    }

    /// Claim `identifier` for `session`, failing if another still-live
    /// session already holds it.
    pub fn claim_identifier(&self, identifier: String, session: Arc<Session>) -> bool {
        match self.by_identifier.entry(identifier) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    /// Remove a session on disconnect. The identifier index entry is only
    /// removed if it still points at this exact session — a session that
    /// lost an identifier race to a later connection must not evict the
    /// winner.
    pub fn remove(&self, handle: &TransportHandle) {
        if let Some((_, session)) = self.by_handle.remove(handle) {
            if let Some(identifier) = session.identifier() {
                self.by_identifier
                    .remove_if(&identifier, |_, existing| Arc::ptr_eq(existing, &session));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    /// Send `message` to every currently authenticated, connected session.
    /// Sessions are snapshotted before any send is attempted, so a session
    /// that disconnects mid-broadcast doesn't perturb the sweep; a single
    /// recipient's send failure is logged and does not abort the rest.
    pub fn broadcast(&self, message: &impl Packet, compression_threshold: CompressionThreshold) {
        let sessions: Vec<Arc<Session>> = self
            .by_handle
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|session| session.is_authenticated())
            .collect();
        for session in sessions {
            if let Err(e) = session.send(message, compression_threshold) {
                warn!(session = session.id(), error = %e, "broadcast send failed");
            }
        }
    }

    /// Send `message` to every authenticated session except `exclude`.
    pub fn broadcast_except(
        &self,
        exclude: &TransportHandle,
        message: &impl Packet,
        compression_threshold: CompressionThreshold,
    ) {
        let sessions: Vec<Arc<Session>> = self
            .by_handle
            .iter()
            .filter(|entry| entry.key() != exclude)
            .map(|entry| entry.value().clone())
            .filter(|session| session.is_authenticated())
            .collect();
        for session in sessions {
            if let Err(e) = session.send(message, compression_threshold) {
                warn!(session = session.id(), error = %e, "broadcast send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketPing;
    use crate::transport::OutgoingFrame;
    use tokio::sync::mpsc;

    fn new_session() -> (Arc<Session>, mpsc::UnboundedReceiver<OutgoingFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Session::new(tx)), rx)
    }

    #[test]
    fn register_get_remove_round_trips() {
        let registry = SessionRegistry::new();
        let (session, _rx) = new_session();
        registry.register("handle-1".to_string(), session.clone());
        assert!(registry.get(&"handle-1".to_string()).is_some());
        assert_eq!(registry.len(), 1);

        registry.remove(&"handle-1".to_string());
        assert!(registry.get(&"handle-1".to_string()).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn duplicate_identifier_claim_fails() {
        let registry = SessionRegistry::new();
        let (session_a, _rx_a) = new_session();
        let (session_b, _rx_b) = new_session();

        assert!(registry.claim_identifier("alice".into(), session_a.clone()));
        assert!(!registry.claim_identifier("alice".into(), session_b));
        assert!(Arc::ptr_eq(&registry.get_by_identifier("alice").unwrap(), &session_a));
    }

    #[test]
    fn remove_does_not_evict_a_different_owner() {
        let registry = SessionRegistry::new();
        let (session_a, _rx_a) = new_session();
        let (session_b, _rx_b) = new_session();

        registry.register("handle-a".to_string(), session_a.clone());
        session_a.set_identifier("alice".to_string());
        registry.claim_identifier("alice".to_string(), session_a.clone());

        // session_b takes over "alice" out of band (e.g. reconnect logic
        // in the server layer already released and reclaimed it).
        registry.by_identifier.insert("alice".to_string(), session_b.clone());

        registry.remove(&"handle-a".to_string());
        assert!(Arc::ptr_eq(&registry.get_by_identifier("alice").unwrap(), &session_b));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_authenticated_session() {
        let registry = SessionRegistry::new();
        let (session_a, mut rx_a) = new_session();
        let (session_b, mut rx_b) = new_session();
        session_a.set_authenticated();
        session_b.set_authenticated();
        registry.register("a".to_string(), session_a);
        registry.register("b".to_string(), session_b);

        registry.broadcast(&PacketPing { timestamp: 1, sequence_id: 1 }, None);

        assert!(matches!(rx_a.recv().await, Some(OutgoingFrame::Text(_))));
        assert!(matches!(rx_b.recv().await, Some(OutgoingFrame::Text(_))));
    }

    #[tokio::test]
    async fn broadcast_skips_unauthenticated_sessions() {
        let registry = SessionRegistry::new();
        let (session_a, mut rx_a) = new_session();
        registry.register("a".to_string(), session_a);

        registry.broadcast(&PacketPing { timestamp: 1, sequence_id: 1 }, None);

        assert!(rx_a.try_recv().is_err());
    }
}
