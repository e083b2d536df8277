//! Per-connection state: the shared key once derived, pending challenge,
//! authentication flag, session id, optional identifier/metadata, and send
//! operations. One `Session` exists per transport handle, created on
//! transport-open and destroyed on transport-close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::crypto::SharedKey;
use crate::envelope::{self, CompressionThreshold};
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use crate::transport::OutgoingFrame;

/// A session's unique, process-wide opaque identifier, minted on
/// acceptance.
pub type SessionId = String;

pub struct Session {
    id: SessionId,
    sender: UnboundedSender<OutgoingFrame>,
    shared_key: RwLock<Option<SharedKey>>,
    pending_challenge: RwLock<Option<String>>,
    authenticated: AtomicBool,
    identifier: RwLock<Option<String>>,
    metadata: RwLock<Option<String>>,
}

impl Session {
    pub fn new(sender: UnboundedSender<OutgoingFrame>) -> Self {
        Session {
            id: Uuid::new_v4().to_string(),
            sender,
            shared_key: RwLock::new(None),
            pending_challenge: RwLock::new(None),
            authenticated: AtomicBool::new(false),
            identifier: RwLock::new(None),
            metadata: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Write the shared key before any subsequent send decision can
    /// observe it. A single assignment is sufficient; no further locking
    /// on the key itself is required once published.
    pub fn set_shared_key(&self, key: SharedKey) {
        *self.shared_key.write().unwrap() = Some(key);
    }

    pub fn shared_key(&self) -> Option<SharedKey> {
        self.shared_key.read().unwrap().clone()
    }

    pub fn set_pending_challenge(&self, challenge: String) {
        *self.pending_challenge.write().unwrap() = Some(challenge);
    }

    /// Clears the pending challenge as a side effect: it is cleared as
    /// soon as any response is processed, regardless of outcome.
    pub fn take_pending_challenge(&self) -> Option<String> {
        self.pending_challenge.write().unwrap().take()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Monotonic false→true; never transitions back.
    pub fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    pub fn identifier(&self) -> Option<String> {
        self.identifier.read().unwrap().clone()
    }

    pub fn set_identifier(&self, identifier: String) {
        *self.identifier.write().unwrap() = Some(identifier);
    }

    pub fn metadata(&self) -> Option<String> {
        self.metadata.read().unwrap().clone()
    }

    pub fn set_metadata(&self, metadata: Option<String>) {
        *self.metadata.write().unwrap() = metadata;
    }

    /// Encode and hand a frame to the transport. Once a shared key is
    /// present this always produces an encrypted envelope — encryption
    /// always wins once the key exists; `compression_threshold` is only
    /// consulted while unkeyed.
    pub fn send(&self, message: &impl Packet, compression_threshold: CompressionThreshold) -> Result<()> {
        let key = self.shared_key();
        let text = envelope::encode(message, key.as_ref(), compression_threshold)?;
        self.sender
            .send(OutgoingFrame::Text(text))
            .map_err(|_| ProtocolError::Transport("session's transport is closed".into()))
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) -> Result<()> {
        self.sender
            .send(OutgoingFrame::Close(code, reason.into()))
            .map_err(|_| ProtocolError::Transport("session's transport is closed".into()))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("authenticated", &self.is_authenticated())
            .field("identifier", &self.identifier())
            .finish()
    }
}
