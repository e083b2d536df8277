//! Server application layer: wires transport events through the handshake
//! state machine and the session registry, then hands anything past
//! authentication to the embedding application's `ServerHandler`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::envelope;
use crate::error::ProtocolError;
use crate::handshake::server as handshake;
use crate::packet::{
    AnyMessage, PacketAuthFailed, PacketChallengeResponse, PacketIdentification, PacketPing,
    PacketPong, PacketPublicKey, PacketVersion,
};
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::transport::{OutgoingFrame, TransportEvents, TransportHandle};

/// Application hooks invoked once a session has cleared the handshake.
/// Handshake mechanics (key exchange, challenge/response) are never
/// exposed here; only what the embedding application actually cares
/// about.
pub trait ServerHandler: Send + Sync {
    fn on_authenticated(&self, session: &Arc<Session>);

    /// A session identified itself and the identifier was free to claim.
    fn on_identified(&self, _session: &Arc<Session>, _identifier: &str) {}

    /// Any non-handshake, non-liveness packet from an authenticated
    /// session.
    fn on_packet(&self, session: &Arc<Session>, message: AnyMessage);

    fn on_disconnect(&self, session: &Arc<Session>, code: u16, reason: &str);
}

pub struct Server<H: ServerHandler> {
    config: ServerConfig,
    registry: SessionRegistry,
    handler: H,
}

impl<H: ServerHandler> Server<H> {
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Server { config, registry: SessionRegistry::new(), handler }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn close(&self, session: &Session, code: u16, reason: impl Into<String>) {
        if let Err(e) = session.close(code, reason) {
            warn!(session = session.id(), error = %e, "failed to queue close frame");
        }
    }

    fn handle_text(&self, handle: &TransportHandle, session: &Arc<Session>, payload: String) {
        let key = session.shared_key();
        let any = match envelope::decode(&payload, key.as_ref()) {
            Ok(any) => any,
            Err(e) => {
                warn!(session = session.id(), error = %e, "failed to decode frame");
                if let Some(code) = e.close_code() {
                    self.close(session, code, e.to_string());
                }
                return;
            }
        };

        let result = self.dispatch(handle, session, any);
        if let Err(e) = result {
            warn!(session = session.id(), error = %e, "handshake error");
            if let Some(code) = e.close_code() {
                self.close(session, code, e.to_string());
            }
        }
    }

    fn dispatch(
        &self,
        _handle: &TransportHandle,
        session: &Arc<Session>,
        any: AnyMessage,
    ) -> crate::error::Result<()> {
        let threshold = self.config.compression_threshold;

        if !session.is_authenticated() {
            return match any.tag.as_str() {
                tag if tag == PacketPublicKey::TYPE_TAG => {
                    handshake::handle_public_key(session, &any, threshold).map(|_| ())
                }
                tag if tag == PacketChallengeResponse::TYPE_TAG => {
                    match handshake::handle_challenge_response(session, &self.config, &any, threshold)? {
                        handshake::Outcome::Authenticated => {
                            self.handler.on_authenticated(session);
                            Ok(())
                        }
                        handshake::Outcome::AuthRejected => {
                            self.close(session, 4001, "authentication failed");
                            Ok(())
                        }
                        handshake::Outcome::Continue => Ok(()),
                    }
                }
                // Advisory and direction-agnostic; a peer may send it at any
                // point after transport-open, handshake included.
                tag if tag == PacketVersion::TYPE_TAG => {
                    let packet: PacketVersion = any.downcast()?;
                    debug!(session = session.id(), client = %packet.client_name, version = %packet.client_version, "peer version (pre-auth)");
                    Ok(())
                }
                other => Err(ProtocolError::AuthState(format!(
                    "unexpected packet {other} before authentication"
                ))),
            };
        }

        if !any.encrypted {
            return Err(ProtocolError::AuthState(format!(
                "unencrypted {} after authentication",
                any.tag
            )));
        }

        match any.tag.as_str() {
            tag if tag == PacketVersion::TYPE_TAG => {
                let packet: PacketVersion = any.downcast()?;
                debug!(session = session.id(), client = %packet.client_name, version = %packet.client_version, "peer version");
                Ok(())
            }
            tag if tag == PacketIdentification::TYPE_TAG => {
                let packet: PacketIdentification = any.downcast()?;
                if self.registry.claim_identifier(packet.client_identifier.clone(), session.clone()) {
                    session.set_identifier(packet.client_identifier.clone());
                    session.set_metadata(packet.metadata);
                    self.handler.on_identified(session, &packet.client_identifier);
                    Ok(())
                } else {
                    let _ = session.send(
                        &PacketAuthFailed { reason: "Identifier already in use".to_string() },
                        threshold,
                    );
                    Err(ProtocolError::IdentifierConflict(packet.client_identifier))
                }
            }
            tag if tag == PacketPing::TYPE_TAG => {
                let packet: PacketPing = any.downcast()?;
                let server_timestamp = now_millis();
                session.send(
                    &PacketPong {
                        client_timestamp: packet.timestamp,
                        server_timestamp,
                        sequence_id: packet.sequence_id,
                    },
                    threshold,
                )
            }
            _ => {
                self.handler.on_packet(session, any);
                Ok(())
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

impl<H: ServerHandler> TransportEvents for Server<H> {
    fn opened(&self, handle: TransportHandle, outgoing: UnboundedSender<OutgoingFrame>) {
        let session = Arc::new(Session::new(outgoing));
        info!(handle = %handle, session = session.id(), "session opened");
        self.registry.register(handle, session);
    }

    fn text(&self, handle: &TransportHandle, payload: String) {
        let Some(session) = self.registry.get(handle) else {
            warn!(handle = %handle, "text frame for unknown session");
            return;
        };
        self.handle_text(handle, &session, payload);
    }

    fn closed(&self, handle: &TransportHandle, code: u16, reason: String) {
        if let Some(session) = self.registry.get(handle) {
            self.handler.on_disconnect(&session, code, &reason);
        }
        self.registry.remove(handle);
    }
}
