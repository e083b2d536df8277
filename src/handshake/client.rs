//! Client side of the handshake: C0 (send public key) → C1
//! (awaiting shared secret) → C2 (awaiting challenge) → C3 authenticated.

use tracing::debug;

use crate::config::ClientConfig;
use crate::crypto::{self, KeyPair};
use crate::envelope::CompressionThreshold;
use crate::error::{ProtocolError, Result};
use crate::packet::{
    AnyMessage, PacketChallenge, PacketChallengeResponse, PacketIdentification, PacketPublicKey,
    PacketSharedSecret,
};
use crate::session::Session;

/// Outcome of handing a handshake-phase message to the client state
/// machine.
pub enum Outcome {
    Continue,
    Authenticated,
    /// The server rejected the challenge response; the caller should
    /// close and/or surface this to `ClientHandler::on_disconnect`.
    Rejected(String),
}

/// C0: fired once on transport-open. Generates this connection's keypair
/// and sends the unencrypted public key. The keypair itself is owned by
/// the caller (`client.rs`) since it must outlive this single call to
/// unwrap the shared secret later.
pub fn start(session: &Session, compression_threshold: CompressionThreshold) -> Result<KeyPair> {
    let keys = KeyPair::generate()?;
    let public_key = keys.public_key_base64()?;
    session.send(&PacketPublicKey { public_key }, compression_threshold)?;
    debug!(session = session.id(), "C0 -> C1 (public key sent)");
    Ok(keys)
}

/// C1: unwrap the shared secret under our own private key and publish it
/// to the session, so every subsequent send is encrypted automatically.
pub fn handle_shared_secret(session: &Session, keys: &KeyPair, any: &AnyMessage) -> Result<Outcome> {
    if session.shared_key().is_some() {
        return Err(ProtocolError::AuthState("second PacketSharedSecret after C1".into()));
    }
    let packet: PacketSharedSecret = any.downcast()?;
    let key = keys.unwrap_shared_key(&packet.encrypted_secret)?;
    session.set_shared_key(key);
    debug!(session = session.id(), "C1 -> C2 (shared key established)");
    Ok(Outcome::Continue)
}

/// C2: sign the challenge under the configured pre-shared secret and send
/// the response, now encrypted since the shared key is already set.
pub fn handle_challenge(
    session: &Session,
    config: &ClientConfig,
    any: &AnyMessage,
    compression_threshold: CompressionThreshold,
) -> Result<Outcome> {
    if session.shared_key().is_none() {
        return Err(ProtocolError::AuthState("challenge received before shared key".into()));
    }
    let packet: PacketChallenge = any.downcast()?;
    let response = crypto::sign_challenge(&packet.challenge, &config.pre_shared_secret)?;
    session.send(&PacketChallengeResponse { response }, compression_threshold)?;
    debug!(session = session.id(), "C2 -> C3 (challenge response sent)");
    Ok(Outcome::Continue)
}

/// C3: mark the session authenticated and, if configured with an
/// identifier, follow up with `PacketIdentification`.
pub fn handle_auth_success(
    session: &Session,
    config: &ClientConfig,
    compression_threshold: CompressionThreshold,
) -> Result<Outcome> {
    if session.shared_key().is_none() {
        return Err(ProtocolError::AuthState("auth success received before shared key".into()));
    }
    session.set_authenticated();
    if let Some(client_identifier) = &config.client_identifier {
        session.send(
            &PacketIdentification {
                client_identifier: client_identifier.clone(),
                metadata: config.identification_metadata.clone(),
            },
            compression_threshold,
        )?;
    }
    debug!(session = session.id(), "C3 -> authenticated");
    Ok(Outcome::Authenticated)
}

/// The server rejected our challenge response.
pub fn handle_auth_failed(any: &AnyMessage) -> Result<Outcome> {
    let packet: crate::packet::PacketAuthFailed = any.downcast()?;
    Ok(Outcome::Rejected(packet.reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OutgoingFrame;
    use tokio::sync::mpsc;

    fn session_with_channel() -> (Session, mpsc::UnboundedReceiver<OutgoingFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(tx), rx)
    }

    #[tokio::test]
    async fn full_handshake_from_the_client_side() {
        let (session, mut rx) = session_with_channel();
        let config = ClientConfig::new("topsecret");

        let keys = start(&session, None).unwrap();
        let frame = rx.recv().await.unwrap();
        let OutgoingFrame::Text(public_key_text) = frame else { panic!("expected text frame") };
        let public_key_any = crate::envelope::decode(&public_key_text, None).unwrap();
        let public_key_packet: PacketPublicKey = public_key_any.downcast().unwrap();
        let server_public_key = crypto::parse_public_key_base64(&public_key_packet.public_key).unwrap();

        let server_key = crate::crypto::SharedKey::generate();
        let encrypted_secret = crypto::wrap_shared_key(&server_public_key, &server_key).unwrap();
        let secret_any = AnyMessage::new(
            PacketSharedSecret::TYPE_TAG,
            serde_json::to_value(&PacketSharedSecret { encrypted_secret }).unwrap(),
        );
        handle_shared_secret(&session, &keys, &secret_any).unwrap();
        assert!(session.shared_key().is_some());

        let challenge = crypto::generate_challenge();
        let challenge_any = AnyMessage::new(
            PacketChallenge::TYPE_TAG,
            serde_json::to_value(&PacketChallenge { challenge: challenge.clone() }).unwrap(),
        );
        handle_challenge(&session, &config, &challenge_any, None).unwrap();

        let frame = rx.recv().await.unwrap();
        let OutgoingFrame::Text(response_text) = frame else { panic!("expected text frame") };
        let response_any = crate::envelope::decode(&response_text, Some(&server_key)).unwrap();
        let response_packet: PacketChallengeResponse = response_any.downcast().unwrap();
        let expected = crypto::sign_challenge(&challenge, "topsecret").unwrap();
        assert!(crypto::verify_challenge_response(&expected, &response_packet.response));

        let outcome = handle_auth_success(&session, &config, None).unwrap();
        assert!(matches!(outcome, Outcome::Authenticated));
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn sends_identification_when_configured() {
        let (session, mut rx) = session_with_channel();
        let mut config = ClientConfig::new("topsecret");
        config.client_identifier = Some("client-42".to_string());
        session.set_shared_key(crate::crypto::SharedKey::generate());

        handle_auth_success(&session, &config, None).unwrap();

        let frame = rx.recv().await.unwrap();
        let OutgoingFrame::Text(text) = frame else { panic!("expected text frame") };
        let any = crate::envelope::decode(&text, session.shared_key().as_ref()).unwrap();
        let packet: PacketIdentification = any.downcast().unwrap();
        assert_eq!(packet.client_identifier, "client-42");
    }

    #[tokio::test]
    async fn challenge_before_shared_key_is_rejected() {
        let (session, _rx) = session_with_channel();
        let config = ClientConfig::new("topsecret");
        let any = AnyMessage::new(
            PacketChallenge::TYPE_TAG,
            serde_json::to_value(&PacketChallenge { challenge: "x".into() }).unwrap(),
        );
        assert!(matches!(handle_challenge(&session, &config, &any, None), Err(ProtocolError::AuthState(_))));
    }

    #[tokio::test]
    async fn auth_success_before_shared_key_is_rejected() {
        let (session, _rx) = session_with_channel();
        let config = ClientConfig::new("topsecret");
        assert!(matches!(
            handle_auth_success(&session, &config, None),
            Err(ProtocolError::AuthState(_))
        ));
        assert!(!session.is_authenticated());
    }
}
