//! Server side of the handshake: S0 awaiting-public-key → S1
//! awaiting-challenge-response → S2 authenticated.

use tracing::debug;

use crate::config::ServerConfig;
use crate::crypto::{self, SharedKey};
use crate::envelope::CompressionThreshold;
use crate::error::{ProtocolError, Result};
use crate::packet::{
    AnyMessage, PacketAuthFailed, PacketAuthSuccess, PacketChallenge, PacketChallengeResponse,
    PacketPublicKey, PacketSharedSecret,
};
use crate::session::Session;

/// Core handshake tags, receivable by a server in any order they can
/// legally appear. Any other core-protocol tag arriving on a session
/// that has already authenticated is a protocol error (S2's "any other
/// handshake message").
pub const SERVER_HANDSHAKE_TAGS: &[&str] = &[
    PacketPublicKey::TYPE_TAG,
    PacketSharedSecret::TYPE_TAG,
    PacketChallenge::TYPE_TAG,
    PacketChallengeResponse::TYPE_TAG,
    PacketAuthSuccess::TYPE_TAG,
    PacketAuthFailed::TYPE_TAG,
];

/// Outcome of handing a handshake-phase message to the server state
/// machine, for the caller (see `server.rs`) to act on — e.g. closing the
/// transport with the right code.
pub enum Outcome {
    /// Handshake not yet complete; nothing further for the caller to do.
    Continue,
    /// Phase 5 reached: `session.authenticated` is now true.
    Authenticated,
    /// MAC verification failed; `PacketAuthFailed` was already sent.
    /// Caller must close with 4001.
    AuthRejected,
}

/// S0: receive the client's public key, generate and wrap a shared key,
/// and issue the challenge. Sends `PacketSharedSecret` (unencrypted, since
/// no key exists yet) then `PacketChallenge` (encrypted, since by then the
/// key has been published to the session).
pub fn handle_public_key(
    session: &Session,
    any: &AnyMessage,
    compression_threshold: CompressionThreshold,
) -> Result<Outcome> {
    if session.shared_key().is_some() {
        return Err(ProtocolError::AuthState("second PacketPublicKey after S0".into()));
    }

    let packet: PacketPublicKey = any.downcast()?;
    let public_key = crypto::parse_public_key_base64(&packet.public_key)?;

    let key = SharedKey::generate();
    let encrypted_secret = crypto::wrap_shared_key(&public_key, &key)?;
    session.send(&PacketSharedSecret { encrypted_secret }, compression_threshold)?;

    session.set_shared_key(key);

    let challenge = crypto::generate_challenge();
    session.set_pending_challenge(challenge.clone());
    session.send(&PacketChallenge { challenge }, compression_threshold)?;

    debug!(session = session.id(), "S0 -> S1 (challenge issued)");
    Ok(Outcome::Continue)
}

/// S1: verify the challenge response under the server's pre-shared
/// secret. The pending challenge is cleared regardless of outcome.
pub fn handle_challenge_response(
    session: &Session,
    config: &ServerConfig,
    any: &AnyMessage,
    compression_threshold: CompressionThreshold,
) -> Result<Outcome> {
    if session.is_authenticated() {
        return Err(ProtocolError::AuthState("challenge response after authentication".into()));
    }

    let challenge = session.take_pending_challenge().ok_or_else(|| {
        ProtocolError::AuthState("challenge response received outside S1".into())
    })?;
    let packet: PacketChallengeResponse = any.downcast()?;
    let expected = crypto::sign_challenge(&challenge, &config.pre_shared_secret)?;

    if crypto::verify_challenge_response(&expected, &packet.response) {
        session.set_authenticated();
        session.send(
            &PacketAuthSuccess { message: "Authenticated".to_string() },
            compression_threshold,
        )?;
        debug!(session = session.id(), "S1 -> S2 (authenticated)");
        Ok(Outcome::Authenticated)
    } else {
        session.send(
            &PacketAuthFailed { reason: "Invalid credentials".to_string() },
            compression_threshold,
        )?;
        debug!(session = session.id(), "S1 -> rejected (MAC mismatch)");
        Ok(Outcome::AuthRejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::transport::OutgoingFrame;
    use tokio::sync::mpsc;

    fn session_with_channel() -> (Session, mpsc::UnboundedReceiver<OutgoingFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(tx), rx)
    }

    #[tokio::test]
    async fn full_handshake_authenticates() {
        let (session, mut rx) = session_with_channel();
        let config = ServerConfig::new("topsecret");

        let client_keys = KeyPair::generate().unwrap();
        let public_key_b64 = client_keys.public_key_base64().unwrap();
        let packet = PacketPublicKey { public_key: public_key_b64 };
        let any = AnyMessage::new(PacketPublicKey::TYPE_TAG, serde_json::to_value(&packet).unwrap());

        handle_public_key(&session, &any, None).unwrap();
        assert!(session.shared_key().is_some());

        // Drain the two frames the server just sent: PacketSharedSecret
        // (unencrypted) then PacketChallenge (encrypted).
        let frame1 = rx.recv().await.unwrap();
        let OutgoingFrame::Text(secret_text) = frame1 else { panic!("expected text frame") };
        let secret_any = crate::envelope::decode(&secret_text, None).unwrap();
        let secret_packet: PacketSharedSecret = secret_any.downcast().unwrap();
        let shared_key = client_keys.unwrap_shared_key(&secret_packet.encrypted_secret).unwrap();

        let frame2 = rx.recv().await.unwrap();
        let OutgoingFrame::Text(challenge_text) = frame2 else { panic!("expected text frame") };
        let challenge_any = crate::envelope::decode(&challenge_text, Some(&shared_key)).unwrap();
        let challenge_packet: PacketChallenge = challenge_any.downcast().unwrap();

        let response = crypto::sign_challenge(&challenge_packet.challenge, "topsecret").unwrap();
        let response_packet = PacketChallengeResponse { response };
        let response_any = AnyMessage::new(
            PacketChallengeResponse::TYPE_TAG,
            serde_json::to_value(&response_packet).unwrap(),
        );

        let outcome = handle_challenge_response(&session, &config, &response_any, None).unwrap();
        assert!(matches!(outcome, Outcome::Authenticated));
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn wrong_secret_rejects_and_clears_pending_challenge() {
        let (session, _rx) = session_with_channel();
        let config = ServerConfig::new("topsecret");

        session.set_shared_key(crate::crypto::SharedKey::generate());
        let challenge = crypto::generate_challenge();
        session.set_pending_challenge(challenge.clone());

        let response = crypto::sign_challenge(&challenge, "wrong").unwrap();
        let packet = PacketChallengeResponse { response };
        let any = AnyMessage::new(PacketChallengeResponse::TYPE_TAG, serde_json::to_value(&packet).unwrap());

        let outcome = handle_challenge_response(&session, &config, &any, None).unwrap();
        assert!(matches!(outcome, Outcome::AuthRejected));
        assert!(!session.is_authenticated());
        // Cleared regardless of outcome.
        assert!(session.take_pending_challenge().is_none());
    }

    #[tokio::test]
    async fn second_public_key_is_rejected() {
        let (session, _rx) = session_with_channel();
        session.set_shared_key(crate::crypto::SharedKey::generate());

        let client_keys = KeyPair::generate().unwrap();
        let packet = PacketPublicKey { public_key: client_keys.public_key_base64().unwrap() };
        let any = AnyMessage::new(PacketPublicKey::TYPE_TAG, serde_json::to_value(&packet).unwrap());

        assert!(matches!(handle_public_key(&session, &any, None), Err(ProtocolError::AuthState(_))));
    }
}
