//! Crypto primitives: pure functions for key generation, asymmetric
//! wrap/unwrap of a symmetric key, authenticated symmetric encrypt/decrypt,
//! keyed MAC, random challenge generation, and canonical string encodings.
//!
//! Algorithms are fixed by the wire contract and are not configurable:
//! RSA-2048/OAEP-SHA256 for asymmetric wrap, AES-256-GCM for symmetric
//! encryption, HMAC-SHA256 for challenge MACs.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{ProtocolError, Result};

const RSA_BITS: usize = 2048;
const AES_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const CHALLENGE_LEN: usize = 32;

/// The per-session AES-256 key, once derived or received.
#[derive(Clone)]
pub struct SharedKey(pub [u8; AES_KEY_LEN]);

impl SharedKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; AES_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        SharedKey(bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| ProtocolError::crypto("decode_shared_key", e))?;
        let arr: [u8; AES_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| ProtocolError::crypto("decode_shared_key", "wrong length"))?;
        Ok(SharedKey(arr))
    }
}

/// An RSA-2048 keypair used once, client-side, to receive the wrapped
/// shared key during the handshake.
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| ProtocolError::crypto("generate_keypair", e))?;
        let public = RsaPublicKey::from(&private);
        Ok(KeyPair { private, public })
    }

    /// X.509 SubjectPublicKeyInfo, base64-encoded, as carried on the wire
    /// in `PacketPublicKey`.
    pub fn public_key_base64(&self) -> Result<String> {
        let der = self
            .public
            .to_public_key_der()
            .map_err(|e| ProtocolError::crypto("encode_public_key", e))?;
        Ok(BASE64.encode(der.as_bytes()))
    }

    /// Unwrap a shared key that was wrapped under this keypair's public key.
    pub fn unwrap_shared_key(&self, encrypted_secret_b64: &str) -> Result<SharedKey> {
        let ciphertext = BASE64
            .decode(encrypted_secret_b64)
            .map_err(|e| ProtocolError::crypto("unwrap_shared_key", e))?;
        let plaintext = self
            .private
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .map_err(|e| ProtocolError::crypto("unwrap_shared_key", e))?;
        let arr: [u8; AES_KEY_LEN] = plaintext
            .try_into()
            .map_err(|_| ProtocolError::crypto("unwrap_shared_key", "wrong length"))?;
        Ok(SharedKey(arr))
    }
}

/// Parse a base64 X.509 SPKI public key as received in `PacketPublicKey`.
pub fn parse_public_key_base64(public_key_b64: &str) -> Result<RsaPublicKey> {
    let der = BASE64
        .decode(public_key_b64)
        .map_err(|e| ProtocolError::crypto("parse_public_key", e))?;
    RsaPublicKey::from_public_key_der(&der).map_err(|e| ProtocolError::crypto("parse_public_key", e))
}

/// Wrap a freshly generated shared key under the client's public key,
/// server-side, producing the base64 payload for `PacketSharedSecret`.
pub fn wrap_shared_key(public_key: &RsaPublicKey, key: &SharedKey) -> Result<String> {
    let mut rng = rand::thread_rng();
    let ciphertext = public_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &key.0)
        .map_err(|e| ProtocolError::crypto("wrap_shared_key", e))?;
    Ok(BASE64.encode(ciphertext))
}

/// AES-256-GCM encrypt with a fresh random 12-byte nonce. Returns
/// (ciphertext_b64, nonce_b64).
pub fn encrypt(key: &SharedKey, plaintext: &[u8]) -> Result<(String, String)> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| ProtocolError::crypto("encrypt", e))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| ProtocolError::crypto("encrypt", e))?;
    Ok((BASE64.encode(ciphertext), BASE64.encode(nonce_bytes)))
}

/// AES-256-GCM decrypt.
pub fn decrypt(key: &SharedKey, ciphertext_b64: &str, nonce_b64: &str) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| ProtocolError::crypto("decrypt", e))?;
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| ProtocolError::crypto("decrypt", e))?;
    let nonce_bytes = BASE64
        .decode(nonce_b64)
        .map_err(|e| ProtocolError::crypto("decrypt", e))?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(ProtocolError::crypto("decrypt", "invalid nonce length"));
    }
    let nonce = Nonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|e| ProtocolError::crypto("decrypt", e))
}

/// Generate a fresh 32-byte challenge, base64-encoded for the wire.
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256(challenge, pre-shared secret), base64-encoded.
pub fn sign_challenge(challenge_b64: &str, pre_shared_secret: &str) -> Result<String> {
    let challenge = BASE64
        .decode(challenge_b64)
        .map_err(|e| ProtocolError::crypto("sign_challenge", e))?;
    let mut mac = HmacSha256::new_from_slice(pre_shared_secret.as_bytes())
        .map_err(|e| ProtocolError::crypto("sign_challenge", e))?;
    mac.update(&challenge);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Constant-time comparison of the expected and received MAC, both
/// base64-encoded.
pub fn verify_challenge_response(expected_b64: &str, received_b64: &str) -> bool {
    let (Ok(expected), Ok(received)) = (BASE64.decode(expected_b64), BASE64.decode(received_b64))
    else {
        return false;
    };
    expected.len() == received.len() && bool::from(expected.ct_eq(&received))
}
