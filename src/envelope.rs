//! Envelope codec: encodes a typed message as `{type, data}`, optionally
//! wrapped in a transparent compression or encryption envelope; decoding
//! unwraps recursively. Compression and encryption are mutually exclusive
//! per message — encryption always wins once a key exists.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde_json::Value;
use std::io::Read;

use crate::crypto::{self, SharedKey};
use crate::error::{ProtocolError, Result};
use crate::packet::{AnyMessage, Packet, PACKET_REGISTRY};

/// `-1` disables compression. `None` also disables it.
pub type CompressionThreshold = Option<i64>;

fn typed_envelope_json<T: Packet>(message: &T) -> Result<String> {
    let data = serde_json::to_value(message)
        .map_err(|e| ProtocolError::Codec(format!("serialize {}: {e}", T::TYPE_TAG)))?;
    let envelope = serde_json::json!({ "type": T::TYPE_TAG, "data": data });
    serde_json::to_string(&envelope).map_err(|e| ProtocolError::Codec(e.to_string()))
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    encoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Codec(format!("gzip: {e}")))?;
    Ok(out)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Codec(format!("gunzip: {e}")))?;
    Ok(out)
}

/// Encode `message` as exactly one envelope. If `key` is present the
/// message is AES-256-GCM encrypted (ignoring `compression_threshold`);
/// otherwise it is gzip-compressed when the typed envelope exceeds the
/// threshold and compression actually shrinks it, else sent as-is.
pub fn encode<T: Packet>(
    message: &T,
    key: Option<&SharedKey>,
    compression_threshold: CompressionThreshold,
) -> Result<String> {
    let typed_json = typed_envelope_json(message)?;

    if let Some(key) = key {
        let (ciphertext, iv) = crypto::encrypt(key, typed_json.as_bytes())?;
        let envelope = serde_json::json!({ "encrypted": true, "payload": ciphertext, "iv": iv });
        return serde_json::to_string(&envelope).map_err(|e| ProtocolError::Codec(e.to_string()));
    }

    match compression_threshold {
        Some(threshold) if threshold >= 0 && typed_json.len() as i64 > threshold => {
            match gzip(typed_json.as_bytes()) {
                Ok(compressed) if compressed.len() < typed_json.len() => {
                    let payload = BASE64.encode(&compressed);
                    let envelope = serde_json::json!({ "compressed": true, "payload": payload });
                    serde_json::to_string(&envelope).map_err(|e| ProtocolError::Codec(e.to_string()))
                }
                // Compression failure or no size win degrades gracefully
                // to the uncompressed typed envelope.
                _ => Ok(typed_json),
            }
        }
        _ => Ok(typed_json),
    }
}

/// Decode a wire frame into a registry-validated `AnyMessage`. Recurses
/// through encryption/compression wrappers until a typed envelope is
/// reached. The returned `AnyMessage::encrypted` records whether an
/// encrypted wrapper was unwrapped anywhere on the way there, so callers
/// that require post-auth encryption can reject a typed envelope that
/// arrived bare, at the session layer, which knows whether the session
/// has actually authenticated.
pub fn decode(text: &str, key: Option<&SharedKey>) -> Result<AnyMessage> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Codec(format!("invalid JSON: {e}")))?;
    decode_value(value, key, false)
}

fn decode_value(value: Value, key: Option<&SharedKey>, was_encrypted: bool) -> Result<AnyMessage> {
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolError::Codec("envelope is not a JSON object".into()))?;

    if obj.get("encrypted").and_then(Value::as_bool) == Some(true) {
        let key = key.ok_or_else(|| ProtocolError::crypto("decrypt", "no shared key for encrypted frame"))?;
        let payload = obj
            .get("payload")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Codec("encrypted envelope missing payload".into()))?;
        let iv = obj
            .get("iv")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Codec("encrypted envelope missing iv".into()))?;
        let plaintext = crypto::decrypt(key, payload, iv)?;
        let inner: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| ProtocolError::Codec(format!("invalid JSON after decrypt: {e}")))?;
        return decode_value(inner, Some(key), true);
    }

    if obj.get("compressed").and_then(Value::as_bool) == Some(true) {
        let payload = obj
            .get("payload")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Codec("compressed envelope missing payload".into()))?;
        let compressed = BASE64
            .decode(payload)
            .map_err(|e| ProtocolError::Codec(format!("invalid base64: {e}")))?;
        // A compression failure on decode is fatal to the frame.
        let plaintext = gunzip(&compressed)?;
        let inner: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| ProtocolError::Codec(format!("invalid JSON after gunzip: {e}")))?;
        return decode_value(inner, key, was_encrypted);
    }

    let tag = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Codec("typed envelope missing type".into()))?;
    let data = obj.get("data").cloned().unwrap_or(Value::Null);
    let mut any = PACKET_REGISTRY.decode(tag, data)?;
    any.encrypted = was_encrypted;
    Ok(any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketPing;

    #[test]
    fn round_trips_uncompressed_unencrypted() {
        let msg = PacketPing { timestamp: 123, sequence_id: 1 };
        let text = encode(&msg, None, None).unwrap();
        let any = decode(&text, None).unwrap();
        assert_eq!(any.tag, PacketPing::TYPE_TAG);
        let decoded: PacketPing = any.downcast().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trips_encrypted() {
        let key = crypto::SharedKey::generate();
        let msg = PacketPing { timestamp: 99, sequence_id: 7 };
        let text = encode(&msg, Some(&key), None).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["encrypted"], true);
        assert!(value.get("compressed").is_none());

        let any = decode(&text, Some(&key)).unwrap();
        assert!(any.encrypted);
        let decoded: PacketPing = any.downcast().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn bare_typed_envelope_decodes_with_encrypted_flag_unset() {
        let msg = PacketPing { timestamp: 1, sequence_id: 1 };
        let text = encode(&msg, None, None).unwrap();
        let any = decode(&text, None).unwrap();
        assert!(!any.encrypted);
    }

    #[test]
    fn encrypted_decode_without_key_fails() {
        let key = crypto::SharedKey::generate();
        let msg = PacketPing { timestamp: 1, sequence_id: 1 };
        let text = encode(&msg, Some(&key), None).unwrap();
        assert!(decode(&text, None).is_err());
    }

    #[test]
    fn compresses_when_over_threshold_and_shrinks() {
        let msg = crate::packet::PacketIdentification {
            client_identifier: "smp".repeat(200),
            metadata: Some("x".repeat(2000)),
        };
        let text = encode(&msg, None, Some(100)).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["compressed"], true);

        let any = decode(&text, None).unwrap();
        let decoded: crate::packet::PacketIdentification = any.downcast().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn skips_compression_below_threshold() {
        let msg = PacketPing { timestamp: 1, sequence_id: 1 };
        let text = encode(&msg, None, Some(512)).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("compressed").is_none());
        assert!(value.get("encrypted").is_none());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let text = r#"{"type":"PacketNope","data":{}}"#;
        assert!(matches!(decode(text, None), Err(ProtocolError::UnknownPacketType(_))));
    }
}
