//! Tag-dispatched message family: the ten core handshake/liveness packets,
//! plus a process-wide registry that lets the embedding application add its
//! own kinds without the core knowing about them ahead of time.
//!
//! Core kinds form a closed set; a process-wide registry handles
//! everything else so application packets don't have to live in the same
//! enum as the protocol's own, generalizing the tag-dispatched
//! `#[serde(tag = "type")]` enums used elsewhere for signaling.

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{ProtocolError, Result};

/// Anything that can cross the wire as a typed envelope's `data`. Core
/// packets and application-defined packets both implement this.
pub trait Packet: Serialize + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static {
    /// The short name carried in the envelope's `type` field.
    const TYPE_TAG: &'static str;
}

macro_rules! packet {
    ($name:ident, $tag:literal, { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            $(pub $field: $ty,)*
        }
        impl Packet for $name {
            const TYPE_TAG: &'static str = $tag;
        }
    };
}

packet!(PacketPublicKey, "PacketPublicKey", { public_key: String });
packet!(PacketSharedSecret, "PacketSharedSecret", { encrypted_secret: String });
packet!(PacketChallenge, "PacketChallenge", { challenge: String });
packet!(PacketChallengeResponse, "PacketChallengeResponse", { response: String });
packet!(PacketAuthSuccess, "PacketAuthSuccess", { message: String });
packet!(PacketAuthFailed, "PacketAuthFailed", { reason: String });

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketIdentification {
    pub client_identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}
impl Packet for PacketIdentification {
    const TYPE_TAG: &'static str = "PacketIdentification";
}

packet!(PacketVersion, "PacketVersion", {
    protocol_version: String,
    client_name: String,
    client_version: String,
});

packet!(PacketPing, "PacketPing", {
    timestamp: u64,
    sequence_id: u32,
});

packet!(PacketPong, "PacketPong", {
    client_timestamp: u64,
    server_timestamp: u64,
    sequence_id: u32,
});

/// A decoded message whose concrete type is not known at compile time: an
/// application-defined packet, or a core packet the caller wants to inspect
/// generically before downcasting.
#[derive(Debug)]
pub struct AnyMessage {
    pub tag: String,
    /// Whether the outermost wrapper this message arrived in was an
    /// encrypted envelope. Set by `envelope::decode`; messages built
    /// directly via `new` default to `false`.
    pub encrypted: bool,
    value: serde_json::Value,
}

impl AnyMessage {
    pub fn new(tag: impl Into<String>, value: serde_json::Value) -> Self {
        AnyMessage { tag: tag.into(), encrypted: false, value }
    }

    /// Deserialize into a concrete, registered packet type. Fails if the
    /// tag doesn't match `T::TYPE_TAG` or the JSON shape doesn't match.
    pub fn downcast<T: Packet>(&self) -> Result<T> {
        if self.tag != T::TYPE_TAG {
            return Err(ProtocolError::Codec(format!(
                "expected tag {}, found {}",
                T::TYPE_TAG,
                self.tag
            )));
        }
        serde_json::from_value(self.value.clone())
            .map_err(|e| ProtocolError::Codec(format!("malformed {}: {e}", self.tag)))
    }
}

type DecodeFn = Box<dyn Fn(serde_json::Value) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// Process-wide bidirectional mapping between a packet's short type tag and
/// a decoder able to materialize it from JSON. Registration is additive and
/// idempotent for the same tag; an unregistered tag on receive is a hard
/// protocol error.
pub struct PacketRegistry {
    decoders: RwLock<HashMap<&'static str, DecodeFn>>,
}

static BUILTIN_TAGS: &[&str] = &[
    PacketPublicKey::TYPE_TAG,
    PacketSharedSecret::TYPE_TAG,
    PacketChallenge::TYPE_TAG,
    PacketChallengeResponse::TYPE_TAG,
    PacketAuthSuccess::TYPE_TAG,
    PacketAuthFailed::TYPE_TAG,
    PacketIdentification::TYPE_TAG,
    PacketVersion::TYPE_TAG,
    PacketPing::TYPE_TAG,
    PacketPong::TYPE_TAG,
];

impl PacketRegistry {
    fn empty() -> Self {
        PacketRegistry { decoders: RwLock::new(HashMap::new()) }
    }

    /// Register a packet kind so it can be looked up by tag on decode.
    /// Safe to call more than once for the same `T`.
    pub fn register<T: Packet>(&self) {
        let decode: DecodeFn = Box::new(|value: serde_json::Value| {
            let parsed: T = serde_json::from_value(value)
                .map_err(|e| ProtocolError::Codec(format!("malformed {}: {e}", T::TYPE_TAG)))?;
            Ok(Box::new(parsed) as Box<dyn Any + Send + Sync>)
        });
        self.decoders.write().unwrap().insert(T::TYPE_TAG, decode);
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.decoders.read().unwrap().contains_key(tag)
    }

    /// Decode a `{type, data}` pair into an `AnyMessage`, failing if the
    /// tag isn't registered at all (even the concrete type downcast is
    /// deferred to `AnyMessage::downcast`).
    pub fn decode(&self, tag: &str, data: serde_json::Value) -> Result<AnyMessage> {
        if !self.is_registered(tag) {
            return Err(ProtocolError::UnknownPacketType(tag.to_string()));
        }
        Ok(AnyMessage::new(tag, data))
    }
}

/// The process-wide registry, pre-populated with the ten core kinds.
/// Application kinds are added with `PACKET_REGISTRY.register::<T>()`
/// before the first connection is accepted or opened.
pub static PACKET_REGISTRY: Lazy<PacketRegistry> = Lazy::new(|| {
    let registry = PacketRegistry::empty();
    registry.register::<PacketPublicKey>();
    registry.register::<PacketSharedSecret>();
    registry.register::<PacketChallenge>();
    registry.register::<PacketChallengeResponse>();
    registry.register::<PacketAuthSuccess>();
    registry.register::<PacketAuthFailed>();
    registry.register::<PacketIdentification>();
    registry.register::<PacketVersion>();
    registry.register::<PacketPing>();
    registry.register::<PacketPong>();
    registry
});

pub fn is_builtin_tag(tag: &str) -> bool {
    BUILTIN_TAGS.contains(&tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PacketGameUpdate {
        action: String,
        data: String,
    }
    impl Packet for PacketGameUpdate {
        const TYPE_TAG: &'static str = "PacketGameUpdate";
    }

    #[test]
    fn builtin_tags_are_registered() {
        assert!(PACKET_REGISTRY.is_registered(PacketPing::TYPE_TAG));
        assert!(PACKET_REGISTRY.is_registered(PacketPong::TYPE_TAG));
    }

    #[test]
    fn unregistered_tag_is_a_hard_error() {
        let err = PACKET_REGISTRY.decode("PacketDoesNotExist", serde_json::json!({}));
        assert!(matches!(err, Err(ProtocolError::UnknownPacketType(_))));
    }

    #[test]
    fn application_packet_registers_and_round_trips() {
        PACKET_REGISTRY.register::<PacketGameUpdate>();
        let original = PacketGameUpdate { action: "move".into(), data: "1,2,3".into() };
        let value = serde_json::to_value(&original).unwrap();
        let any = PACKET_REGISTRY.decode(PacketGameUpdate::TYPE_TAG, value).unwrap();
        let decoded: PacketGameUpdate = any.downcast().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn registration_is_idempotent() {
        PACKET_REGISTRY.register::<PacketGameUpdate>();
        PACKET_REGISTRY.register::<PacketGameUpdate>();
        assert!(PACKET_REGISTRY.is_registered(PacketGameUpdate::TYPE_TAG));
    }
}
