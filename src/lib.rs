//! Secure, type-tagged WebSocket messaging: an RSA/AES/HMAC handshake
//! layered over a raw WebSocket connection, an envelope codec supporting
//! transparent compression and encryption, and session/registry/liveness
//! primitives for both ends of the connection.
//!
//! This crate does not install a logging subscriber itself — call
//! [`init_tracing`] from a binary or test harness if you want one.

pub mod client;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod packet;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub mod prelude {
    pub use crate::client::{Client, ClientHandler};
    pub use crate::config::{ClientConfig, ServerConfig};
    pub use crate::envelope;
    pub use crate::error::{ProtocolError, Result};
    pub use crate::packet::{AnyMessage, Packet, PACKET_REGISTRY};
    pub use crate::server::{Server, ServerHandler};
    pub use crate::session::Session;
    pub use crate::transport::{serve, serve_listener, TransportEvents, TransportHandle};
}

/// Install a `tracing` subscriber reading `RUST_LOG` (default `info`),
/// for binaries and tests embedding this crate. Safe to call more than
/// once; only the first call takes effect.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
