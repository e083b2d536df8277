//! The handshake state machine: server and client sides are mirrored but
//! implemented independently since their states, triggers, and side
//! effects differ. Both sides derive "which state am I in" from the
//! session's own fields (`shared_key`, `authenticated`,
//! `pending_challenge`) rather than tracking a separate phase enum — those
//! fields already fully determine the state, so a second copy of it
//! would just be able to drift out of sync.

pub mod client;
pub mod server;
