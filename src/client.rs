//! Client application layer: connects to a server, drives the handshake,
//! and runs the liveness controller (ping scheduling, RTT tracking,
//! fixed-delay reconnect) on top of the transport adapter.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::crypto::KeyPair;
use crate::envelope;
use crate::error::{ProtocolError, Result};
use crate::handshake::client as handshake;
use crate::packet::{
    AnyMessage, PacketAuthFailed, PacketAuthSuccess, PacketChallenge, PacketPing, PacketPong,
    PacketSharedSecret, PacketVersion,
};
use crate::session::Session;
use crate::transport::{self, OutgoingFrame, TransportEvents, TransportHandle};

/// Application hooks. Handshake mechanics never surface here.
pub trait ClientHandler: Send + Sync {
    fn on_connect(&self, session: &Arc<Session>);
    fn on_packet(&self, session: &Arc<Session>, message: AnyMessage);
    fn on_disconnect(&self, code: u16, reason: &str);
    fn on_authenticated(&self, _session: &Arc<Session>) {}
    fn on_version_exchange(&self, _session: &Arc<Session>, _version: &PacketVersion) {}
    fn on_reconnect_failed(&self) {}
}

struct ConnectionState {
    session: Option<Arc<Session>>,
    keys: Option<KeyPair>,
}

/// Tracks round-trip latency as an exponential moving average, weight
/// 1/8 on each new sample — the usual TCP-RTO-style smoothing constant.
struct Latency {
    ema_millis: Option<f64>,
}

impl Latency {
    fn sample(&mut self, rtt: Duration) {
        let millis = rtt.as_secs_f64() * 1000.0;
        self.ema_millis = Some(match self.ema_millis {
            Some(prev) => prev * 0.875 + millis * 0.125,
            None => millis,
        });
    }
}

pub struct Client<H: ClientHandler> {
    config: ClientConfig,
    handler: H,
    url: String,
    state: RwLock<ConnectionState>,
    pending_pings: DashMap<u32, Instant>,
    next_sequence: AtomicU32,
    latency: std::sync::Mutex<Latency>,
    reconnect_attempts: AtomicI64,
    shutting_down: AtomicBool,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
    /// Set right after construction so `TransportEvents::closed` (which
    /// only has `&self`) can obtain an owned `Arc<Self>` to spawn the
    /// reconnect task on.
    self_handle: OnceCell<Weak<Client<H>>>,
}

impl<H: ClientHandler + 'static> Client<H> {
    pub fn new(url: impl Into<String>, config: ClientConfig, handler: H) -> Arc<Self> {
        let client = Arc::new(Client {
            config,
            handler,
            url: url.into(),
            state: RwLock::new(ConnectionState { session: None, keys: None }),
            pending_pings: DashMap::new(),
            next_sequence: AtomicU32::new(0),
            latency: std::sync::Mutex::new(Latency { ema_millis: None }),
            reconnect_attempts: AtomicI64::new(0),
            shutting_down: AtomicBool::new(false),
            pings_sent: AtomicU64::new(0),
            pongs_received: AtomicU64::new(0),
            self_handle: OnceCell::new(),
        });
        let _ = client.self_handle.set(Arc::downgrade(&client));
        client
    }

    /// Latency EMA in milliseconds, once at least one pong has been
    /// observed.
    pub fn latency_millis(&self) -> Option<f64> {
        self.latency.lock().unwrap().ema_millis
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::SeqCst)
    }

    pub fn pongs_received(&self) -> u64 {
        self.pongs_received.load(Ordering::SeqCst)
    }

    /// `(pingsSent - pongsReceived) / pingsSent`, or `0.0` before any ping
    /// has been sent.
    pub fn packet_loss(&self) -> f64 {
        let sent = self.pings_sent();
        if sent == 0 {
            return 0.0;
        }
        let received = self.pongs_received();
        (sent - received.min(sent)) as f64 / sent as f64
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.state.read().unwrap().session.clone()
    }

    /// Connect, retrying with the configured backoff until the first
    /// connection succeeds or the attempt budget is exhausted. Returns as
    /// soon as the transport is up; the handshake itself runs
    /// asynchronously via `opened`/`text`. If the session later drops
    /// unexpectedly, reconnection (subject to `auto_reconnect` and the
    /// same attempt budget) is scheduled from `closed` and runs in the
    /// background — this call does not wait for it.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.shutting_down.store(false, Ordering::SeqCst);
        self.run_connection_with_reconnect().await
    }

    pub fn disconnect(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(session) = self.session() {
            let _ = session.close(1000, "client disconnect");
        }
    }

    async fn run_connection_with_reconnect(self: &Arc<Self>) -> Result<()> {
        loop {
            let outcome = transport::connect(&self.url, self.clone(), self.config.connection_timeout).await;
            match outcome {
                Ok(_handle) => {
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    self.spawn_ping_loop();
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "connect failed");
                    if self.shutting_down.load(Ordering::SeqCst) || !self.config.auto_reconnect {
                        return Err(e);
                    }
                    if !self.reserve_reconnect_attempt() {
                        self.handler.on_reconnect_failed();
                        return Err(e);
                    }
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    /// Entered from `closed()` when an already-established session drops
    /// unexpectedly. Waits out `reconnect_delay` before the first retry
    /// (the initial `connect()` call has no such wait; a scheduled
    /// reconnect does), then hands off to the same attempt-budgeted loop
    /// `connect()` uses.
    async fn spawn_reconnect_after_drop(self: Arc<Self>) {
        tokio::time::sleep(self.config.reconnect_delay).await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if !self.reserve_reconnect_attempt() {
            self.handler.on_reconnect_failed();
            return;
        }
        if let Err(e) = self.run_connection_with_reconnect().await {
            warn!(error = %e, "reconnect after disconnect failed");
        }
    }

    /// `-1` means unlimited attempts.
    fn reserve_reconnect_attempt(&self) -> bool {
        if self.config.max_reconnect_attempts < 0 {
            return true;
        }
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        attempt <= self.config.max_reconnect_attempts
    }

    fn spawn_ping_loop(self: &Arc<Self>) {
        if !self.config.enable_ping {
            return;
        }
        let this = self.clone();
        let interval = self.config.ping_interval;
        // A ping without a matching pong after two intervals counts as a
        // loss; the scheduler never blocks on outstanding pings, it just
        // stops tracking them for latency purposes.
        let loss_threshold = interval * 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(session) = this.session() else { break };
                if this.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                this.pending_pings.retain(|_, sent_at| sent_at.elapsed() < loss_threshold);

                let sequence_id = this.next_sequence.fetch_add(1, Ordering::SeqCst);
                let ping = PacketPing { timestamp: now_millis(), sequence_id };
                if session.send(&ping, this.config.compression_threshold).is_err() {
                    break;
                }
                this.pending_pings.insert(sequence_id, Instant::now());
                this.pings_sent.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    fn handle_text(&self, session: &Arc<Session>, payload: String) {
        let key = session.shared_key();
        let any = match envelope::decode(&payload, key.as_ref()) {
            Ok(any) => any,
            Err(e) => {
                warn!(session = session.id(), error = %e, "failed to decode frame");
                if let Some(code) = e.close_code() {
                    let _ = session.close(code, e.to_string());
                }
                return;
            }
        };

        if let Err(e) = self.dispatch(session, any) {
            warn!(session = session.id(), error = %e, "handshake error");
            if let Some(code) = e.close_code() {
                let _ = session.close(code, e.to_string());
            }
        }
    }

    fn dispatch(&self, session: &Arc<Session>, any: AnyMessage) -> Result<()> {
        let threshold = self.config.compression_threshold;

        if !session.is_authenticated() {
            return match any.tag.as_str() {
                tag if tag == PacketSharedSecret::TYPE_TAG => {
                    let keys_guard = self.state.read().unwrap();
                    let keys = keys_guard
                        .keys
                        .as_ref()
                        .ok_or_else(|| ProtocolError::AuthState("no keypair for this session".into()))?;
                    handshake::handle_shared_secret(session, keys, &any).map(|_| ())
                }
                tag if tag == PacketChallenge::TYPE_TAG => {
                    handshake::handle_challenge(session, &self.config, &any, threshold).map(|_| ())
                }
                tag if tag == PacketAuthSuccess::TYPE_TAG => {
                    match handshake::handle_auth_success(session, &self.config, threshold)? {
                        handshake::Outcome::Authenticated => {
                            self.handler.on_authenticated(session);
                            Ok(())
                        }
                        _ => Ok(()),
                    }
                }
                tag if tag == PacketAuthFailed::TYPE_TAG => {
                    let packet: PacketAuthFailed = any.downcast()?;
                    self.handler.on_disconnect(4001, &packet.reason);
                    session.close(4001, packet.reason)
                }
                // Advisory and direction-agnostic; may arrive at any point
                // after transport-open, handshake included.
                tag if tag == PacketVersion::TYPE_TAG => {
                    let packet: PacketVersion = any.downcast()?;
                    self.handler.on_version_exchange(session, &packet);
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
            tag if tag == PacketPong::TYPE_TAG => {
                let packet: PacketPong = any.downcast()?;
                // Unknown or already-consumed sequence ids are dropped
                // silently rather than counted.
                if let Some((_, sent_at)) = self.pending_pings.remove(&packet.sequence_id) {
                    self.latency.lock().unwrap().sample(sent_at.elapsed());
                    self.pongs_received.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
            // The server always responds to a ping; the client does the
            // same for symmetry when the server initiates one.
            tag if tag == PacketPing::TYPE_TAG => {
                let packet: PacketPing = any.downcast()?;
                session.send(
                    &PacketPong {
                        client_timestamp: packet.timestamp,
                        server_timestamp: now_millis(),
                        sequence_id: packet.sequence_id,
                    },
                    threshold,
                )
            }
            tag if tag == PacketVersion::TYPE_TAG => {
                let packet: PacketVersion = any.downcast()?;
                self.handler.on_version_exchange(session, &packet);
                Ok(())
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

impl<H: ClientHandler + 'static> TransportEvents for Client<H> {
    fn opened(&self, _handle: TransportHandle, outgoing: UnboundedSender<OutgoingFrame>) {
        self.pending_pings.clear();
        self.pings_sent.store(0, Ordering::SeqCst);
        self.pongs_received.store(0, Ordering::SeqCst);
        *self.latency.lock().unwrap() = Latency { ema_millis: None };

        let session = Arc::new(Session::new(outgoing));
        let keys = match handshake::start(&session, self.config.compression_threshold) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to start handshake");
                let _ = session.close(4001, e.to_string());
                return;
            }
        };

        {
            let mut state = self.state.write().unwrap();
            state.session = Some(session.clone());
            state.keys = Some(keys);
        }

        info!(session = session.id(), "connected");
        self.handler.on_connect(&session);
    }

    fn text(&self, _handle: &TransportHandle, payload: String) {
        let Some(session) = self.session() else { return };
        self.handle_text(&session, payload);
    }

    fn closed(&self, _handle: &TransportHandle, code: u16, reason: String) {
        self.handler.on_disconnect(code, &reason);
        *self.state.write().unwrap() = ConnectionState { session: None, keys: None };
        self.pending_pings.clear();

        if self.shutting_down.load(Ordering::SeqCst) || !self.config.auto_reconnect {
            return;
        }
        let Some(this) = self.self_handle.get().and_then(Weak::upgrade) else { return };
        tokio::spawn(async move {
            this.spawn_reconnect_after_drop().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingHandler {
        connected: std::sync::Mutex<bool>,
        disconnects: std::sync::Mutex<Vec<(u16, String)>>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            RecordingHandler { connected: std::sync::Mutex::new(false), disconnects: std::sync::Mutex::new(Vec::new()) }
        }
    }

    impl ClientHandler for RecordingHandler {
        fn on_connect(&self, _session: &Arc<Session>) {
            *self.connected.lock().unwrap() = true;
        }
        fn on_packet(&self, _session: &Arc<Session>, _message: AnyMessage) {}
        fn on_disconnect(&self, code: u16, reason: &str) {
            self.disconnects.lock().unwrap().push((code, reason.to_string()));
        }
    }

    #[test]
    fn reconnect_attempt_budget_is_respected() {
        let config = {
            let mut c = ClientConfig::new("secret");
            c.max_reconnect_attempts = 2;
            c
        };
        let client = Client::new("ws://example.invalid", config, RecordingHandler::new());
        assert!(client.reserve_reconnect_attempt());
        assert!(client.reserve_reconnect_attempt());
        assert!(!client.reserve_reconnect_attempt());
    }

    #[test]
    fn unlimited_reconnect_budget_never_exhausts() {
        let config = {
            let mut c = ClientConfig::new("secret");
            c.max_reconnect_attempts = -1;
            c
        };
        let client = Client::new("ws://example.invalid", config, RecordingHandler::new());
        for _ in 0..1000 {
            assert!(client.reserve_reconnect_attempt());
        }
    }

    #[test]
    fn latency_ema_converges_towards_samples() {
        let mut latency = Latency { ema_millis: None };
        latency.sample(Duration::from_millis(100));
        assert_eq!(latency.ema_millis, Some(100.0));
        latency.sample(Duration::from_millis(100));
        assert!((latency.ema_millis.unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn packet_loss_is_zero_with_no_pings_sent() {
        let client = Client::new("ws://example.invalid", ClientConfig::new("secret"), RecordingHandler::new());
        assert_eq!(client.packet_loss(), 0.0);
    }

    #[test]
    fn packet_loss_reflects_unanswered_pings() {
        let client = Client::new("ws://example.invalid", ClientConfig::new("secret"), RecordingHandler::new());
        client.pings_sent.store(10, Ordering::SeqCst);
        client.pongs_received.store(7, Ordering::SeqCst);
        assert!((client.packet_loss() - 0.3).abs() < 1e-9);
    }
}
