//! Transport adapters: thin shims exposing the three transport events
//! (opened, text received, closed) to the rest of the system. The core
//! never reaches into transport internals except to send a text frame on
//! a handle and to close a handle with an application close code and
//! reason.
//!
//! One concrete adapter is provided, built on `tokio-tungstenite`, since a
//! protocol library with no working transport isn't embeddable (see
//! DESIGN.md's resolution of the "single adapter vs. abstraction" open
//! question).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};

/// Opaque, transport-assigned connection handle. The core only ever
/// stores and compares these; it never interprets the contents.
pub type TransportHandle = String;

/// The two things the core is allowed to ask the transport to do.
#[derive(Debug, Clone)]
pub enum OutgoingFrame {
    Text(String),
    Close(u16, String),
}

/// The three events a transport adapter delivers into the core.
/// Deliveries for the *same* handle are serialized by the adapter; the
/// core relies on this for per-session receive ordering.
pub trait TransportEvents: Send + Sync {
    fn opened(&self, handle: TransportHandle, outgoing: UnboundedSender<OutgoingFrame>);
    fn text(&self, handle: &TransportHandle, payload: String);
    fn closed(&self, handle: &TransportHandle, code: u16, reason: String);
}

fn close_frame(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame { code: CloseCode::from(code), reason: reason.into() }))
}

async fn run_connection<S, H>(stream: WebSocketStream<S>, handle: TransportHandle, events: Arc<H>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: TransportEvents + 'static,
{
    let (mut write, mut read) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutgoingFrame>();

    events.opened(handle.clone(), tx);

    let writer_handle = handle.clone();
    let _writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                OutgoingFrame::Text(text) => Message::Text(text),
                OutgoingFrame::Close(code, reason) => close_frame(code, reason),
            };
            let is_close = matches!(message, Message::Close(_));
            if let Err(e) = write.send(message).await {
                warn!(handle = %writer_handle, error = %e, "transport write failed");
                break;
            }
            if is_close {
                let _ = write.close().await;
                break;
            }
        }
    });

    let (mut close_code, mut close_reason) = (1000u16, String::new());
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => events.text(&handle, text),
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    close_code = frame.code.into();
                    close_reason = frame.reason.to_string();
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(handle = %handle, error = %e, "transport read error");
                break;
            }
        }
    }

    // The write half stops on its own once `tx` (dropped with this
    // function's scope) closes `rx`; no explicit abort needed.
    events.closed(&handle, close_code, close_reason);
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_handle(prefix: &str) -> TransportHandle {
    format!("{prefix}-{}", NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

/// Accept WebSocket connections on `addr` until the listener errors,
/// dispatching each to `events`. Runs until cancelled by the caller
/// (typically via `tokio::select!` against a shutdown signal).
pub async fn serve<A: ToSocketAddrs, H: TransportEvents + 'static>(addr: A, events: Arc<H>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProtocolError::Transport(format!("bind failed: {e}")))?;

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let events = events.clone();
        let handle = next_handle(&addr.to_string());
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => run_connection(ws, handle, events).await,
                Err(e) => warn!(%handle, error = %e, "WebSocket upgrade failed"),
            }
        });
    }
}

/// Accept WebSocket connections over an already-bound `TcpListener`, for
/// callers that need to choose the bind address themselves (e.g. port 0).
pub async fn serve_listener<H: TransportEvents + 'static>(listener: TcpListener, events: Arc<H>) -> Result<()> {
    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(|e| ProtocolError::Transport(format!("accept failed: {e}")))?;
        let events = events.clone();
        let handle = next_handle(&addr.to_string());
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => run_connection(ws, handle, events).await,
                Err(e) => warn!(%handle, error = %e, "WebSocket upgrade failed"),
            }
        });
    }
}

/// Connect to a server, bounded by `connect_timeout` (exceeding it yields
/// `ProtocolError::ConnectionTimeout`). Spawns the connection's
/// reader/writer tasks and returns once `events.opened` has fired.
pub async fn connect<H: TransportEvents + 'static>(
    url: &str,
    events: Arc<H>,
    connect_timeout: Duration,
) -> Result<TransportHandle> {
    let connect_fut = tokio_tungstenite::connect_async(url);
    let (stream, _response) = tokio::time::timeout(connect_timeout, connect_fut)
        .await
        .map_err(|_| ProtocolError::ConnectionTimeout)?
        .map_err(|e| ProtocolError::Transport(format!("connect failed: {e}")))?;

    let handle = next_handle("client");
    let task_handle = handle.clone();
    tokio::spawn(async move { run_connection(stream, task_handle, events).await });
    Ok(handle)
}
