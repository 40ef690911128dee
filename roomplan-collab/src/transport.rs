//! Socket abstraction and the reconnection state machine.
//!
//! Provides:
//! - [`ConnectionState`] and the [`ConnectionMachine`] driving it
//! - [`ReconnectPolicy`]: linear backoff capped at 5× the base interval
//! - [`Connector`]: pluggable socket factory; [`WsConnector`] speaks
//!   WebSocket via tokio-tungstenite, [`ChannelConnector`] is an in-memory
//!   loopback where the caller plays the server
//!
//! A [`Connection`] is a pair of byte channels. The socket is closed when
//! either side drops its end.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("invalid room id: {0:?}")]
    InvalidRoomId(String),
}

/// Room ids end up in the URL path, so keep them to a safe alphabet.
pub fn is_valid_room_id(room_id: &str) -> bool {
    !room_id.is_empty()
        && room_id.len() <= 128
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && room_id.chars().any(|c| c.is_ascii_alphanumeric())
}

/// `<ws|wss>://<host>/ws/<room-id>`
pub fn endpoint_url(host: &str, secure: bool, room_id: &str) -> Result<String, TransportError> {
    if !is_valid_room_id(room_id) {
        return Err(TransportError::InvalidRoomId(room_id.to_string()));
    }
    let scheme = if secure { "wss" } else { "ws" };
    Ok(format!("{scheme}://{host}/ws/{room_id}"))
}

// ───────────────────────────────────────────────────────────────────
// Reconnect policy & state machine
// ───────────────────────────────────────────────────────────────────

/// Backoff schedule for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(3000),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Multiplier cap on the base interval.
    pub const MAX_MULTIPLIER: u32 = 5;

    /// Delay before attempt number `attempt` (1-based), or `None` once the
    /// budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let multiplier = attempt.min(Self::MAX_MULTIPLIER);
        Some(self.base_interval.checked_mul(multiplier).unwrap_or(Duration::MAX))
    }
}

/// What to do after a connection failed or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    /// Retry after `delay`; state is back to `Connecting`.
    Scheduled { attempt: u32, delay: Duration },
    /// Budget spent; state stays `Disconnected`.
    Exhausted { attempts: u32 },
}

/// Connection lifecycle without any I/O.
///
/// ```text
/// Disconnected ──connect──► Connecting ──opened──► Connected
///      ▲                        │                      │
///      └───── failed (budget) ──┴──── failed ──────────┘
///                               └─ failed (retry) ─► Connecting
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    policy: ReconnectPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failures since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn opened(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
    }

    /// Record a failed attempt or a dropped connection.
    pub fn failed(&mut self) -> Reconnect {
        self.state = ConnectionState::Disconnected;
        self.attempts = self.attempts.saturating_add(1);
        match self.policy.delay_for(self.attempts) {
            Some(delay) => {
                self.state = ConnectionState::Connecting;
                Reconnect::Scheduled {
                    attempt: self.attempts,
                    delay,
                }
            }
            None => Reconnect::Exhausted {
                attempts: self.attempts - 1,
            },
        }
    }

    /// Deliberate shutdown: no reconnect.
    pub fn closed(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

// ───────────────────────────────────────────────────────────────────
// Connectors
// ───────────────────────────────────────────────────────────────────

/// An open socket as a pair of frame channels.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<Vec<u8>>,
    pub incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Opens sockets for a session.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection, TransportError>>;
}

/// WebSocket connector (binary messages only).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection, TransportError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<Vec<u8>>();

            // Writer task: forward outgoing channel to WebSocket
            tokio::spawn(async move {
                while let Some(data) = out_rx.recv().await {
                    if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: binary frames in, everything else ignored
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            if in_tx.send(data.into()).is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Err(e) => {
                            log::debug!("WebSocket read error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
            });

            log::debug!("WebSocket connected to {url}");
            Ok(Connection {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

/// Server side of a [`ChannelConnector`] connection.
#[derive(Debug)]
pub struct RemoteEnd {
    pub url: String,
    /// Frames sent here arrive at the client. Drop to close the socket.
    pub to_client: mpsc::UnboundedSender<Vec<u8>>,
    /// Frames the client sent.
    pub from_client: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// In-memory connector: every `connect()` hands a [`RemoteEnd`] to the
/// receiver returned by [`ChannelConnector::new`].
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    accept_tx: mpsc::UnboundedSender<RemoteEnd>,
    refusing: Arc<AtomicBool>,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = Self {
            accept_tx,
            refusing: Arc::new(AtomicBool::new(false)),
        };
        (connector, accept_rx)
    }

    /// Make subsequent connects fail (all clones share the flag).
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

impl Connector for ChannelConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection, TransportError>> {
        let result = if self.refusing.load(Ordering::SeqCst) {
            Err(TransportError::ConnectionFailed(format!("{url}: refused")))
        } else {
            let (to_client, incoming) = mpsc::unbounded_channel();
            let (outgoing, from_client) = mpsc::unbounded_channel();
            let remote = RemoteEnd {
                url: url.to_string(),
                to_client,
                from_client,
            };
            self.accept_tx
                .send(remote)
                .map(|_| Connection { outgoing, incoming })
                .map_err(|_| TransportError::ConnectionFailed(format!("{url}: no listener")))
        };
        Box::pin(async move { result })
    }
}
