//! WebSocket relay with room-based fan-out.
//!
//! ```text
//! Client A ──┐                          ┌──► Client B
//!            ├── /ws/<room> ── Room ────┤
//! Client C ──┘    (broadcast channel)   └──► Client C (not A)
//! ```
//!
//! The relay is content-agnostic: it never decodes payloads, holds no
//! document state and answers no requests. Every binary frame a peer sends
//! is forwarded to every other peer in the same room, so `SyncRequest` and
//! `AwarenessRequest` are answered by the peers themselves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::MessageType;
use crate::transport::is_valid_room_id;

/// Path prefix under which rooms are served.
pub const ROOM_PATH_PREFIX: &str = "/ws/";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("room {0} is full")]
    RoomFull(String),
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per peer before it starts lagging
    pub broadcast_capacity: usize,
    /// Connections beyond this are closed right after the handshake
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// (sender connection id, encoded frame)
type Envelope = (u64, Arc<Vec<u8>>);

struct Room {
    sender: broadcast::Sender<Envelope>,
    peers: usize,
}

/// The relay server. Cheap to clone; clones share rooms and stats.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    stats: Arc<RwLock<RelayStats>>,
    next_connection: Arc<AtomicU64>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), RelayError> {
        let mut room_id = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match room_from_path(req.uri().path()) {
                Some(id) => {
                    room_id = Some(id.to_string());
                    Ok(resp)
                }
                None => Err(not_found(req.uri().path())),
            }
        })
        .await?;
        let Some(room_id) = room_id else {
            return Ok(());
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let joined = self.join(&room_id).await;
        let (room_tx, mut room_rx) = match joined {
            Some(channel) => channel,
            None => {
                let _ = ws_sender.send(Message::Close(None)).await;
                return Err(RelayError::RoomFull(room_id));
            }
        };
        log::info!("Connection {conn_id} from {addr} joined room {room_id}");

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        if bytes.is_empty() {
                            continue;
                        }
                        log::trace!(
                            "Room {room_id}: {:?} frame ({} bytes) from {conn_id}",
                            MessageType::from_byte(bytes[0]),
                            bytes.len()
                        );
                        {
                            let mut s = self.stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += bytes.len() as u64;
                        }
                        // No receivers other than ourselves is not an error.
                        let _ = room_tx.send((conn_id, Arc::new(bytes)));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                },

                envelope = room_rx.recv() => match envelope {
                    Ok((sender, _)) if sender == conn_id => {}
                    Ok((_, bytes)) => {
                        if let Err(e) = ws_sender.send(Message::Binary(bytes.to_vec().into())).await {
                            break Err(e.into());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection {conn_id} in room {room_id} lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                },
            }
        };

        self.leave(&room_id).await;
        log::info!("Connection {conn_id} left room {room_id}");
        result
    }

    async fn join(&self, room_id: &str) -> Option<(broadcast::Sender<Envelope>, broadcast::Receiver<Envelope>)> {
        let mut rooms = self.rooms.write().await;
        let peers = rooms.get(room_id).map_or(0, |r| r.peers);
        if peers >= self.config.max_peers_per_room {
            return None;
        }
        // A broadcast channel needs room for at least one frame.
        let capacity = self.config.broadcast_capacity.max(1);
        let room = rooms.entry(room_id.to_string()).or_insert_with(|| Room {
            sender: broadcast::channel(capacity).0,
            peers: 0,
        });
        room.peers += 1;
        let channel = (room.sender.clone(), room.sender.subscribe());
        let active_rooms = rooms.len();
        drop(rooms);

        let mut s = self.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
        s.active_rooms = active_rooms;
        Some(channel)
    }

    async fn leave(&self, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(room_id) {
            room.peers = room.peers.saturating_sub(1);
            if room.peers == 0 {
                rooms.remove(room_id);
                log::debug!("Room {room_id} removed (empty)");
            }
        }
        let active_rooms = rooms.len();
        drop(rooms);

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = active_rooms;
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub async fn peer_count(&self, room_id: &str) -> usize {
        self.rooms.read().await.get(room_id).map_or(0, |r| r.peers)
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// `/ws/<room-id>` → `<room-id>`
pub fn room_from_path(path: &str) -> Option<&str> {
    path.strip_prefix(ROOM_PATH_PREFIX).filter(|id| is_valid_room_id(id))
}

fn not_found(path: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("no room at {path}")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
