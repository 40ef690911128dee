//! # roomplan-collab: real-time collaboration for the room planner
//!
//! Shares one room layout between several editors over a WebSocket relay,
//! together with each participant's cursor, selection and drag state.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   sync()/update_*()   ┌──────────────┐
//! │ Host editor   │ ────────────────────► │ Collaboration│
//! │ (room object) │ ◄──────────────────── │   (facade)   │
//! └───────────────┘  on_room_update etc.  └──────┬───────┘
//!                                                │ commands
//!                                                ▼
//!                      ┌──────────────────────────────────────────┐
//!                      │ Session task                             │
//!                      │  SyncIntegration ─► SharedDocument       │
//!                      │  AwarenessChannel   ConnectionMachine    │
//!                      └────────────────────┬─────────────────────┘
//!                                           │ binary frames
//!                                           ▼
//!                                   ┌──────────────┐
//!                                   │ RelayServer  │ ──► other peers
//!                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: one-byte-tagged binary frames
//! - [`document`]: named maps with transactional change notification
//! - [`sync`]: debounced, idempotent push and remote merge
//! - [`awareness`]: ephemeral per-user presence
//! - [`transport`]: sockets, reconnect backoff, pluggable connectors
//! - [`collab`]: the facade the host talks to
//! - [`relay`]: room fan-out server
//!
//! Conflict resolution is last-writer-wins per top-level key: a snapshot
//! replaces whole keys, never merging inside them.

pub mod awareness;
pub mod collab;
pub mod config;
pub mod document;
pub mod protocol;
pub mod relay;
mod session;
pub mod sync;
pub mod timer;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    AwarenessChannel, AwarenessError, AwarenessPatch, AwarenessState, ConnectedUser, Dragging,
    Point, PresenceColor, RemoteOutcome, User,
};
pub use collab::{CollabError, CollabOptions, Collaboration};
pub use config::CollabConfig;
pub use document::{DocumentChange, DocumentError, Origin, SharedDocument, Transaction};
pub use protocol::{Frame, MessageType, ProtocolError};
pub use relay::{RelayConfig, RelayError, RelayServer, RelayStats};
pub use session::{RedrawFn, RoomGetterFn, RoomUpdateFn, StatusFn, UsersFn};
pub use sync::{PushOutcome, RoomSnapshot, SyncError, SyncIntegration};
pub use transport::{
    ChannelConnector, Connection, ConnectionState, Connector, RemoteEnd, TransportError,
    WsConnector,
};
