//! Awareness protocol: ephemeral per-user presence (cursor, selection, drag).
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move / selection change
//!       │
//!       ▼
//! AwarenessChannel::update_local()      (no throttling: presence is chatty)
//!       │
//!       ▼
//! Frame::AwarenessUpdate(JSON)  ──►  peers
//!
//! peers  ──►  Frame::AwarenessUpdate(JSON)
//!       │
//!       ▼
//! AwarenessChannel::apply_remote()      (self-echo filtered, upsert)
//!       │
//!       ▼
//! AwarenessChannel::refresh()           (prune peers silent since last refresh)
//! ```
//!
//! Nothing here is persisted or written into the shared document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// 2D position in room (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Identity of a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// A user with a random id, for hosts without accounts.
    pub fn anonymous(name: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), name)
    }
}

/// An item drag in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dragging {
    pub item_id: String,
    pub start_position: Point,
}

/// One user's presence record, exactly as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user: User,
    pub cursor: Option<Point>,
    #[serde(default)]
    pub selection: Vec<String>,
    pub dragging: Option<Dragging>,
}

impl AwarenessState {
    pub fn new(user: User) -> Self {
        Self {
            user,
            cursor: None,
            selection: Vec::new(),
            dragging: None,
        }
    }

    /// Encode as the UTF-8 JSON payload of an `AwarenessUpdate` frame.
    pub fn encode(&self) -> Result<Vec<u8>, AwarenessError> {
        serde_json::to_vec(self).map_err(AwarenessError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AwarenessError> {
        serde_json::from_slice(bytes).map_err(AwarenessError::Malformed)
    }
}

/// Partial update of the local record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessPatch {
    pub cursor: Option<Option<Point>>,
    pub selection: Option<Vec<String>>,
    pub dragging: Option<Option<Dragging>>,
}

impl AwarenessPatch {
    pub fn cursor(cursor: Option<Point>) -> Self {
        Self {
            cursor: Some(cursor),
            ..Self::default()
        }
    }

    pub fn selection(ids: Vec<String>) -> Self {
        Self {
            selection: Some(ids),
            ..Self::default()
        }
    }

    pub fn dragging(dragging: Option<Dragging>) -> Self {
        Self {
            dragging: Some(dragging),
            ..Self::default()
        }
    }

    fn apply_to(self, state: &mut AwarenessState) {
        if let Some(cursor) = self.cursor {
            state.cursor = cursor;
        }
        if let Some(selection) = self.selection {
            state.selection = selection;
        }
        if let Some(dragging) = self.dragging {
            state.dragging = dragging;
        }
    }
}

/// Awareness errors.
#[derive(Debug, Error)]
pub enum AwarenessError {
    #[error("malformed awareness payload: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("awareness encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
}

// ───────────────────────────────────────────────────────────────────
// Presence colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for drawing a collaborator's cursor and selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresenceColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl PresenceColor {
    /// Stable, vivid color derived from a user id.
    pub fn from_user_id(id: &str) -> Self {
        let hue = (fnv1a(id.as_bytes()) % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb` form for the presence UI.
    pub fn to_hex(&self) -> String {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325_u64, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Presence table
// ───────────────────────────────────────────────────────────────────

/// An entry of the presence list handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedUser {
    pub state: AwarenessState,
    pub is_local: bool,
    pub color: PresenceColor,
}

/// Result of feeding a remote awareness payload to the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The payload carried our own user id.
    SelfEcho,
    /// Known peer re-announced an identical record.
    Unchanged,
    /// New peer, or a peer whose record changed.
    Upserted,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    state: AwarenessState,
    /// Heard from since the last refresh.
    seen: bool,
}

/// Local presence record plus the table of remote peers.
#[derive(Debug, Clone)]
pub struct AwarenessChannel {
    local: AwarenessState,
    peers: BTreeMap<String, PeerEntry>,
}

impl AwarenessChannel {
    pub fn new(user: User) -> Self {
        Self {
            local: AwarenessState::new(user),
            peers: BTreeMap::new(),
        }
    }

    pub fn local(&self) -> &AwarenessState {
        &self.local
    }

    pub fn local_user_id(&self) -> &str {
        &self.local.user.id
    }

    /// Merge `patch` into the local record and return the payload to send.
    pub fn update_local(&mut self, patch: AwarenessPatch) -> Result<Vec<u8>, AwarenessError> {
        patch.apply_to(&mut self.local);
        self.local.encode()
    }

    /// Payload announcing the local record as it currently stands.
    pub fn encode_local(&self) -> Result<Vec<u8>, AwarenessError> {
        self.local.encode()
    }

    /// Handle an inbound `AwarenessUpdate` payload.
    pub fn apply_remote(&mut self, payload: &[u8]) -> Result<RemoteOutcome, AwarenessError> {
        let state = AwarenessState::decode(payload)?;
        if state.user.id == self.local.user.id {
            return Ok(RemoteOutcome::SelfEcho);
        }

        match self.peers.get_mut(&state.user.id) {
            Some(entry) => {
                entry.seen = true;
                if entry.state == state {
                    return Ok(RemoteOutcome::Unchanged);
                }
                entry.state = state;
            }
            None => {
                self.peers
                    .insert(state.user.id.clone(), PeerEntry { state, seen: true });
            }
        }
        Ok(RemoteOutcome::Upserted)
    }

    /// Close the current broadcast window.
    ///
    /// Peers not heard from since the previous call are removed and their
    /// ids returned; everyone else must re-announce before the next call.
    pub fn refresh(&mut self) -> Vec<String> {
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| !p.seen)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        for peer in self.peers.values_mut() {
            peer.seen = false;
        }
        stale
    }

    pub fn clear_peers(&mut self) {
        self.peers.clear();
    }

    pub fn peer(&self, user_id: &str) -> Option<&AwarenessState> {
        self.peers.get(user_id).map(|p| &p.state)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// `[local, ...peers]`, local always first.
    pub fn connected_users(&self) -> Vec<ConnectedUser> {
        let local = ConnectedUser {
            color: PresenceColor::from_user_id(&self.local.user.id),
            state: self.local.clone(),
            is_local: true,
        };
        std::iter::once(local)
            .chain(self.peers.values().map(|p| ConnectedUser {
                color: PresenceColor::from_user_id(&p.state.user.id),
                state: p.state.clone(),
                is_local: false,
            }))
            .collect()
    }
}

// ===================================================================
// Tests
// ===================================================================
