//! Bridge between the host's room object and the shared document.
//!
//! ```text
//! host sync(snapshot)
//!       │   (debounced, latest wins)
//!       ▼
//! RoomSnapshot::syncable()  ──►  comparison string == last pushed?  ──► skip
//!       │ no
//!       ▼
//! one local transaction:  roomData.<field>, items.<category>, meta.*
//!
//! remote transaction (local == false)
//!       │   (inside a RemoteScope)
//!       ▼
//! RoomSnapshot::from_document()  ──►  merge over host copy  ──►  host callback
//! ```
//!
//! Merge policy is last-writer-wins: remote room fields overwrite local
//! ones field by field, remote item categories replace local arrays whole.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::document::{Origin, SharedDocument, ITEMS, META, ROOM_DATA};
use crate::timer::Timer;

/// Keys with this prefix are runtime-only and never replicated.
pub const TRANSIENT_PREFIX: char = '_';

/// Sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("room snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ───────────────────────────────────────────────────────────────────
// Room snapshot
// ───────────────────────────────────────────────────────────────────

/// The host's room object: top-level fields plus item categories.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    /// Dimensions, settings and any other top-level field.
    pub room: JsonMap<String, Value>,
    /// Category name → items of that category.
    pub items: BTreeMap<String, Vec<Value>>,
}

impl RoomSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.room.insert(key.into(), value);
        self
    }

    pub fn with_category(mut self, name: impl Into<String>, items: Vec<Value>) -> Self {
        self.items.insert(name.into(), items);
        self
    }

    /// Copy holding only replicated data: transient fields and categories
    /// are dropped, item arrays are deep copies.
    pub fn syncable(&self) -> RoomSnapshot {
        RoomSnapshot {
            room: self
                .room
                .iter()
                .filter(|(k, _)| !k.starts_with(TRANSIENT_PREFIX))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            items: self
                .items
                .iter()
                .filter(|(k, _)| !k.starts_with(TRANSIENT_PREFIX))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Canonical serialization used by the idempotence guard.
    pub fn comparison_key(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Read the room back out of the document's `roomData` and `items` maps.
    pub fn from_document(doc: &SharedDocument) -> RoomSnapshot {
        let room = doc
            .map(ROOM_DATA)
            .map(|m| m.to_object())
            .unwrap_or_default();

        let mut items = BTreeMap::new();
        if let Some(map) = doc.map(ITEMS) {
            for (category, value) in map.iter() {
                match value {
                    Value::Array(list) => {
                        items.insert(category.clone(), list.clone());
                    }
                    other => log::warn!(
                        "Ignoring item category {category:?}: expected array, got {other}"
                    ),
                }
            }
        }

        RoomSnapshot { room, items }
    }

    /// `local` with `remote` laid over it.
    pub fn merge_remote(local: &RoomSnapshot, remote: &RoomSnapshot) -> RoomSnapshot {
        let mut merged = local.clone();
        for (key, value) in &remote.room {
            merged.room.insert(key.clone(), value.clone());
        }
        for (category, list) in &remote.items {
            merged.items.insert(category.clone(), list.clone());
        }
        merged
    }
}

// ───────────────────────────────────────────────────────────────────
// Applying-remote scope
// ───────────────────────────────────────────────────────────────────

/// Marks "an inbound change is being applied" for as long as it lives.
///
/// The flag is only meaningful on the session task: host callbacks run
/// there while the scope is alive, and `sync()` calls they make are
/// dropped. Calls from any other task ignore it.
#[derive(Debug)]
pub struct RemoteScope {
    flag: Arc<AtomicBool>,
}

impl RemoteScope {
    pub fn enter(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self { flag: flag.clone() }
    }
}

impl Drop for RemoteScope {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

// ───────────────────────────────────────────────────────────────────
// Sync integration
// ───────────────────────────────────────────────────────────────────

/// Result of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Document updated; `changed` keys including the meta stamp.
    Pushed { changed: usize },
    /// Identical to the last push; nothing written.
    Unchanged,
}

/// Debounced, idempotent local → document pipeline plus the reverse path.
#[derive(Debug)]
pub struct SyncIntegration {
    local_user_id: String,
    debounce_window: Duration,
    debounce: Timer,
    pending: Option<RoomSnapshot>,
    last_pushed: Option<String>,
    applying_remote: Arc<AtomicBool>,
}

impl SyncIntegration {
    pub fn new(local_user_id: impl Into<String>, debounce_window: Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            debounce_window,
            debounce: Timer::new(),
            pending: None,
            last_pushed: None,
            applying_remote: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag, set while a [`RemoteScope`] is alive.
    pub fn applying_remote_flag(&self) -> Arc<AtomicBool> {
        self.applying_remote.clone()
    }

    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote.load(Ordering::SeqCst)
    }

    pub fn enter_remote(&self) -> RemoteScope {
        RemoteScope::enter(&self.applying_remote)
    }

    /// Queue `snapshot` and restart the debounce window.
    pub fn schedule(&mut self, snapshot: RoomSnapshot) {
        self.pending = Some(snapshot);
        self.debounce.arm(self.debounce_window);
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolves when the debounce window closes; see [`Timer::fired`].
    pub async fn debounce_elapsed(&mut self) {
        self.debounce.fired().await
    }

    /// Take the latest queued snapshot once the window has closed.
    pub fn take_pending(&mut self) -> Option<RoomSnapshot> {
        self.debounce.cancel();
        self.pending.take()
    }

    /// Write `snapshot` into `doc` as one local transaction, unless it
    /// matches what was last pushed.
    pub fn push(&mut self, doc: &mut SharedDocument, snapshot: &RoomSnapshot) -> Result<PushOutcome, SyncError> {
        let syncable = snapshot.syncable();
        let key = syncable.comparison_key()?;
        if self.last_pushed.as_deref() == Some(key.as_str()) {
            log::debug!("Skipping push: room unchanged since last push");
            return Ok(PushOutcome::Unchanged);
        }

        // Keys the host no longer has are removed in the same transaction.
        let stale_fields = stale_keys(doc, ROOM_DATA, |k| syncable.room.contains_key(k));
        let stale_categories = stale_keys(doc, ITEMS, |k| syncable.items.contains_key(k));

        let user_id = self.local_user_id.clone();
        let changed = doc.transact(Origin::Local, |txn| {
            for field in &stale_fields {
                txn.delete(ROOM_DATA, field);
            }
            for category in &stale_categories {
                txn.delete(ITEMS, category);
            }
            for (field, value) in syncable.room {
                txn.set(ROOM_DATA, field, value);
            }
            for (category, list) in syncable.items {
                txn.set(ITEMS, category, Value::Array(list));
            }
            txn.set(META, "lastUpdated", Value::from(now_millis()));
            txn.set(META, "lastUpdatedBy", Value::String(user_id));
            txn.change_count()
        });

        self.last_pushed = Some(key);
        Ok(PushOutcome::Pushed { changed })
    }

    /// Build the host's new room object after a remote change.
    ///
    /// The merged result becomes the idempotence baseline, so the host
    /// handing it straight back to `sync()` pushes nothing.
    pub fn merge_remote(&mut self, doc: &SharedDocument, host_current: Option<RoomSnapshot>) -> Result<RoomSnapshot, SyncError> {
        let remote = RoomSnapshot::from_document(doc);
        let merged = match host_current {
            Some(local) => RoomSnapshot::merge_remote(&local, &remote),
            None => remote,
        };
        self.last_pushed = Some(merged.syncable().comparison_key()?);
        Ok(merged)
    }

    /// Drop the debounce timer, any queued snapshot and the push baseline.
    pub fn reset(&mut self) {
        self.debounce.cancel();
        self.pending = None;
        self.last_pushed = None;
    }

    pub fn debounce_armed(&self) -> bool {
        self.debounce.is_armed()
    }
}

fn stale_keys(doc: &SharedDocument, map: &str, keep: impl Fn(&str) -> bool) -> Vec<String> {
    doc.map(map)
        .map(|m| m.iter().filter(|(k, _)| !keep(k)).map(|(k, _)| k.clone()).collect())
        .unwrap_or_default()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
