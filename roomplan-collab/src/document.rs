//! In-memory replicated document: a set of named last-writer-wins maps.
//!
//! ```text
//! SharedDocument
//!   ├── "roomData"  key → JSON value   (one key per top-level room field)
//!   ├── "items"     key → JSON array   (one key per item category)
//!   └── "meta"      key → JSON value   (lastUpdated, lastUpdatedBy)
//! ```
//!
//! Every mutation runs inside exactly one [`Transaction`]. Observers receive
//! the batch of [`DocumentChange`]s together with that transaction, so they
//! can tell changes made through this session's own calls (`local == true`)
//! from changes applied out of an inbound snapshot (`local == false`).
//!
//! There is no causal metadata. [`SharedDocument::apply_snapshot`] replaces
//! the contents of every map it names wholesale.

use serde_json::{Map as JsonMap, Value};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Map holding the room's top-level fields.
pub const ROOM_DATA: &str = "roomData";
/// Map holding one array per item category.
pub const ITEMS: &str = "items";
/// Map holding bookkeeping about the last push.
pub const META: &str = "meta";

/// Where a transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// This session's own mutation calls.
    Local,
    /// Data received from the network.
    Remote,
}

/// Metadata wrapping one batch of changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub local: bool,
    pub origin: Origin,
}

impl Transaction {
    fn new(origin: Origin) -> Self {
        Self {
            local: origin == Origin::Local,
            origin,
        }
    }
}

/// A single key-level change.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub map: String,
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub deleted: bool,
}

/// Document store errors.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(#[source] serde_json::Error),
    #[error("snapshot encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Handle returned by [`SharedDocument::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Box<dyn FnMut(&[DocumentChange], &Transaction) + Send>;

/// One replicated key/value map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedMap {
    entries: HashMap<String, Value>,
}

impl SharedMap {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Copy the map's contents out as a JSON object.
    pub fn to_object(&self) -> JsonMap<String, Value> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A batch of mutations in progress. Obtained from [`SharedDocument::transact`].
pub struct TransactionMut<'doc> {
    maps: &'doc mut HashMap<String, SharedMap>,
    changes: Vec<DocumentChange>,
}

impl TransactionMut<'_> {
    /// Set `key` in `map`, creating the map if needed.
    ///
    /// Writing a value equal to the current one records no change.
    pub fn set(&mut self, map: &str, key: impl Into<String>, value: Value) {
        let key = key.into();
        let entries = &mut self.maps.entry(map.to_string()).or_default().entries;
        if entries.get(&key) == Some(&value) {
            return;
        }
        let old_value = entries.insert(key.clone(), value.clone());
        self.changes.push(DocumentChange {
            map: map.to_string(),
            key,
            old_value,
            new_value: Some(value),
            deleted: false,
        });
    }

    /// Remove `key` from `map`. Missing keys are a no-op.
    pub fn delete(&mut self, map: &str, key: &str) {
        let Some(shared) = self.maps.get_mut(map) else {
            return;
        };
        if let Some(old_value) = shared.entries.remove(key) {
            self.changes.push(DocumentChange {
                map: map.to_string(),
                key: key.to_string(),
                old_value: Some(old_value),
                new_value: None,
                deleted: true,
            });
        }
    }

    pub fn get(&self, map: &str, key: &str) -> Option<&Value> {
        self.maps.get(map).and_then(|m| m.get(key))
    }

    /// Changes recorded so far in this transaction.
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }
}

/// The replicated document.
pub struct SharedDocument {
    maps: HashMap<String, SharedMap>,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("maps", &self.maps)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl SharedDocument {
    /// Create a document with the empty `roomData`, `items` and `meta` maps.
    pub fn new() -> Self {
        let maps = [ROOM_DATA, ITEMS, META]
            .into_iter()
            .map(|name| (name.to_string(), SharedMap::default()))
            .collect();
        Self {
            maps,
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    pub fn map(&self, name: &str) -> Option<&SharedMap> {
        self.maps.get(name)
    }

    pub fn get(&self, map: &str, key: &str) -> Option<&Value> {
        self.maps.get(map).and_then(|m| m.get(key))
    }

    /// Register an observer, called once per non-empty transaction.
    pub fn observe<F>(&mut self, callback: F) -> ObserverId
    where
        F: FnMut(&[DocumentChange], &Transaction) + Send + 'static,
    {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(callback)));
        id
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    /// Run `f` as one transaction and notify observers once with its changes.
    pub fn transact<R>(&mut self, origin: Origin, f: impl FnOnce(&mut TransactionMut<'_>) -> R) -> R {
        let mut txn = TransactionMut {
            maps: &mut self.maps,
            changes: Vec::new(),
        };
        let result = f(&mut txn);
        let changes = txn.changes;
        self.notify(&changes, Transaction::new(origin));
        result
    }

    /// Set a single key as a local transaction.
    pub fn set(&mut self, map: &str, key: impl Into<String>, value: Value) {
        self.transact(Origin::Local, |txn| txn.set(map, key, value));
    }

    /// Delete a single key as a local transaction.
    pub fn delete(&mut self, map: &str, key: &str) {
        self.transact(Origin::Local, |txn| txn.delete(map, key));
    }

    /// Serialize the full document: `{"<map>": {"<key>": value, ..}, ..}`.
    pub fn to_snapshot(&self) -> Result<Vec<u8>, DocumentError> {
        let doc: BTreeMap<&str, JsonMap<String, Value>> = self
            .maps
            .iter()
            .map(|(name, map)| (name.as_str(), map.to_object()))
            .collect();
        serde_json::to_vec(&doc).map_err(DocumentError::Encode)
    }

    /// Replace the contents of every map named in `bytes`.
    ///
    /// The snapshot is parsed completely before anything is touched, so a
    /// malformed payload leaves the document unchanged. Maps absent from the
    /// snapshot are left alone. Returns the number of changed keys.
    pub fn apply_snapshot(&mut self, bytes: &[u8], origin: Origin) -> Result<usize, DocumentError> {
        let incoming: BTreeMap<String, HashMap<String, Value>> =
            serde_json::from_slice(bytes).map_err(DocumentError::MalformedSnapshot)?;

        let mut changes = Vec::new();
        for (name, entries) in incoming {
            let current = self.maps.entry(name.clone()).or_default();

            for (key, old_value) in current.entries.iter() {
                if !entries.contains_key(key) {
                    changes.push(DocumentChange {
                        map: name.clone(),
                        key: key.clone(),
                        old_value: Some(old_value.clone()),
                        new_value: None,
                        deleted: true,
                    });
                }
            }
            for (key, value) in entries.iter() {
                let old_value = current.entries.get(key);
                if old_value != Some(value) {
                    changes.push(DocumentChange {
                        map: name.clone(),
                        key: key.clone(),
                        old_value: old_value.cloned(),
                        new_value: Some(value.clone()),
                        deleted: false,
                    });
                }
            }

            current.entries = entries;
        }

        let count = changes.len();
        self.notify(&changes, Transaction::new(origin));
        Ok(count)
    }

    /// Drop all contents and observers.
    pub fn clear(&mut self) {
        self.observers.clear();
        for map in self.maps.values_mut() {
            map.entries.clear();
        }
    }

    fn notify(&mut self, changes: &[DocumentChange], txn: Transaction) {
        if changes.is_empty() {
            return;
        }
        for (_, observer) in self.observers.iter_mut() {
            observer(changes, &txn);
        }
    }
}
