//! Thread-safe key/value state threaded through an orchestration.
//!
//! A `State` holds two independent namespaces: `data` for arbitrary JSON
//! values produced by agents, and `meta` for string bookkeeping such as
//! `processed_by`. All accessors take `&self`; the maps sit behind a lock so
//! an agent may share the same state with tasks it spawns internally.
//!
//! `Clone` produces a fully independent copy. Concurrent branches get their
//! own clone and are folded back with [`State::merge`].

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Metadata key listing the agents that touched a state, comma-separated
pub const PROCESSED_BY_KEY: &str = "processed_by";

/// Collision handling for [`State::merge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Entries from the source replace existing entries (last writer wins)
    #[default]
    Overwrite,

    /// Existing entries are kept; only missing keys are copied
    KeepExisting,
}

/// Plain-map view of a state, used for serialization and assertions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub data: Map<String, Value>,

    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Changes between two states, produced by [`State::diff`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateDelta {
    /// Entries that were added or changed
    pub changed: StateSnapshot,

    /// Data keys that were removed
    pub removed: Vec<String>,

    /// Metadata keys that were removed
    pub removed_meta: Vec<String>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.data.is_empty()
            && self.changed.meta.is_empty()
            && self.removed.is_empty()
            && self.removed_meta.is_empty()
    }

    /// Data keys added or changed, sorted
    pub fn changed_keys(&self) -> Vec<String> {
        self.changed.data.keys().cloned().collect()
    }
}

/// Mutable, concurrency-safe state store
#[derive(Default)]
pub struct State {
    inner: RwLock<StateSnapshot>,
}

impl State {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state seeded with the given data entries
    pub fn from_data(data: Map<String, Value>) -> Self {
        Self::from_snapshot(StateSnapshot {
            data,
            meta: BTreeMap::new(),
        })
    }

    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StateSnapshot> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StateSnapshot> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a data value
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().data.get(key).cloned()
    }

    /// Get a data value as a string, if it is one
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.read()
            .data
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Insert or replace a data value
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.write().data.insert(key.into(), value.into());
    }

    /// Remove a data value, returning it if it was present
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.write().data.remove(key)
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.read().meta.get(key).cloned()
    }

    pub fn set_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        self.write().meta.insert(key.into(), value.into());
    }

    pub fn remove_meta(&self, key: &str) -> Option<String> {
        self.write().meta.remove(key)
    }

    /// Data keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.read().data.keys().cloned().collect()
    }

    /// Metadata keys in sorted order
    pub fn meta_keys(&self) -> Vec<String> {
        self.read().meta.keys().cloned().collect()
    }

    /// Number of data entries
    pub fn len(&self) -> usize {
        self.read().data.len()
    }

    /// True when there are no data entries; metadata is not counted
    pub fn is_empty(&self) -> bool {
        self.read().data.is_empty()
    }

    /// Copy both maps out of the lock
    pub fn snapshot(&self) -> StateSnapshot {
        self.read().clone()
    }

    /// Replace both maps with a snapshot
    pub(crate) fn restore(&self, snapshot: StateSnapshot) {
        *self.write() = snapshot;
    }

    /// Append an agent name to the `processed_by` bookkeeping entry
    pub fn mark_processed_by(&self, agent: &str) {
        let mut inner = self.write();
        let entry = inner
            .meta
            .entry(PROCESSED_BY_KEY.to_string())
            .or_default();
        append_names(entry, agent);
    }

    /// Changes of `self` relative to `base`: entries added or changed, and
    /// keys `base` has that `self` no longer does.
    ///
    /// Metadata follows the same rule.
    pub fn diff(&self, base: &State) -> StateDelta {
        let base = base.snapshot();
        let current = self.snapshot();

        let removed = base
            .data
            .keys()
            .filter(|k| !current.data.contains_key(*k))
            .cloned()
            .collect();
        let removed_meta = base
            .meta
            .keys()
            .filter(|k| !current.meta.contains_key(*k))
            .cloned()
            .collect();

        let data = current
            .data
            .into_iter()
            .filter(|(k, v)| base.data.get(k) != Some(v))
            .collect();
        let meta = current
            .meta
            .into_iter()
            .filter(|(k, v)| base.meta.get(k) != Some(v))
            .collect();

        StateDelta {
            changed: StateSnapshot { data, meta },
            removed,
            removed_meta,
        }
    }

    /// Copy data and metadata from `source` into this state.
    ///
    /// The `processed_by` entry is always unioned, whatever the policy.
    /// Merging a state with a clone of itself leaves it unchanged.
    pub fn merge(&self, source: &State, policy: MergePolicy) {
        // Snapshot first so merging a state into itself cannot deadlock
        self.merge_snapshot(source.snapshot(), policy);
    }

    /// Fold a [`State::diff`] result into this state.
    ///
    /// Under `Overwrite` removed keys are removed here too; `KeepExisting`
    /// never deletes. `processed_by` is never removed.
    pub fn apply(&self, delta: &StateDelta, policy: MergePolicy) {
        self.merge_snapshot(delta.changed.clone(), policy);

        if policy == MergePolicy::Overwrite {
            let mut inner = self.write();
            for key in &delta.removed {
                inner.data.remove(key);
            }
            for key in delta.removed_meta.iter().filter(|k| *k != PROCESSED_BY_KEY) {
                inner.meta.remove(key);
            }
        }
    }

    fn merge_snapshot(&self, source: StateSnapshot, policy: MergePolicy) {
        let mut inner = self.write();

        for (key, value) in source.data {
            match policy {
                MergePolicy::Overwrite => {
                    inner.data.insert(key, value);
                }
                MergePolicy::KeepExisting => {
                    inner.data.entry(key).or_insert(value);
                }
            }
        }

        for (key, value) in source.meta {
            if key == PROCESSED_BY_KEY {
                let entry = inner.meta.entry(key).or_default();
                append_names(entry, &value);
                continue;
            }
            match policy {
                MergePolicy::Overwrite => {
                    inner.meta.insert(key, value);
                }
                MergePolicy::KeepExisting => {
                    inner.meta.entry(key).or_insert(value);
                }
            }
        }
    }
}

/// Append comma-separated names to a list, skipping ones already present
fn append_names(list: &mut String, names: &str) {
    for name in names.split(',').filter(|n| !n.is_empty()) {
        if !list.split(',').any(|existing| existing == name) {
            if !list.is_empty() {
                list.push(',');
            }
            list.push_str(name);
        }
    }
}

impl Clone for State {
    /// Deep copy: later writes to either side are invisible to the other
    fn clone(&self) -> Self {
        Self::from_snapshot(self.snapshot())
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("State")
            .field("data", &inner.data)
            .field("meta", &inner.meta)
            .finish()
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl From<StateSnapshot> for State {
    fn from(snapshot: StateSnapshot) -> Self {
        Self::from_snapshot(snapshot)
    }
}

impl Serialize for State {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for State {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        StateSnapshot::deserialize(deserializer).map(State::from_snapshot)
    }
}
