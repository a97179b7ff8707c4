// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Versioned workflow state.
//!
//! [`StateStore`] is an ordered key/value map where every committed
//! [`StatePatch`] produces a new version. Named checkpoints reference a
//! version; restoring one truncates the version history back to that point,
//! discarding everything after it (no redo, no branch merge).
//!
//! Concurrently executing node tasks never touch the store: each task gets
//! an immutable [`StateSnapshot`] and returns a patch, and only the
//! scheduler's merge step mutates the store. That single-writer discipline
//! is what makes version history deterministic and checkpoint/restore
//! meaningful.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// An immutable, shareable view of the state at a specific version.
///
/// Cheap to clone (`Arc` inside); handed to node tasks so they can read
/// without locks while the scheduler keeps exclusive write access.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    version: u64,
    entries: Arc<BTreeMap<String, Value>>,
}

impl StateSnapshot {
    /// Version this snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The snapshot as a JSON object, used by Output nodes to record the
    /// final state under their own key.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// An ordered set of mutations produced by one node execution.
///
/// Sets are applied before removes, each in insertion order. Patches are
/// data, not closures, so they can be logged, persisted and replayed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    sets: Vec<(String, Value)>,
    removes: Vec<String>,
}

impl StatePatch {
    /// Empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a key write.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.sets.push((key.into(), value));
        self
    }

    /// Record a key removal.
    #[must_use]
    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.removes.push(key.into());
        self
    }

    /// Whether the patch mutates anything.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.removes.is_empty()
    }
}

/// One committed version: the patch that produced it plus the resulting
/// full snapshot. Full snapshots keep restore bit-for-bit and O(1).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionRecord {
    version: u64,
    /// Node whose merge produced this version, if any.
    node: Option<String>,
    timestamp: DateTime<Utc>,
    entries: BTreeMap<String, Value>,
}

/// A named, restorable reference to a state version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint name, unique within the store.
    pub name: String,
    /// Version the checkpoint references.
    pub version: u64,
    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
}

/// Ordered, versioned key/value workflow state with named checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateStore {
    version: u64,
    entries: BTreeMap<String, Value>,
    history: Vec<VersionRecord>,
    checkpoints: HashMap<String, Checkpoint>,
}

impl StateStore {
    /// Empty store at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version. Starts at 0; each applied patch increments it.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Look up a key at the current version.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Take an immutable snapshot of the current version.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            version: self.version,
            entries: Arc::new(self.entries.clone()),
        }
    }

    /// Apply a patch, producing a new version. `node` records which node's
    /// merge produced the version (None for engine-internal writes).
    pub fn apply(&mut self, patch: &StatePatch, node: Option<&str>) -> u64 {
        for (key, value) in &patch.sets {
            self.entries.insert(key.clone(), value.clone());
        }
        for key in &patch.removes {
            self.entries.remove(key);
        }
        self.version += 1;
        self.history.push(VersionRecord {
            version: self.version,
            node: node.map(str::to_string),
            timestamp: Utc::now(),
            entries: self.entries.clone(),
        });
        tracing::debug!(
            version = self.version,
            node = node.unwrap_or("-"),
            sets = patch.sets.len(),
            removes = patch.removes.len(),
            "state patch applied"
        );
        self.version
    }

    /// Name the current version as a checkpoint. Re-using a name moves it.
    pub fn checkpoint(&mut self, name: impl Into<String>) -> Checkpoint {
        let checkpoint = Checkpoint {
            name: name.into(),
            version: self.version,
            created_at: Utc::now(),
        };
        tracing::debug!(name = %checkpoint.name, version = checkpoint.version, "checkpoint created");
        self.checkpoints
            .insert(checkpoint.name.clone(), checkpoint.clone());
        checkpoint
    }

    /// Look up a checkpoint by name.
    pub fn get_checkpoint(&self, name: &str) -> Option<&Checkpoint> {
        self.checkpoints.get(name)
    }

    /// Restore the state to a named checkpoint.
    ///
    /// Truncates the version history back to the checkpoint's version,
    /// discarding every later version and any checkpoint that pointed at
    /// one. The restored entries are bit-for-bit the entries at the time the
    /// checkpoint was taken.
    pub fn restore(&mut self, name: &str) -> Result<u64> {
        let target = self
            .checkpoints
            .get(name)
            .ok_or_else(|| Error::CheckpointNotFound {
                name: name.to_string(),
            })?
            .version;

        self.entries = if target == 0 {
            BTreeMap::new()
        } else {
            self.history
                .iter()
                .find(|record| record.version == target)
                .map(|record| record.entries.clone())
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "checkpoint '{name}' references discarded version {target}"
                    ))
                })?
        };
        self.history.retain(|record| record.version <= target);
        self.checkpoints.retain(|_, cp| cp.version <= target);
        self.version = target;
        tracing::debug!(name, version = target, "state restored from checkpoint");
        Ok(target)
    }

    /// Number of retained versions.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Node ids that produced each retained version, in order. Used by
    /// determinism tests: two runs with the same external outputs must
    /// produce the same sequence.
    pub fn merge_order(&self) -> Vec<Option<String>> {
        self.history.iter().map(|r| r.node.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn apply_produces_new_versions() {
        let mut store = StateStore::new();
        assert_eq!(store.version(), 0);

        store.apply(&StatePatch::new().set("a", json!(1)), Some("n1"));
        store.apply(&StatePatch::new().set("b", json!(2)), Some("n2"));
        assert_eq!(store.version(), 2);
        assert_eq!(store.get("a"), Some(&json!(1)));
        assert_eq!(store.get("b"), Some(&json!(2)));
        assert_eq!(
            store.merge_order(),
            vec![Some("n1".to_string()), Some("n2".to_string())]
        );
    }

    #[test]
    fn remove_applies_after_sets() {
        let mut store = StateStore::new();
        store.apply(
            &StatePatch::new().set("k", json!("v")).remove("k"),
            None,
        );
        assert_eq!(store.get("k"), None);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn checkpoint_restore_round_trip_is_bit_for_bit() {
        let mut store = StateStore::new();
        store.apply(&StatePatch::new().set("a", json!([1, 2, 3])), None);
        store.apply(&StatePatch::new().set("b", json!({"x": 1.5})), None);

        let frozen = store.snapshot();
        store.checkpoint("A");

        store.apply(&StatePatch::new().set("a", json!("mutated")), None);
        store.apply(&StatePatch::new().remove("b"), None);
        assert_eq!(store.version(), 4);

        store.restore("A").unwrap();
        assert_eq!(store.version(), 2);
        let restored = store.snapshot();
        assert_eq!(restored.to_value(), frozen.to_value());
    }

    #[test]
    fn restore_discards_intervening_versions_and_checkpoints() {
        let mut store = StateStore::new();
        store.apply(&StatePatch::new().set("a", json!(1)), None);
        store.checkpoint("early");
        store.apply(&StatePatch::new().set("b", json!(2)), None);
        store.checkpoint("late");

        store.restore("early").unwrap();
        assert_eq!(store.history_len(), 1);
        assert!(store.get_checkpoint("late").is_none());
        assert!(store.get_checkpoint("early").is_some());
        assert!(store.restore("late").is_err());
    }

    #[test]
    fn restore_to_version_zero() {
        let mut store = StateStore::new();
        store.checkpoint("empty");
        store.apply(&StatePatch::new().set("a", json!(1)), None);

        store.restore("empty").unwrap();
        assert_eq!(store.version(), 0);
        assert!(store.snapshot().is_empty());
        assert_eq!(store.history_len(), 0);
    }

    #[test]
    fn restore_unknown_checkpoint_fails() {
        let mut store = StateStore::new();
        assert!(matches!(
            store.restore("missing"),
            Err(Error::CheckpointNotFound { .. })
        ));
    }

    #[test]
    fn snapshot_is_isolated_from_later_mutations() {
        let mut store = StateStore::new();
        store.apply(&StatePatch::new().set("k", json!("old")), None);
        let snap = store.snapshot();
        store.apply(&StatePatch::new().set("k", json!("new")), None);
        assert_eq!(snap.get("k"), Some(&json!("old")));
        assert_eq!(store.get("k"), Some(&json!("new")));
    }

    proptest! {
        /// Version counter equals the number of applied patches, and a
        /// checkpoint taken at any prefix restores exactly that prefix.
        #[test]
        fn version_history_laws(
            writes in prop::collection::vec(("[a-d]", 0i64..100), 1..20),
            cut in 0usize..19,
        ) {
            let mut store = StateStore::new();
            let cut = cut.min(writes.len());
            let mut at_cut = None;

            for (i, (key, value)) in writes.iter().enumerate() {
                if i == cut {
                    store.checkpoint("cut");
                    at_cut = Some(store.snapshot().to_value());
                }
                store.apply(&StatePatch::new().set(key.clone(), json!(value)), None);
            }
            if at_cut.is_none() {
                store.checkpoint("cut");
                at_cut = Some(store.snapshot().to_value());
            }
            prop_assert_eq!(store.version(), writes.len() as u64);

            store.restore("cut").unwrap();
            prop_assert_eq!(Some(store.snapshot().to_value()), at_cut);
        }
    }
}
