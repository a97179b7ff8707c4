// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Pluggable checkpoint persistence.
//!
//! The engine keeps its own in-run version history inside
//! [`StateStore`](crate::state::StateStore); this module is the external
//! collaborator that persists checkpoints across runs. The default is
//! in-memory; filesystem/Redis/Postgres backends implement the same trait
//! out of tree.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::StateStore;

/// A persisted snapshot of a run's state at a specific version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCheckpoint {
    /// Run this checkpoint belongs to.
    pub run_id: String,
    /// State version the checkpoint was taken at.
    pub version: u64,
    /// Node whose merge produced the version, if any.
    pub node: Option<String>,
    /// When the checkpoint was persisted.
    pub created_at: DateTime<Utc>,
    /// Full state store, including its version history.
    pub state: StateStore,
}

/// Storage collaborator for run checkpoints.
///
/// Implementations must be safe to call from the scheduler's control task;
/// the engine never calls `save` concurrently for the same run.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint. Saving the same `(run_id, version)` twice
    /// overwrites.
    async fn save(&self, checkpoint: PersistedCheckpoint) -> Result<()>;

    /// Load the checkpoint for `run_id` at `version`.
    async fn load(&self, run_id: &str, version: u64) -> Result<PersistedCheckpoint>;

    /// Load the most recent checkpoint for `run_id`, if any.
    async fn latest(&self, run_id: &str) -> Result<Option<PersistedCheckpoint>>;
}

/// Default in-memory checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    inner: Mutex<HashMap<(String, u64), PersistedCheckpoint>>,
}

impl InMemoryCheckpointStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: PersistedCheckpoint) -> Result<()> {
        self.inner.lock().insert(
            (checkpoint.run_id.clone(), checkpoint.version),
            checkpoint,
        );
        Ok(())
    }

    async fn load(&self, run_id: &str, version: u64) -> Result<PersistedCheckpoint> {
        self.inner
            .lock()
            .get(&(run_id.to_string(), version))
            .cloned()
            .ok_or_else(|| Error::CheckpointNotFound {
                name: format!("{run_id}@{version}"),
            })
    }

    async fn latest(&self, run_id: &str) -> Result<Option<PersistedCheckpoint>> {
        Ok(self
            .inner
            .lock()
            .values()
            .filter(|cp| cp.run_id == run_id)
            .max_by_key(|cp| cp.version)
            .cloned())
    }
}
