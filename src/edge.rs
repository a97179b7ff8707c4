// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Edge types for the workflow graph.
//!
//! Edges are directed transitions between nodes, referenced by id. A
//! `Conditional` edge carries a predicate over the state snapshot; a
//! `Parallel` edge fans out together with every other qualifying parallel
//! edge from the same source.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::state::StateSnapshot;

/// Predicate over a read-only state snapshot.
pub type EdgeCondition = Arc<dyn Fn(&StateSnapshot) -> bool + Send + Sync>;

/// How an edge activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Always qualifies; exclusive with other plain/conditional edges.
    Plain,
    /// Qualifies when its condition evaluates true; exclusive like Plain.
    Conditional,
    /// Fans out together with all other qualifying parallel edges from the
    /// same source.
    Parallel,
}

/// A directed transition between two nodes.
#[derive(Clone)]
pub struct Edge {
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    /// Activation behavior.
    pub kind: EdgeKind,
    /// Predicate, required iff `kind == Conditional`.
    pub condition: Option<EdgeCondition>,
    /// Higher priority is evaluated first; insertion order breaks ties.
    pub priority: i32,
    /// Opaque metadata.
    pub metadata: HashMap<String, String>,
}

impl Edge {
    /// Plain edge from `source` to `target`.
    pub fn plain(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: EdgeKind::Plain,
            condition: None,
            priority: 0,
            metadata: HashMap::new(),
        }
    }

    /// Conditional edge gated by `condition`.
    pub fn conditional<F>(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: F,
    ) -> Self
    where
        F: Fn(&StateSnapshot) -> bool + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            target: target.into(),
            kind: EdgeKind::Conditional,
            condition: Some(Arc::new(condition)),
            priority: 0,
            metadata: HashMap::new(),
        }
    }

    /// Parallel edge participating in fan-out from `source`.
    pub fn parallel(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: EdgeKind::Parallel,
            condition: None,
            priority: 0,
            metadata: HashMap::new(),
        }
    }

    /// Set the priority. Higher wins among qualifying plain/conditional
    /// edges; equal priorities fall back to insertion order.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Evaluate the edge's condition against a snapshot.
    ///
    /// Plain and Parallel edges always qualify. A Conditional edge without a
    /// predicate never qualifies (construction through [`Edge::conditional`]
    /// makes that impossible, and `Graph::validate` reports it for edges
    /// assembled by hand).
    pub fn qualifies(&self, snapshot: &StateSnapshot) -> bool {
        match self.kind {
            EdgeKind::Plain | EdgeKind::Parallel => true,
            EdgeKind::Conditional => match &self.condition {
                Some(condition) => condition(snapshot),
                None => false,
            },
        }
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("condition", &self.condition.as_ref().map(|_| "<predicate>"))
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StatePatch, StateStore};
    use serde_json::json;

    fn snapshot_with(key: &str, value: serde_json::Value) -> StateSnapshot {
        let mut store = StateStore::new();
        store.apply(&StatePatch::new().set(key, value), None);
        store.snapshot()
    }

    #[test]
    fn plain_and_parallel_always_qualify() {
        let snap = StateStore::new().snapshot();
        assert!(Edge::plain("a", "b").qualifies(&snap));
        assert!(Edge::parallel("a", "b").qualifies(&snap));
    }

    #[test]
    fn conditional_follows_predicate() {
        let edge = Edge::conditional("a", "b", |s: &StateSnapshot| {
            s.get("score").and_then(|v| v.as_i64()).unwrap_or(0) > 5
        });
        assert!(edge.qualifies(&snapshot_with("score", json!(10))));
        assert!(!edge.qualifies(&snapshot_with("score", json!(3))));
        assert!(!edge.qualifies(&StateStore::new().snapshot()));
    }

    #[test]
    fn conditional_without_predicate_never_qualifies() {
        let edge = Edge {
            source: "a".to_string(),
            target: "b".to_string(),
            kind: EdgeKind::Conditional,
            condition: None,
            priority: 0,
            metadata: HashMap::new(),
        };
        assert!(!edge.qualifies(&StateStore::new().snapshot()));
    }
}
