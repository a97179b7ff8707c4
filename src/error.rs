// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for flowgraph.
//!
//! The taxonomy separates construction-time errors (duplicate nodes, dangling
//! edges, validation violations — fatal, never retried, surfaced before any
//! run starts) from execution-time errors (node failures and timeouts —
//! retried by the flow safeguards, then surfaced as a run failure carrying
//! the last error). Cancellation is deliberately *not* represented here: a
//! cancelled node is marked [`NodeStatus::Skipped`] and does not by itself
//! fail the run.
//!
//! [`NodeStatus::Skipped`]: crate::node::NodeStatus::Skipped

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type returned by external [`NodeExecutor`] implementations.
///
/// [`NodeExecutor`]: crate::executor::NodeExecutor
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single structural defect found by [`Graph::validate`].
///
/// `validate()` returns the full list of violations rather than failing on
/// the first, so callers (CLI, Studio) can report everything at once.
///
/// [`Graph::validate`]: crate::graph::Graph::validate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// The graph has no entry point (no node without incoming edges and no
    /// explicit Input node).
    NoEntryPoint,
    /// The graph has no exit point (no node without outgoing edges and no
    /// explicit Output node).
    NoExitPoint,
    /// No exit point is reachable from this entry point.
    ExitUnreachable { entry: String },
    /// The node cannot be reached from any entry point.
    UnreachableNode { node: String },
    /// A `Conditional` edge was constructed without a condition predicate.
    ConditionalEdgeWithoutCondition { source: String, target: String },
    /// An edge references a node id that is not in the graph.
    DanglingEdge { source: String, target: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEntryPoint => write!(f, "graph has no entry point"),
            Self::NoExitPoint => write!(f, "graph has no exit point"),
            Self::ExitUnreachable { entry } => {
                write!(f, "no exit point is reachable from entry point '{entry}'")
            }
            Self::UnreachableNode { node } => {
                write!(f, "node '{node}' is unreachable from every entry point")
            }
            Self::ConditionalEdgeWithoutCondition { source, target } => {
                write!(
                    f,
                    "conditional edge {source} -> {target} has no condition predicate"
                )
            }
            Self::DanglingEdge { source, target } => {
                write!(f, "edge {source} -> {target} references a missing node")
            }
        }
    }
}

/// Error type for graph construction, validation and execution.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// A node with the same id already exists in the graph.
    #[error("node with id '{0}' already exists")]
    DuplicateNode(String),

    /// An edge endpoint references a node id that is not in the graph.
    #[error("node '{0}' not found")]
    UnknownNode(String),

    /// The graph failed structural validation. Fatal, never retried; no run
    /// is started.
    #[error("graph validation failed with {} violation(s): {}", .0.len(), format_violations(.0))]
    Validation(Vec<Violation>),

    /// A non-exit node completed but no outgoing edge qualified.
    #[error("dead end at node '{node}': no qualifying outgoing edge and node is not an exit point")]
    DeadEnd {
        /// Node that produced no qualifying edge.
        node: String,
    },

    /// The external node executor returned an error. Retried by the flow
    /// safeguards; after retries exhaust, surfaced with the last error.
    #[error("node '{node}' execution failed: {source}")]
    NodeExecution {
        /// Node whose dispatch failed.
        node: String,
        /// Last error returned by the executor.
        source: BoxError,
    },

    /// A single node dispatch exceeded the per-dispatch timeout. Treated as
    /// a retryable failure, subject to the same backoff policy.
    #[error("node '{node}' timed out after {timeout:?}")]
    NodeTimeout {
        /// Node whose dispatch timed out.
        node: String,
        /// Configured per-dispatch timeout.
        timeout: Duration,
    },

    /// A node was visited more times than the run's `max_iterations` bound.
    /// Run-terminal but not a bug: it signals a legal cycle that never
    /// reached its exit condition within the bound.
    #[error("node '{node}' exceeded the cycle bound of {limit} visits")]
    CycleLimitExceeded {
        /// Node whose visit count exceeded the bound.
        node: String,
        /// Configured `max_iterations`.
        limit: u32,
    },

    /// The run as a whole exceeded its wall-clock timeout.
    #[error("run timed out after {0:?}")]
    RunTimeout(Duration),

    /// A checkpoint with the given name does not exist.
    #[error("checkpoint '{name}' not found")]
    CheckpointNotFound {
        /// Name of the missing checkpoint.
        name: String,
    },

    /// The checkpoint storage collaborator failed.
    #[error("checkpoint storage error: {0}")]
    CheckpointStorage(BoxError),

    /// Attempted to run a graph with no nodes.
    #[error("cannot run an empty graph")]
    EmptyGraph,

    /// Internal scheduler invariant violated. Indicates a bug in the engine,
    /// not in the caller's graph.
    #[error("internal execution error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the flow safeguards may retry a dispatch that failed with
    /// this error. Only executor failures and per-dispatch timeouts are
    /// transient; everything else is terminal on first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NodeExecution { .. } | Self::NodeTimeout { .. })
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(Violation::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_all_violations() {
        let err = Error::Validation(vec![
            Violation::NoEntryPoint,
            Violation::UnreachableNode {
                node: "orphan".to_string(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("2 violation(s)"));
        assert!(msg.contains("no entry point"));
        assert!(msg.contains("'orphan'"));
    }

    #[test]
    fn retryable_classification() {
        let exec = Error::NodeExecution {
            node: "a".to_string(),
            source: "boom".into(),
        };
        let timeout = Error::NodeTimeout {
            node: "a".to_string(),
            timeout: Duration::from_secs(1),
        };
        let dead_end = Error::DeadEnd {
            node: "a".to_string(),
        };
        assert!(exec.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!dead_end.is_retryable());
        assert!(!Error::EmptyGraph.is_retryable());
    }

    #[test]
    fn violation_display() {
        let v = Violation::ConditionalEdgeWithoutCondition {
            source: "a".to_string(),
            target: "b".to_string(),
        };
        assert_eq!(
            v.to_string(),
            "conditional edge a -> b has no condition predicate"
        );
    }
}
