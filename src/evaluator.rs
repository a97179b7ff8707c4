// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Edge evaluation: which edges activate after a node completes.
//!
//! The rules are strict so two runs of the same graph with the same external
//! outputs activate the same edges in the same order:
//!
//! 1. Only outgoing edges of the completed node are considered, in the order
//!    they were added to the graph.
//! 2. Conditional edges qualify iff their predicate is true against the
//!    current snapshot.
//! 3. If any Parallel edges qualify, they all activate together as one
//!    fan-out group; parallel wins over plain/conditional from the same
//!    source.
//! 4. Otherwise exactly one Plain/Conditional edge activates: highest
//!    priority first, insertion order breaking ties.
//! 5. Zero qualifying edges from a non-exit node is a dead end and fails
//!    the run; from an exit point the branch just terminates.

use crate::edge::{Edge, EdgeKind};
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::state::StateSnapshot;

/// The edges a completed node activates next.
#[derive(Debug)]
pub enum Activation<'g> {
    /// The branch reached an exit point; nothing to activate.
    Exit,
    /// A single plain or conditional edge won the tie-break.
    Single(&'g Edge),
    /// All qualifying parallel edges fan out together.
    Group(Vec<&'g Edge>),
}

impl<'g> Activation<'g> {
    /// Target node ids in activation order.
    pub fn targets(&self) -> Vec<&'g str> {
        match self {
            Self::Exit => Vec::new(),
            Self::Single(edge) => vec![edge.target.as_str()],
            Self::Group(edges) => edges.iter().map(|e| e.target.as_str()).collect(),
        }
    }
}

/// Compute the activation set for `node_id` given the current snapshot.
///
/// # Errors
///
/// [`Error::DeadEnd`] when no edge qualifies and the node is not an exit
/// point.
pub fn next_edges<'g>(
    graph: &'g Graph,
    node_id: &str,
    snapshot: &StateSnapshot,
) -> Result<Activation<'g>> {
    let qualifying: Vec<&Edge> = graph
        .outgoing(node_id)
        .filter(|edge| edge.qualifies(snapshot))
        .collect();

    let parallel: Vec<&Edge> = qualifying
        .iter()
        .copied()
        .filter(|edge| edge.kind == EdgeKind::Parallel)
        .collect();
    if !parallel.is_empty() {
        tracing::debug!(node = node_id, fanout = parallel.len(), "parallel fan-out");
        return Ok(Activation::Group(parallel));
    }

    // Highest priority wins; stable max-by keeps the first-added edge on
    // ties because iteration is in insertion order.
    let winner = qualifying
        .iter()
        .copied()
        .filter(|edge| edge.kind != EdgeKind::Parallel)
        .fold(None::<&Edge>, |best, edge| match best {
            Some(current) if current.priority >= edge.priority => Some(current),
            _ => Some(edge),
        });

    match winner {
        Some(edge) => Ok(Activation::Single(edge)),
        None if graph.is_exit_point(node_id) => Ok(Activation::Exit),
        None => Err(Error::DeadEnd {
            node: node_id.to_string(),
        }),
    }
}
