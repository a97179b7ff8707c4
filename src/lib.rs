// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! flowgraph: a stateful, graph-based workflow execution engine.
//!
//! A workflow is a typed graph of nodes (agent calls, tool calls, condition
//! checks, human input, subgraphs) connected by plain, conditional and
//! parallel edges. The engine validates the graph once, then drives it to a
//! terminal state: versioned key/value state with checkpoint/restore, strict
//! dispatch-order merging for parallel fan-out, per-node timeout and retry
//! safeguards, cycle bounding, and a round-based termination evaluator for
//! peer-style flows.
//!
//! The engine executes nothing itself. Every non-inline node is delegated to
//! a [`NodeExecutor`] you supply — typically an [`ExecutorRegistry`] mapping
//! node ids to async handlers.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowgraph::{
//!     Edge, ExecutorRegistry, Graph, Node, NodeOutcome, RunConfig, Scheduler,
//! };
//! use serde_json::json;
//!
//! # async fn demo() -> flowgraph::Result<()> {
//! let mut graph = Graph::new("review");
//! graph.add_node(Node::input("in"))?;
//! graph.add_node(Node::agent("draft", "writer"))?;
//! graph.add_node(Node::output("out"))?;
//! graph.add_edge(Edge::plain("in", "draft"))?;
//! graph.add_edge(Edge::plain("draft", "out"))?;
//!
//! let mut registry = ExecutorRegistry::new();
//! registry.register("draft", |_node, snapshot, _cancel| {
//!     Box::pin(async move {
//!         let task = snapshot.get("input").cloned().unwrap_or_default();
//!         Ok(NodeOutcome::output(json!({ "draft": task })))
//!     })
//! });
//!
//! let scheduler = Scheduler::new(Arc::new(registry));
//! let run = scheduler
//!     .run(Arc::new(graph), json!("write a summary"), RunConfig::default())
//!     .await?;
//! assert!(run.succeeded());
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod edge;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod executor;
pub mod graph;
pub mod node;
pub mod safeguards;
pub mod state;
pub mod termination;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, PersistedCheckpoint};
pub use edge::{Edge, EdgeCondition, EdgeKind};
pub use error::{BoxError, Error, Result, Violation};
pub use evaluator::{next_edges, Activation};
pub use event::{EventCallback, RunEvent};
pub use executor::scheduler::{RunConfig, RunStatus, Scheduler, WorkflowRun};
pub use executor::{ExecutorRegistry, HandlerFuture, NodeExecutor, NodeOutcome};
pub use graph::{Graph, GraphManifest};
pub use node::{Node, NodeConfig, NodeKind, NodeStatus};
pub use safeguards::SafeguardPolicy;
pub use state::{Checkpoint, StatePatch, StateSnapshot, StateStore};
pub use termination::{
    ParticipantReport, RoundDecision, RoundReport, TerminationEvaluator, TerminationPolicy,
    TerminationReason,
};
