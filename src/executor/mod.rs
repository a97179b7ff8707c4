// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The node-execution boundary.
//!
//! The engine never calls an LLM, a tool, or a human itself: every non-inline
//! node is handed to a [`NodeExecutor`] with its typed config and an isolated
//! read-only state snapshot, and comes back as a [`NodeOutcome`] carrying a
//! state patch. Executors must tolerate being called more than once for the
//! same node (the safeguards retry transient failures) and must honor
//! cooperative cancellation by returning promptly once the token is
//! cancelled.
//!
//! [`ExecutorRegistry`] is the default implementation: an explicit, per-run
//! table of handlers keyed by node id with per-kind fallbacks. There is no
//! ambient global registry anywhere in the engine.

pub mod scheduler;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;
use crate::node::{Node, NodeKind};
use crate::state::{StatePatch, StateSnapshot};

/// What a node execution produced.
#[derive(Debug, Clone, Default)]
pub struct NodeOutcome {
    /// State mutations to merge. Applied by the scheduler only, in dispatch
    /// order for fan-out groups.
    pub patch: StatePatch,
    /// The node's output value, recorded in state under the node's id.
    pub output: Value,
}

impl NodeOutcome {
    /// Outcome with just an output value and no extra patch.
    pub fn output(value: Value) -> Self {
        Self {
            patch: StatePatch::new(),
            output: value,
        }
    }

    /// Outcome with an output value and a state patch.
    pub fn with_patch(value: Value, patch: StatePatch) -> Self {
        Self {
            patch,
            output: value,
        }
    }
}

/// External collaborator that executes a single node.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Execute `node` against a read-only snapshot.
    ///
    /// Must be idempotent-safe under retry and must stop at its next
    /// suspension point once `cancel` fires.
    async fn execute(
        &self,
        node: &Node,
        snapshot: StateSnapshot,
        cancel: CancellationToken,
    ) -> std::result::Result<NodeOutcome, BoxError>;
}

/// Boxed future returned by registry handlers.
pub type HandlerFuture =
    Pin<Box<dyn Future<Output = std::result::Result<NodeOutcome, BoxError>> + Send>>;

type Handler = Arc<dyn Fn(Node, StateSnapshot, CancellationToken) -> HandlerFuture + Send + Sync>;

/// Explicit handler table implementing [`NodeExecutor`].
///
/// Handlers are looked up by node id first, then by node kind. The registry
/// is passed into the scheduler per run, replacing the original engine's
/// process-global agent/tool registries.
///
/// # Example
///
/// ```rust,ignore
/// let mut registry = ExecutorRegistry::new();
/// registry.register("summarize", |_node, snapshot, _cancel| {
///     Box::pin(async move {
///         let text = snapshot.get("input").cloned().unwrap_or_default();
///         Ok(NodeOutcome::output(json!({ "summary": text })))
///     })
/// });
/// ```
#[derive(Default)]
pub struct ExecutorRegistry {
    by_id: HashMap<String, Handler>,
    by_kind: HashMap<NodeKind, Handler>,
}

impl ExecutorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a specific node id.
    pub fn register<F>(&mut self, node_id: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Node, StateSnapshot, CancellationToken) -> HandlerFuture + Send + Sync + 'static,
    {
        self.by_id.insert(node_id.into(), Arc::new(handler));
        self
    }

    /// Register a fallback handler for every node of a kind.
    pub fn register_kind<F>(&mut self, kind: NodeKind, handler: F) -> &mut Self
    where
        F: Fn(Node, StateSnapshot, CancellationToken) -> HandlerFuture + Send + Sync + 'static,
    {
        self.by_kind.insert(kind, Arc::new(handler));
        self
    }

    fn lookup(&self, node: &Node) -> Option<&Handler> {
        self.by_id
            .get(&node.id)
            .or_else(|| self.by_kind.get(&node.kind()))
    }
}

#[async_trait]
impl NodeExecutor for ExecutorRegistry {
    async fn execute(
        &self,
        node: &Node,
        snapshot: StateSnapshot,
        cancel: CancellationToken,
    ) -> std::result::Result<NodeOutcome, BoxError> {
        match self.lookup(node) {
            Some(handler) => handler(node.clone(), snapshot, cancel).await,
            None => Err(format!(
                "no handler registered for node '{}' (kind {:?})",
                node.id,
                node.kind()
            )
            .into()),
        }
    }
}
