// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Lifecycle events emitted while a run progresses.
//!
//! Observers register a callback on [`RunConfig`](crate::executor::scheduler::RunConfig);
//! the scheduler invokes it synchronously from its control task, so callbacks
//! must be fast and must not block.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

/// Something that happened during a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A node (or fan-out branch) was handed to its executor.
    NodeStarted {
        /// Run the event belongs to.
        run_id: String,
        /// The node being executed.
        node: String,
    },
    /// A node completed and its patch was merged.
    NodeCompleted {
        run_id: String,
        node: String,
        /// Output recorded in state under the node's id.
        output: Value,
        /// Wall-clock time from dispatch to completion, retries included.
        elapsed: Duration,
    },
    /// A node failed terminally (retries exhausted or non-retryable).
    NodeFailed {
        run_id: String,
        node: String,
        /// Render of the failure.
        error: String,
        elapsed: Duration,
    },
    /// A node was cancelled before completing, typically because a sibling
    /// branch failed or the run was shut down.
    NodeSkipped { run_id: String, node: String },
}

impl RunEvent {
    /// Node id the event refers to.
    pub fn node(&self) -> &str {
        match self {
            Self::NodeStarted { node, .. }
            | Self::NodeCompleted { node, .. }
            | Self::NodeFailed { node, .. }
            | Self::NodeSkipped { node, .. } => node,
        }
    }

    /// Run id the event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            Self::NodeStarted { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::NodeSkipped { run_id, .. } => run_id,
        }
    }
}

/// Observer callback invoked from the scheduler's control task.
pub type EventCallback = Arc<dyn Fn(&RunEvent) + Send + Sync>;
