// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The execution scheduler: drives a validated graph to a terminal state.
//!
//! The loop is a ready-queue of activation groups seeded with the graph's
//! entry points. Each popped group is dispatched through the flow safeguards
//! to the external executor, its patches are merged strictly in dispatch
//! order, a checkpoint is persisted, and the edge evaluator computes the
//! next groups. The run ends when the queue drains with every branch at an
//! exit point, a node fails terminally, a per-node visit bound is exceeded,
//! or the run-level timeout expires.
//!
//! The scheduler is the only writer of the state store. Node tasks get
//! isolated snapshots and return patches, so there are no locks anywhere on
//! the execution path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore, PersistedCheckpoint};
use crate::error::{Error, Result};
use crate::evaluator::{next_edges, Activation};
use crate::event::{EventCallback, RunEvent};
use crate::executor::{NodeExecutor, NodeOutcome};
use crate::graph::Graph;
use crate::node::{Node, NodeKind, NodeStatus};
use crate::safeguards::{dispatch, dispatch_group, DispatchOutcome, SafeguardPolicy};
use crate::state::{StatePatch, StateSnapshot, StateStore};

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Still executing (only observable through events).
    Running,
    /// Every reached branch ended at an exit point.
    Completed,
    /// A node failed terminally, or a branch dead-ended.
    Failed,
    /// A node exceeded the per-node visit bound.
    CycleLimitExceeded,
    /// The run-level timeout expired.
    TimedOut,
}

/// Per-run configuration.
#[derive(Clone)]
pub struct RunConfig {
    /// Per-node visit bound; a legal cycle terminates with
    /// [`RunStatus::CycleLimitExceeded`] once any node exceeds it.
    pub max_iterations: u32,
    /// Wall-clock budget for the whole run.
    pub run_timeout: Option<Duration>,
    /// Timeout/retry/cancellation policy around every dispatch.
    pub safeguards: SafeguardPolicy,
    /// Optional lifecycle-event observer.
    pub event_callback: Option<EventCallback>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            run_timeout: None,
            safeguards: SafeguardPolicy::default(),
            event_callback: None,
        }
    }
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("max_iterations", &self.max_iterations)
            .field("run_timeout", &self.run_timeout)
            .field("safeguards", &self.safeguards)
            .field("event_callback", &self.event_callback.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// The terminal record of one run: final state, per-node statuses, the
/// execution trace and the terminal error if any.
#[derive(Debug)]
pub struct WorkflowRun {
    /// Unique run id (UUID v4).
    pub run_id: String,
    /// The graph that was executed.
    pub graph: Arc<Graph>,
    /// Final state, including its full version history.
    pub state: StateStore,
    /// Terminal status.
    pub status: RunStatus,
    /// Terminal error for Failed / CycleLimitExceeded / TimedOut runs.
    pub error: Option<Error>,
    /// Final status per node id.
    pub node_statuses: HashMap<String, NodeStatus>,
    /// Visits per node id, cycle traversals included.
    pub visit_counts: HashMap<String, u32>,
    /// Node ids in the order their results merged.
    pub nodes_executed: Vec<String>,
}

impl WorkflowRun {
    /// Whether the run completed normally.
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// The recorded output of a node, if it completed.
    pub fn node_output(&self, node_id: &str) -> Option<&Value> {
        self.state.get(node_id)
    }
}

/// Drives runs of validated graphs against an external executor.
pub struct Scheduler {
    executor: Arc<dyn NodeExecutor>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl Scheduler {
    /// Scheduler with the default in-memory checkpoint store.
    pub fn new(executor: Arc<dyn NodeExecutor>) -> Self {
        Self {
            executor,
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
        }
    }

    /// Use a custom checkpoint store.
    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    /// Execute `graph` to a terminal state.
    ///
    /// Validation failures return `Err` before anything runs. Execution
    /// failures do not: the run record comes back with
    /// [`RunStatus::Failed`] (or `CycleLimitExceeded` / `TimedOut`), the
    /// partial state, and the terminal error.
    pub async fn run(
        &self,
        graph: Arc<Graph>,
        input: Value,
        config: RunConfig,
    ) -> Result<WorkflowRun> {
        graph.validated()?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("graph.invoke", graph = %graph.name, run_id = %run_id);
        let cancel = CancellationToken::new();

        let mut ctx = RunState {
            run_id,
            state: StateStore::new(),
            statuses: graph
                .node_ids()
                .map(|id| (id.to_string(), NodeStatus::Pending))
                .collect(),
            visit_counts: HashMap::new(),
            nodes_executed: Vec::new(),
        };

        let outcome = {
            let drive = self
                .drive(&graph, &input, &config, &cancel, &mut ctx)
                .instrument(span);
            match config.run_timeout {
                Some(budget) => match tokio::time::timeout(budget, drive).await {
                    Ok(result) => result,
                    Err(_) => {
                        cancel.cancel();
                        Err(Error::RunTimeout(budget))
                    }
                },
                None => drive.await,
            }
        };

        let (status, error) = match outcome {
            Ok(()) => (RunStatus::Completed, None),
            Err(error @ Error::CycleLimitExceeded { .. }) => {
                (RunStatus::CycleLimitExceeded, Some(error))
            }
            Err(error @ Error::RunTimeout(_)) => (RunStatus::TimedOut, Some(error)),
            Err(error) => (RunStatus::Failed, Some(error)),
        };

        // Anything still marked Running was abandoned by timeout or
        // failure; cancellation already reached its task.
        for node_status in ctx.statuses.values_mut() {
            if *node_status == NodeStatus::Running {
                *node_status = NodeStatus::Skipped;
            }
        }

        tracing::info!(
            run_id = %ctx.run_id,
            status = ?status,
            versions = ctx.state.version(),
            nodes = ctx.nodes_executed.len(),
            "run finished"
        );

        Ok(WorkflowRun {
            run_id: ctx.run_id,
            graph,
            state: ctx.state,
            status,
            error,
            node_statuses: ctx.statuses,
            visit_counts: ctx.visit_counts,
            nodes_executed: ctx.nodes_executed,
        })
    }

    /// The ready-queue loop. Returns `Ok(())` when the queue drains with
    /// every branch at an exit point.
    async fn drive(
        &self,
        graph: &Arc<Graph>,
        input: &Value,
        config: &RunConfig,
        cancel: &CancellationToken,
        ctx: &mut RunState,
    ) -> Result<()> {
        let mut queue: VecDeque<Vec<String>> = graph
            .entry_points()
            .into_iter()
            .map(|id| vec![id.to_string()])
            .collect();

        while let Some(group) = queue.pop_front() {
            for id in &group {
                let visits = ctx.visit_counts.entry(id.clone()).or_insert(0);
                *visits += 1;
                if *visits > config.max_iterations {
                    return Err(Error::CycleLimitExceeded {
                        node: id.clone(),
                        limit: config.max_iterations,
                    });
                }
            }

            let merged = self
                .execute_group(graph, &group, input, config, cancel, ctx)
                .await?;

            self.checkpoints
                .save(PersistedCheckpoint {
                    run_id: ctx.run_id.clone(),
                    version: ctx.state.version(),
                    node: merged.last().cloned(),
                    created_at: Utc::now(),
                    state: ctx.state.clone(),
                })
                .await?;

            // Next groups per completed node, in merge order; targets
            // activated twice in the same step coalesce.
            let snapshot = ctx.state.snapshot();
            let mut seen: HashSet<String> = HashSet::new();
            for id in &merged {
                match next_edges(graph, id, &snapshot)? {
                    Activation::Exit => {
                        tracing::debug!(node = %id, "branch reached exit point");
                    }
                    Activation::Single(edge) => {
                        if seen.insert(edge.target.clone()) {
                            queue.push_back(vec![edge.target.clone()]);
                        }
                    }
                    Activation::Group(edges) => {
                        let members: Vec<String> = edges
                            .iter()
                            .filter(|edge| seen.insert(edge.target.clone()))
                            .map(|edge| edge.target.clone())
                            .collect();
                        if !members.is_empty() {
                            queue.push_back(members);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Execute one activation group and merge its results. Returns the node
    /// ids whose outcomes merged, in dispatch order.
    async fn execute_group(
        &self,
        graph: &Arc<Graph>,
        group: &[String],
        input: &Value,
        config: &RunConfig,
        cancel: &CancellationToken,
        ctx: &mut RunState,
    ) -> Result<Vec<String>> {
        let nodes: Vec<Node> = group
            .iter()
            .map(|id| {
                graph
                    .node(id)
                    .cloned()
                    .ok_or_else(|| Error::Internal(format!("activated unknown node '{id}'")))
            })
            .collect::<Result<_>>()?;

        let snapshot = ctx.state.snapshot();
        for node in &nodes {
            ctx.statuses.insert(node.id.clone(), NodeStatus::Running);
            emit(
                config,
                &RunEvent::NodeStarted {
                    run_id: ctx.run_id.clone(),
                    node: node.id.clone(),
                },
            );
        }
        let started = Instant::now();

        // Inline kinds (Input/Output) never leave the scheduler; the rest go
        // through the safeguards. Mixed groups keep dispatch order.
        let external: Vec<Node> = nodes.iter().filter(|n| !n.is_inline()).cloned().collect();
        let mut external_results = if external.is_empty() {
            Vec::new()
        } else if external.len() == 1 && nodes.len() == 1 {
            let node = &external[0];
            let span = tracing::info_span!("node.execute", node = %node.id);
            vec![
                dispatch(&config.safeguards, self.executor.as_ref(), node, snapshot.clone(), cancel)
                    .instrument(span)
                    .await,
            ]
        } else {
            tracing::debug!(fanout = external.len(), "dispatching fan-out group");
            dispatch_group(
                &config.safeguards,
                Arc::clone(&self.executor),
                external,
                snapshot.clone(),
                cancel,
            )
            .await
        }
        .into_iter();

        let mut outcomes: Vec<(String, DispatchOutcome)> = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let outcome = if node.is_inline() {
                DispatchOutcome::Completed(inline_outcome(node, input, &snapshot))
            } else {
                external_results.next().ok_or_else(|| {
                    Error::Internal(format!("missing dispatch result for node '{}'", node.id))
                })?
            };
            outcomes.push((node.id.clone(), outcome));
        }

        let elapsed = started.elapsed();
        let group_failed = config.safeguards.cancel_on_failure
            && outcomes
                .iter()
                .any(|(_, o)| matches!(o, DispatchOutcome::Failed(_)));

        if group_failed {
            // The group is atomic under cancel-on-failure: nothing merges,
            // the first failure is the run error.
            let mut first_failure = None;
            for (id, outcome) in outcomes {
                match outcome {
                    DispatchOutcome::Failed(error) => {
                        ctx.statuses.insert(id.clone(), NodeStatus::Failed);
                        emit(
                            config,
                            &RunEvent::NodeFailed {
                                run_id: ctx.run_id.clone(),
                                node: id,
                                error: error.to_string(),
                                elapsed,
                            },
                        );
                        first_failure.get_or_insert(error);
                    }
                    DispatchOutcome::Completed(_) | DispatchOutcome::Cancelled => {
                        ctx.statuses.insert(id.clone(), NodeStatus::Skipped);
                        emit(
                            config,
                            &RunEvent::NodeSkipped {
                                run_id: ctx.run_id.clone(),
                                node: id,
                            },
                        );
                    }
                }
            }
            return Err(first_failure
                .unwrap_or_else(|| Error::Internal("group failed with no error".to_string())));
        }

        // Merge in dispatch order, never completion order; failed members
        // (cancel_on_failure=false) leave a failure marker instead of a
        // patch and do not activate successors.
        let mut merged = Vec::new();
        let mut first_failure = None;
        for (id, outcome) in outcomes {
            match outcome {
                DispatchOutcome::Completed(outcome) => {
                    let patch = outcome.patch.set(&id, outcome.output.clone());
                    ctx.state.apply(&patch, Some(&id));
                    ctx.statuses.insert(id.clone(), NodeStatus::Completed);
                    ctx.nodes_executed.push(id.clone());
                    emit(
                        config,
                        &RunEvent::NodeCompleted {
                            run_id: ctx.run_id.clone(),
                            node: id.clone(),
                            output: outcome.output,
                            elapsed,
                        },
                    );
                    merged.push(id);
                }
                DispatchOutcome::Failed(error) => {
                    let rendered = error.to_string();
                    let marker =
                        StatePatch::new().set(&id, serde_json::json!({ "error": rendered }));
                    ctx.state.apply(&marker, Some(&id));
                    ctx.statuses.insert(id.clone(), NodeStatus::Failed);
                    emit(
                        config,
                        &RunEvent::NodeFailed {
                            run_id: ctx.run_id.clone(),
                            node: id,
                            error: rendered,
                            elapsed,
                        },
                    );
                    first_failure.get_or_insert(error);
                }
                DispatchOutcome::Cancelled => {
                    ctx.statuses.insert(id.clone(), NodeStatus::Skipped);
                    emit(
                        config,
                        &RunEvent::NodeSkipped {
                            run_id: ctx.run_id.clone(),
                            node: id,
                        },
                    );
                }
            }
        }

        if merged.is_empty() {
            // Every member failed or was cancelled; nothing can continue
            // from this group.
            return Err(first_failure.unwrap_or_else(|| {
                Error::Internal(format!("no member of group {group:?} completed"))
            }));
        }

        Ok(merged)
    }
}

struct RunState {
    run_id: String,
    state: StateStore,
    statuses: HashMap<String, NodeStatus>,
    visit_counts: HashMap<String, u32>,
    nodes_executed: Vec<String>,
}

/// Input nodes seed the state with the run input; Output nodes record the
/// final snapshot under their own id.
fn inline_outcome(node: &Node, input: &Value, snapshot: &StateSnapshot) -> NodeOutcome {
    match node.kind() {
        NodeKind::Input => NodeOutcome::with_patch(
            input.clone(),
            StatePatch::new().set("input", input.clone()),
        ),
        _ => NodeOutcome::output(snapshot.to_value()),
    }
}

fn emit(config: &RunConfig, event: &RunEvent) {
    if let Some(callback) = &config.event_callback {
        callback(event);
    }
}
