// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Per-node execution safeguards.
//!
//! Every dispatch is wrapped in a timeout, retried with exponential backoff
//! on retryable failures, and raced against a cancellation token. Fan-out
//! groups share a child token; with `cancel_on_failure` set, the first
//! branch failure cancels the siblings, and the group still waits for every
//! branch to acknowledge before reporting (all-complete barrier).
//!
//! Backoff is deterministic: attempt `k` (1-based) sleeps
//! `backoff_base * backoff_multiplier^(k-1)` before retrying. No jitter, so
//! the retry schedule for the defaults is exactly 1s, 2s, 4s.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::executor::{NodeExecutor, NodeOutcome};
use crate::node::Node;
use crate::state::StateSnapshot;

/// Limits applied to every node dispatch.
#[derive(Debug, Clone)]
pub struct SafeguardPolicy {
    /// Wall-clock budget for a single execution attempt.
    pub timeout: Duration,
    /// Retries after the first attempt. `3` means up to 4 attempts total.
    pub retry_count: u32,
    /// Sleep before the first retry.
    pub backoff_base: Duration,
    /// Multiplier applied to the sleep for each further retry.
    pub backoff_multiplier: f64,
    /// Cancel sibling branches of a fan-out group when one branch fails.
    pub cancel_on_failure: bool,
}

impl Default for SafeguardPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            retry_count: 3,
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            cancel_on_failure: true,
        }
    }
}

impl SafeguardPolicy {
    /// Sleep before retry attempt `attempt` (1-based).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base
            .mul_f64(self.backoff_multiplier.powi(attempt as i32 - 1))
    }
}

/// Terminal result of one safeguarded dispatch.
#[derive(Debug)]
pub(crate) enum DispatchOutcome {
    /// The node completed; its outcome is ready to merge.
    Completed(NodeOutcome),
    /// The node failed after exhausting retries, or failed terminally.
    Failed(Error),
    /// The dispatch was cancelled before completing.
    Cancelled,
}

/// Run one node under the policy: timeout per attempt, retry with backoff
/// on retryable errors, bail out promptly on cancellation.
pub(crate) async fn dispatch(
    policy: &SafeguardPolicy,
    executor: &dyn NodeExecutor,
    node: &Node,
    snapshot: StateSnapshot,
    cancel: &CancellationToken,
) -> DispatchOutcome {
    let mut last_error: Option<Error> = None;

    for attempt in 0..=policy.retry_count {
        if cancel.is_cancelled() {
            return DispatchOutcome::Cancelled;
        }
        if attempt > 0 {
            let delay = policy.backoff_delay(attempt);
            tracing::debug!(
                node = %node.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return DispatchOutcome::Cancelled,
            }
        }

        let attempt_result = tokio::select! {
            timed = tokio::time::timeout(
                policy.timeout,
                executor.execute(node, snapshot.clone(), cancel.child_token()),
            ) => match timed {
                Ok(Ok(outcome)) => return DispatchOutcome::Completed(outcome),
                Ok(Err(source)) => Error::NodeExecution {
                    node: node.id.clone(),
                    source,
                },
                Err(_) => Error::NodeTimeout {
                    node: node.id.clone(),
                    timeout: policy.timeout,
                },
            },
            _ = cancel.cancelled() => return DispatchOutcome::Cancelled,
        };

        tracing::warn!(node = %node.id, attempt, error = %attempt_result, "node attempt failed");
        if !attempt_result.is_retryable() {
            return DispatchOutcome::Failed(attempt_result);
        }
        last_error = Some(attempt_result);
    }

    DispatchOutcome::Failed(last_error.unwrap_or_else(|| {
        Error::Internal(format!("node '{}' failed with no recorded error", node.id))
    }))
}

/// Run a fan-out group concurrently under a shared child token.
///
/// Returns one outcome per node, in dispatch order, only after every branch
/// has finished or acknowledged cancellation.
pub(crate) async fn dispatch_group(
    policy: &SafeguardPolicy,
    executor: Arc<dyn NodeExecutor>,
    nodes: Vec<Node>,
    snapshot: StateSnapshot,
    cancel: &CancellationToken,
) -> Vec<DispatchOutcome> {
    let group_token = cancel.child_token();
    let mut results: Vec<Option<DispatchOutcome>> = nodes.iter().map(|_| None).collect();

    let mut branches: FuturesUnordered<_> = nodes
        .into_iter()
        .enumerate()
        .map(|(index, node)| {
            let policy = policy.clone();
            let executor = Arc::clone(&executor);
            let snapshot = snapshot.clone();
            let token = group_token.clone();
            let handle = tokio::spawn(async move {
                dispatch(&policy, executor.as_ref(), &node, snapshot, &token).await
            });
            async move { (index, handle.await) }
        })
        .collect();

    while let Some((index, joined)) = branches.next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(join_error) => {
                DispatchOutcome::Failed(Error::Internal(format!("branch task failed: {join_error}")))
            }
        };
        if matches!(outcome, DispatchOutcome::Failed(_)) && policy.cancel_on_failure {
            group_token.cancel();
        }
        results[index] = Some(outcome);
    }

    results
        .into_iter()
        .map(|slot| slot.unwrap_or(DispatchOutcome::Cancelled))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorRegistry;
    use crate::state::StateStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn snapshot() -> StateSnapshot {
        StateStore::new().snapshot()
    }

    fn quick_policy() -> SafeguardPolicy {
        SafeguardPolicy {
            timeout: Duration::from_secs(10),
            retry_count: 3,
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            cancel_on_failure: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_follow_exponential_backoff() {
        // Fails three times, succeeds on the fourth attempt; with base 1s
        // and multiplier 2 the retry sleeps are exactly 1s + 2s + 4s.
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let mut registry = ExecutorRegistry::new();
        registry.register("flaky", move |_n, _s, _c| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err("transient".into())
                } else {
                    Ok(NodeOutcome::output(json!("ok")))
                }
            })
        });

        let node = Node::agent("flaky", "a");
        let started = Instant::now();
        let outcome = dispatch(
            &quick_policy(),
            &registry,
            &node,
            snapshot(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(outcome, DispatchOutcome::Completed(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_with_last_error() {
        let mut registry = ExecutorRegistry::new();
        registry.register("doomed", |_n, _s, _c| {
            Box::pin(async { Err("always broken".into()) })
        });

        let node = Node::agent("doomed", "a");
        let outcome = dispatch(
            &quick_policy(),
            &registry,
            &node,
            snapshot(),
            &CancellationToken::new(),
        )
        .await;

        match outcome {
            DispatchOutcome::Failed(Error::NodeExecution { node, source }) => {
                assert_eq!(node, "doomed");
                assert!(source.to_string().contains("always broken"));
            }
            other => panic!("expected NodeExecution failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_node_times_out_and_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let mut registry = ExecutorRegistry::new();
        registry.register("hung", move |_n, _s, _c| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(NodeOutcome::default())
            })
        });

        let policy = SafeguardPolicy {
            timeout: Duration::from_secs(5),
            retry_count: 1,
            ..quick_policy()
        };
        let node = Node::tool("hung", "slow");
        let outcome = dispatch(&policy, &registry, &node, snapshot(), &CancellationToken::new())
            .await;

        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(Error::NodeTimeout { .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_backoff_sleep() {
        let mut registry = ExecutorRegistry::new();
        registry.register("flaky", |_n, _s, _c| {
            Box::pin(async { Err("transient".into()) })
        });

        let cancel = CancellationToken::new();
        let node = Node::agent("flaky", "a");
        let policy = quick_policy();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let outcome = dispatch(&policy, &registry, &node, snapshot(), &cancel).await;
        assert!(matches!(outcome, DispatchOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn group_failure_cancels_siblings() {
        let mut registry = ExecutorRegistry::new();
        registry.register("fast_fail", |_n, _s, _c| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Err("boom".into())
            })
        });
        registry.register("slow_ok", |_n, _s, cancel| {
            Box::pin(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(600)) => {
                        Ok(NodeOutcome::output(json!("finished")))
                    }
                    _ = cancel.cancelled() => Err("interrupted".into()),
                }
            })
        });

        let policy = SafeguardPolicy {
            retry_count: 0,
            timeout: Duration::from_secs(3600),
            ..quick_policy()
        };
        let nodes = vec![Node::agent("fast_fail", "a"), Node::agent("slow_ok", "b")];
        let started = Instant::now();
        let results = dispatch_group(
            &policy,
            Arc::new(registry),
            nodes,
            snapshot(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(results[0], DispatchOutcome::Failed(_)));
        assert!(matches!(results[1], DispatchOutcome::Cancelled));
        // The slow branch was cut short, not awaited for its full 600s.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn group_without_cancel_on_failure_lets_siblings_finish() {
        let mut registry = ExecutorRegistry::new();
        registry.register("fail", |_n, _s, _c| Box::pin(async { Err("boom".into()) }));
        registry.register("ok", |_n, _s, _c| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(NodeOutcome::output(json!(42)))
            })
        });

        let policy = SafeguardPolicy {
            retry_count: 0,
            cancel_on_failure: false,
            timeout: Duration::from_secs(3600),
            ..quick_policy()
        };
        let nodes = vec![Node::agent("fail", "a"), Node::agent("ok", "b")];
        let results = dispatch_group(
            &policy,
            Arc::new(registry),
            nodes,
            snapshot(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(results[0], DispatchOutcome::Failed(_)));
        match &results[1] {
            DispatchOutcome::Completed(outcome) => assert_eq!(outcome.output, json!(42)),
            other => panic!("sibling should finish, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn group_results_are_in_dispatch_order() {
        let mut registry = ExecutorRegistry::new();
        registry.register("slow", |_n, _s, _c| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(NodeOutcome::output(json!("slow")))
            })
        });
        registry.register("quick", |_n, _s, _c| {
            Box::pin(async { Ok(NodeOutcome::output(json!("quick"))) })
        });

        let policy = quick_policy();
        let nodes = vec![Node::agent("slow", "a"), Node::agent("quick", "b")];
        let results = dispatch_group(
            &policy,
            Arc::new(registry),
            nodes,
            snapshot(),
            &CancellationToken::new(),
        )
        .await;

        // "slow" finishes last but still reports first.
        let outputs: Vec<_> = results
            .iter()
            .map(|r| match r {
                DispatchOutcome::Completed(o) => o.output.clone(),
                other => panic!("unexpected outcome {other:?}"),
            })
            .collect();
        assert_eq!(outputs, vec![json!("slow"), json!("quick")]);
    }
}
