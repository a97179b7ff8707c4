// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Node types for the workflow graph.
//!
//! A [`Node`] is a unit of work: an agent call, a tool call, a condition
//! check, a human-input step, or a nested subgraph. Its configuration is a
//! typed [`NodeConfig`] variant per kind, checked when the node is built
//! rather than at execution time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// The kind of work a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Receives the run input.
    Input,
    /// Produces the run output.
    Output,
    /// Delegates to an agent through the external executor.
    Agent,
    /// Delegates to a tool through the external executor.
    Tool,
    /// Evaluates a condition whose result feeds conditional edges.
    Condition,
    /// Executes a nested workflow.
    Subgraph,
    /// Waits for human input.
    Human,
}

/// Execution status of a node within a run.
///
/// Transitions only move forward: Pending → Running → one of
/// {Completed, Failed, Skipped}. The only way back is an explicit
/// restore-from-checkpoint, and a node revisited through a legal cycle
/// starts a fresh visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not yet scheduled.
    Pending,
    /// Dispatched and in flight.
    Running,
    /// Finished successfully; its state patch was merged.
    Completed,
    /// Failed terminally (retries exhausted).
    Failed,
    /// Cancelled or bypassed; contributed nothing to state.
    Skipped,
}

/// Typed per-kind node configuration.
///
/// This replaces the original engine's untyped `data` dictionaries: every
/// field an executor needs is declared here and validated by
/// [`NodeConfig::validate`] at graph-construction time, so a malformed node
/// can never reach the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Run input marker. No configuration.
    Input,
    /// Run output marker. No configuration.
    Output,
    /// Agent invocation.
    Agent {
        /// Id the executor uses to look up the agent.
        agent_id: String,
        /// Optional task override; executors fall back to the state's task.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
    },
    /// Tool invocation.
    Tool {
        /// Name the executor uses to look up the tool.
        tool_name: String,
        /// Parameters forwarded verbatim to the tool.
        #[serde(default)]
        params: Map<String, Value>,
    },
    /// Condition evaluation. The executor writes its verdict into the state
    /// patch; conditional edges read it from the snapshot.
    Condition {
        /// Expression understood by the external executor.
        expression: String,
    },
    /// Nested workflow invocation.
    Subgraph {
        /// Id of the workflow to execute.
        workflow_id: String,
    },
    /// Human-input step.
    Human {
        /// Prompt shown to the human participant.
        prompt: String,
    },
}

impl NodeConfig {
    /// The node kind this configuration belongs to.
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Input => NodeKind::Input,
            Self::Output => NodeKind::Output,
            Self::Agent { .. } => NodeKind::Agent,
            Self::Tool { .. } => NodeKind::Tool,
            Self::Condition { .. } => NodeKind::Condition,
            Self::Subgraph { .. } => NodeKind::Subgraph,
            Self::Human { .. } => NodeKind::Human,
        }
    }

    /// Check the configuration for defects that would otherwise surface
    /// mid-run. Called by [`Node::new`].
    ///
    /// [`Node::new`]: crate::node::Node::new
    pub fn validate(&self, node_id: &str) -> Result<()> {
        let defect = match self {
            Self::Agent { agent_id, .. } if agent_id.is_empty() => Some("empty agent_id"),
            Self::Tool { tool_name, .. } if tool_name.is_empty() => Some("empty tool_name"),
            Self::Condition { expression } if expression.is_empty() => Some("empty expression"),
            Self::Subgraph { workflow_id } if workflow_id.is_empty() => Some("empty workflow_id"),
            _ => None,
        };
        match defect {
            Some(reason) => Err(Error::Internal(format!(
                "invalid config for node '{node_id}': {reason}"
            ))),
            None => Ok(()),
        }
    }
}

/// A node in the workflow graph.
///
/// Nodes are identified by a string id that is unique within the owning
/// [`Graph`]; edges reference them by id only, so the graph stays two flat
/// collections with no ownership cycles.
///
/// [`Graph`]: crate::graph::Graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique id within the owning graph.
    pub id: String,
    /// Typed per-kind configuration.
    pub config: NodeConfig,
    /// Opaque metadata forwarded to the executor.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Node {
    /// Build a node, validating its configuration.
    pub fn new(id: impl Into<String>, config: NodeConfig) -> Result<Self> {
        let id = id.into();
        config.validate(&id)?;
        Ok(Self {
            id,
            config,
            metadata: HashMap::new(),
        })
    }

    /// Input node with the conventional id `"input"` unless overridden.
    pub fn input(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: NodeConfig::Input,
            metadata: HashMap::new(),
        }
    }

    /// Output node.
    pub fn output(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: NodeConfig::Output,
            metadata: HashMap::new(),
        }
    }

    /// Agent node bound to `agent_id`.
    pub fn agent(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: NodeConfig::Agent {
                agent_id: agent_id.into(),
                task: None,
            },
            metadata: HashMap::new(),
        }
    }

    /// Tool node bound to `tool_name`.
    pub fn tool(id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: NodeConfig::Tool {
                tool_name: tool_name.into(),
                params: Map::new(),
            },
            metadata: HashMap::new(),
        }
    }

    /// Condition node evaluating `expression`.
    pub fn condition(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: NodeConfig::Condition {
                expression: expression.into(),
            },
            metadata: HashMap::new(),
        }
    }

    /// Subgraph node invoking `workflow_id`.
    pub fn subgraph(id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: NodeConfig::Subgraph {
                workflow_id: workflow_id.into(),
            },
            metadata: HashMap::new(),
        }
    }

    /// Human-input node.
    pub fn human(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: NodeConfig::Human {
                prompt: prompt.into(),
            },
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The node's kind, derived from its configuration.
    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }

    /// Input and Output nodes execute inline in the scheduler; everything
    /// else goes through the external executor.
    pub(crate) fn is_inline(&self) -> bool {
        matches!(self.kind(), NodeKind::Input | NodeKind::Output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_derived_from_config() {
        assert_eq!(Node::agent("a", "researcher").kind(), NodeKind::Agent);
        assert_eq!(Node::tool("t", "web_search").kind(), NodeKind::Tool);
        assert_eq!(Node::input("in").kind(), NodeKind::Input);
        assert_eq!(Node::output("out").kind(), NodeKind::Output);
        assert_eq!(Node::condition("c", "x > 1").kind(), NodeKind::Condition);
        assert_eq!(Node::subgraph("s", "wf").kind(), NodeKind::Subgraph);
        assert_eq!(Node::human("h", "approve?").kind(), NodeKind::Human);
    }

    #[test]
    fn config_validation_rejects_empty_bindings() {
        let bad = NodeConfig::Agent {
            agent_id: String::new(),
            task: None,
        };
        assert!(Node::new("a", bad).is_err());

        let ok = NodeConfig::Agent {
            agent_id: "researcher".to_string(),
            task: Some("summarize".to_string()),
        };
        assert!(Node::new("a", ok).is_ok());
    }

    #[test]
    fn inline_kinds() {
        assert!(Node::input("in").is_inline());
        assert!(Node::output("out").is_inline());
        assert!(!Node::agent("a", "x").is_inline());
        assert!(!Node::human("h", "p").is_inline());
    }

    #[test]
    fn config_serializes_with_kind_tag() {
        let node = Node::tool("t", "calculator");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["config"]["kind"], "tool");
        assert_eq!(json["config"]["tool_name"], "calculator");
    }
}
