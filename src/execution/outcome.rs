use crate::core::errors::NodeFailure;
use crate::execution::events::{ExecutionEvent, ExecutionEventEnvelope, NodeStatus};
use crate::tree::{NodeType, UniqueId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Returned from a hook to abort the node instead of failing it
#[derive(Debug, Clone, Error)]
#[error("Execution aborted: {reason}")]
pub struct ExecutionAborted {
    pub reason: String,
}

impl ExecutionAborted {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Result of running one node
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub failure: Option<Arc<NodeFailure>>,
    pub reason: Option<String>,
}

impl NodeOutcome {
    pub fn succeeded() -> Self {
        Self {
            status: NodeStatus::Succeeded,
            failure: None,
            reason: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Skipped,
            failure: None,
            reason: Some(reason.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == NodeStatus::Failed
    }
}

/// Summary line for one finished or skipped node
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub unique_id: String,
    pub display_name: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    /// Primary failure first, then suppressed ones
    pub failure_chain: Vec<String>,
    pub reason: Option<String>,
}

/// Per-node results of a run, in the order nodes finished
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    nodes: Vec<NodeReport>,
}

impl ExecutionReport {
    pub fn from_events(events: &[ExecutionEventEnvelope]) -> Self {
        let nodes = events
            .iter()
            .filter_map(|envelope| match &envelope.event {
                ExecutionEvent::Finished { node, status, failure } => Some(NodeReport {
                    unique_id: node.unique_id.to_string(),
                    display_name: node.display_name.clone(),
                    node_type: node.node_type,
                    status: *status,
                    failure_chain: failure.as_ref().map(|f| f.chain()).unwrap_or_default(),
                    reason: None,
                }),
                ExecutionEvent::Skipped { node, reason } => Some(NodeReport {
                    unique_id: node.unique_id.to_string(),
                    display_name: node.display_name.clone(),
                    node_type: node.node_type,
                    status: NodeStatus::Skipped,
                    failure_chain: Vec::new(),
                    reason: Some(reason.clone()),
                }),
                _ => None,
            })
            .collect();
        Self { nodes }
    }

    pub fn nodes(&self) -> &[NodeReport] {
        &self.nodes
    }

    pub fn get(&self, unique_id: &UniqueId) -> Option<&NodeReport> {
        let rendered = unique_id.to_string();
        self.nodes.iter().find(|node| node.unique_id == rendered)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|node| node.status == status).count()
    }

    /// Counts for test nodes only, keyed by status
    pub fn test_counts(&self) -> HashMap<NodeStatus, usize> {
        let mut counts = HashMap::new();
        for node in self.nodes.iter().filter(|node| node.node_type.is_test()) {
            *counts.entry(node.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Everything a caller gets back from `Engine::execute`
#[derive(Debug, Clone)]
pub struct EngineExecutionResults {
    pub run_id: String,
    pub seed: u64,
    pub root: NodeOutcome,
    pub report: ExecutionReport,
    pub events: Vec<ExecutionEventEnvelope>,
}

impl EngineExecutionResults {
    pub fn succeeded(&self) -> bool {
        self.root.status == NodeStatus::Succeeded
    }

    pub fn event_descriptions(&self) -> Vec<String> {
        self.events.iter().map(|e| e.event.describe()).collect()
    }

    /// Descriptions of events about nodes whose id starts with `prefix`
    pub fn descriptions_below(&self, prefix: &UniqueId) -> Vec<String> {
        self.events
            .iter()
            .filter(|e| e.event.unique_id().has_prefix(prefix))
            .map(|e| e.event.describe())
            .collect()
    }

    pub fn status_of(&self, unique_id: &UniqueId) -> Option<NodeStatus> {
        self.report.get(unique_id).map(|node| node.status)
    }
}
