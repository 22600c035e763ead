use std::collections::VecDeque;
use chrono::Utc;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_NODE_LOG_SIZE;
use crate::message::Message;

/// Which side of a node a debug event was captured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum FlowDirection {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

/// One immutable execution-trace record for a node transition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DebugEvent {
    /// Capture time, unix millis.
    pub ts: i64,
    pub node_id: String,
    pub direction: FlowDirection,
    pub msg: Message,
    /// Outgoing relation label, empty on the inbound side.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub relation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DebugEvent {
    pub fn new(
        node_id: &str,
        direction: FlowDirection,
        msg: Message,
        relation: &str,
        error: Option<String>,
    ) -> Self {
        Self {
            ts: Utc::now().timestamp_millis(),
            node_id: node_id.to_string(),
            direction,
            msg,
            relation: relation.to_string(),
            error,
        }
    }
}

/// In-memory, per-node bounded buffers of recent debug events.
///
/// This is a live-inspection aid, not a durable audit log: nothing here
/// survives a restart, and once a buffer is full the oldest event is
/// evicted first.
#[derive(Debug)]
pub struct DebugTraceRecorder {
    capacity: usize,
    // workflow id -> node id -> ring of recent events
    workflows: DashMap<String, DashMap<String, VecDeque<DebugEvent>>>,
}

impl DebugTraceRecorder {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_NODE_LOG_SIZE
        } else {
            capacity
        };
        Self {
            capacity,
            workflows: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, workflow_id: &str, event: DebugEvent) {
        let nodes = self
            .workflows
            .entry(workflow_id.to_string())
            .or_insert_with(DashMap::new);
        let mut buffer = nodes
            .entry(event.node_id.clone())
            .or_insert_with(VecDeque::new);
        buffer.push_back(event);
        while buffer.len() > self.capacity {
            buffer.pop_front();
        }
    }

    /// Snapshot of the buffered events for one node, oldest first.
    pub fn events(&self, workflow_id: &str, node_id: &str) -> Vec<DebugEvent> {
        self.workflows
            .get(workflow_id)
            .and_then(|nodes| nodes.get(node_id).map(|buf| buf.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Node ids with buffered events for a workflow.
    pub fn node_ids(&self, workflow_id: &str) -> Vec<String> {
        self.workflows
            .get(workflow_id)
            .map(|nodes| nodes.iter().map(|kv| kv.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Drop every buffer held for a workflow.
    pub fn clear(&self, workflow_id: &str) {
        self.workflows.remove(workflow_id);
    }
}
