use std::collections::{HashMap, HashSet};
use chrono::Utc;
use petgraph::{graph::NodeIndex, prelude::StableDiGraph, visit::{Topo, Walker}};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

pub const KEY_CREATE_TIME: &str = "createTime";
pub const KEY_UPDATE_TIME: &str = "updateTime";
pub const KEY_USERNAME: &str = "username";
pub const KEY_MESSAGE: &str = "message";

/// Node configuration values with this prefix reference a shared resource id.
pub const REF_PREFIX: &str = "ref://";

fn now_stamp() -> String {
    Utc::now().format("%Y/%m/%d %H:%M:%S").to_string()
}

/// The declarative workflow document: descriptive header plus the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    pub workflow: WorkflowInfo,

    #[serde(default)]
    pub metadata: WorkflowGraph,
}

/// Header fields of a workflow document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowInfo {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub root: bool,

    #[serde(default, rename = "debugMode")]
    pub debug_mode: bool,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub configuration: HashMap<String, Value>,

    #[serde(default, rename = "additionalInfo", skip_serializing_if = "HashMap::is_empty")]
    pub additional_info: HashMap<String, Value>,
}

/// The descriptive subset a caller may update without touching the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowBaseInfo {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub root: bool,

    #[serde(default, rename = "debugMode")]
    pub debug_mode: bool,

    #[serde(default, rename = "additionalInfo", skip_serializing_if = "HashMap::is_empty")]
    pub additional_info: HashMap<String, Value>,
}

/// Nodes, endpoints and their wiring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowGraph {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<EndpointDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<Connection>,
}

/// One processing node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeDef {
    pub id: String,

    /// Component type, resolved against the component builder registry.
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub configuration: HashMap<String, Value>,
}

/// An endpoint-style declaration: a node plus inbound routing hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EndpointDef {
    #[serde(flatten)]
    pub node: NodeDef,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Connection {
    #[serde(rename = "fromId")]
    pub from_id: String,

    #[serde(rename = "toId")]
    pub to_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
}

impl NodeDef {
    /// Shared-resource ids referenced from this node's configuration.
    pub fn shared_refs(&self) -> Vec<String> {
        self.configuration
            .values()
            .filter_map(|v| v.as_str())
            .filter_map(|s| s.strip_prefix(REF_PREFIX))
            .map(|s| s.to_string())
            .collect()
    }
}

impl WorkflowDefinition {
    pub fn decode(dsl: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(dsl)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn encode_pretty(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Synthesize a minimal definition from descriptive fields alone.
    pub fn from_base_info(info: &WorkflowBaseInfo) -> Self {
        Self {
            workflow: WorkflowInfo {
                id: info.id.clone(),
                name: info.name.clone(),
                root: info.root,
                debug_mode: info.debug_mode,
                disabled: false,
                configuration: HashMap::new(),
                additional_info: info.additional_info.clone(),
            },
            metadata: WorkflowGraph::default(),
        }
    }

    /// Overwrite the descriptive fields, leaving graph and configuration alone.
    pub fn apply_base_info(&mut self, info: &WorkflowBaseInfo) {
        self.workflow.name = info.name.clone();
        self.workflow.root = info.root;
        self.workflow.debug_mode = info.debug_mode;
        self.workflow.additional_info = info.additional_info.clone();
    }

    /// Stamp bookkeeping fields: creation time once, update time always.
    pub fn stamp(&mut self, tenant: &str) {
        let info = &mut self.workflow.additional_info;
        info.insert(KEY_USERNAME.to_string(), Value::String(tenant.to_string()));
        let now = now_stamp();
        info.entry(KEY_CREATE_TIME.to_string())
            .or_insert_with(|| Value::String(now.clone()));
        info.insert(KEY_UPDATE_TIME.to_string(), Value::String(now));
    }

    pub fn update_time(&self) -> Option<&str> {
        self.workflow
            .additional_info
            .get(KEY_UPDATE_TIME)
            .and_then(|v| v.as_str())
    }

    /// Every shared-resource id referenced anywhere in the graph.
    pub fn shared_refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for node in self
            .metadata
            .endpoints
            .iter()
            .map(|e| &e.node)
            .chain(self.metadata.nodes.iter())
        {
            for r in node.shared_refs() {
                if seen.insert(r.clone()) {
                    refs.push(r);
                }
            }
        }
        refs
    }

    fn graph(&self) -> Result<(StableDiGraph<String, String>, HashMap<String, NodeIndex>), EngineError> {
        let mut graph = StableDiGraph::new();
        let mut index_of = HashMap::new();

        for node in &self.metadata.nodes {
            if index_of.contains_key(&node.id) {
                return Err(EngineError::Validation(format!(
                    "duplicate node id `{}`",
                    node.id
                )));
            }
            let idx = graph.add_node(node.id.clone());
            index_of.insert(node.id.clone(), idx);
        }

        for conn in &self.metadata.connections {
            let from = index_of.get(&conn.from_id).ok_or_else(|| {
                EngineError::Validation(format!("connection from unknown node `{}`", conn.from_id))
            })?;
            let to = index_of.get(&conn.to_id).ok_or_else(|| {
                EngineError::Validation(format!("connection to unknown node `{}`", conn.to_id))
            })?;
            graph.add_edge(*from, *to, conn.label.clone());
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(EngineError::Validation(format!(
                "workflow `{}` has cycles",
                self.workflow.id
            )));
        }

        Ok((graph, index_of))
    }

    /// Structural checks: unique node ids, resolvable connections, no cycles.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.graph().map(|_| ())
    }

    /// Node ids in topological order. Fails on the same conditions as
    /// `validate`.
    pub fn execution_order(&self) -> Result<Vec<String>, EngineError> {
        let (graph, _) = self.graph()?;
        let order = Topo::new(&graph)
            .iter(&graph)
            .map(|ix| graph[ix].clone())
            .collect();
        Ok(order)
    }
}
