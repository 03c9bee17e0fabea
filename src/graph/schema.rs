//! Structured graph definition: serde model plus structural validation.

use orcheo_types::OrcheoError;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Sentinel source vertex.
pub const START: &str = "START";
/// Sentinel sink vertex.
pub const END: &str = "END";

/// Format tag for structured graph documents.
pub const STRUCTURED_FORMAT: &str = "structured";
/// Format tag for sandboxed graph-builder scripts.
pub const SCRIPT_FORMAT: &str = "script";

fn default_config() -> Value {
    Value::Object(serde_json::Map::new())
}

/// One node in a structured graph document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default = "default_config")]
    pub config: Value,
}

/// Edge encoding: either `{from, to}` objects or `[src, dst]` pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EdgeSpec {
    Named { from: String, to: String },
    Pair([String; 2]),
}

impl EdgeSpec {
    pub fn from(&self) -> &str {
        match self {
            EdgeSpec::Named { from, .. } => from,
            EdgeSpec::Pair(pair) => &pair[0],
        }
    }

    pub fn to(&self) -> &str {
        match self {
            EdgeSpec::Named { to, .. } => to,
            EdgeSpec::Pair(pair) => &pair[1],
        }
    }
}

/// Conditional branch: a predicate over the state yields a branch key
/// mapped onto a destination node, with an optional default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalEdgeSpec {
    pub source: String,
    pub predicate: String,
    #[serde(default)]
    pub branches: BTreeMap<String, String>,
    pub default: Option<String>,
}

/// Parsed structured graph document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub format: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub conditional_edges: Vec<ConditionalEdgeSpec>,
    #[serde(default)]
    pub entry: Option<String>,
}

impl GraphDefinition {
    pub fn from_value(graph: &Value) -> Result<Self, OrcheoError> {
        let definition: GraphDefinition = serde_json::from_value(graph.clone())
            .map_err(|err| OrcheoError::GraphValidation(format!("invalid graph document: {err}")))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Resolve the entry node: the explicit `entry` field, or the target
    /// of an edge out of `START`.
    pub fn resolve_entry(&self) -> Result<String, OrcheoError> {
        if let Some(entry) = &self.entry {
            return Ok(entry.clone());
        }
        self.edges
            .iter()
            .find(|edge| edge.from() == START)
            .map(|edge| edge.to().to_string())
            .ok_or_else(|| {
                OrcheoError::GraphValidation(
                    "graph has no entry: set 'entry' or add an edge from START".to_string(),
                )
            })
    }

    /// Structural validation: unique node ids, edges between known
    /// vertices, and every node reachable from the entry.
    pub fn validate(&self) -> Result<(), OrcheoError> {
        if self.nodes.is_empty() {
            return Err(OrcheoError::GraphValidation(
                "graph defines no nodes".to_string(),
            ));
        }
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id == START || node.id == END {
                return Err(OrcheoError::GraphValidation(format!(
                    "node id '{}' collides with a sentinel vertex",
                    node.id
                )));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(OrcheoError::GraphValidation(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
        for vertex in [START, END] {
            indices.insert(vertex, graph.add_node(vertex));
        }
        for node in &self.nodes {
            indices.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
        }

        let require_vertex = |name: &str| -> Result<NodeIndex, OrcheoError> {
            indices.get(name).copied().ok_or_else(|| {
                OrcheoError::GraphValidation(format!("edge references unknown node '{name}'"))
            })
        };
        let mut links: Vec<(NodeIndex, NodeIndex)> = Vec::new();
        for edge in &self.edges {
            links.push((require_vertex(edge.from())?, require_vertex(edge.to())?));
        }
        for conditional in &self.conditional_edges {
            let source = require_vertex(&conditional.source)?;
            for target in conditional.branches.values() {
                links.push((source, require_vertex(target)?));
            }
            if let Some(default) = &conditional.default {
                links.push((source, require_vertex(default)?));
            }
        }
        for (from, to) in links {
            graph.add_edge(from, to, ());
        }

        let entry = self.resolve_entry()?;
        let entry_index = indices.get(entry.as_str()).copied().ok_or_else(|| {
            OrcheoError::GraphValidation(format!("entry references unknown node '{entry}'"))
        })?;

        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&graph, entry_index);
        while let Some(index) = dfs.next(&graph) {
            reachable.insert(index);
        }
        for node in &self.nodes {
            let index = indices[node.id.as_str()];
            if !reachable.contains(&index) {
                return Err(OrcheoError::GraphValidation(format!(
                    "node '{}' is unreachable from entry '{entry}'",
                    node.id
                )));
            }
        }
        Ok(())
    }
}

/// Read the `format` discriminator from an opaque graph document.
pub fn graph_format(graph: &Value) -> &str {
    graph
        .get("format")
        .and_then(Value::as_str)
        .unwrap_or(STRUCTURED_FORMAT)
}
