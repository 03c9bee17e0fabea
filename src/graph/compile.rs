//! Graph compilation: resolve node constructors, wire edges, and drive
//! the compiled graph as a cooperative step stream.

use crate::engine::CancelToken;
use crate::graph::expression::ExpressionEngine;
use crate::graph::node::{Node, NodeContext, NodeRegistry};
use crate::graph::schema::{
    graph_format, ConditionalEdgeSpec, GraphDefinition, END, SCRIPT_FORMAT, START,
    STRUCTURED_FORMAT,
};
use crate::graph::script::load_definition_from_script;
use crate::vault::CredentialResolver;
use async_stream::try_stream;
use futures::Stream;
use indexmap::IndexMap;
use orcheo_types::OrcheoError;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Per-run execution parameters handed to the compiled stream.
#[derive(Clone)]
pub struct RunConfig {
    pub execution_id: String,
    pub workflow_id: String,
    pub cancel: CancelToken,
    pub step_budget: usize,
    /// Nodes already completed in a previous attempt; traversed without
    /// re-running when resuming from a checkpoint.
    pub completed: HashSet<String>,
}

/// One update produced by a node: the step payload (`{node_id: output}`)
/// plus the state snapshot after the merge.
#[derive(Debug, Clone)]
pub struct StepUpdate {
    pub node_id: String,
    pub payload: Value,
    pub state: Value,
}

/// Compiles graph documents into executable graphs against a node
/// registry.
pub struct GraphCompiler {
    registry: NodeRegistry,
}

impl GraphCompiler {
    pub fn new(registry: NodeRegistry) -> Self {
        GraphCompiler { registry }
    }

    /// Compile either a structured document or a sandboxed script. Node
    /// configs pass through the credential resolver before construction.
    pub async fn compile(
        &self,
        graph: &Value,
        resolver: Option<&CredentialResolver>,
    ) -> Result<CompiledGraph, OrcheoError> {
        let definition = match graph_format(graph) {
            STRUCTURED_FORMAT => GraphDefinition::from_value(graph)?,
            SCRIPT_FORMAT => {
                let source = graph.get("source").and_then(Value::as_str).ok_or_else(|| {
                    OrcheoError::ScriptIngestion(
                        "script graph document is missing 'source'".to_string(),
                    )
                })?;
                let entrypoint = graph.get("entrypoint").and_then(Value::as_str);
                load_definition_from_script(source, entrypoint)?
            }
            other => {
                return Err(OrcheoError::GraphValidation(format!(
                    "unknown graph format '{other}'"
                )))
            }
        };
        self.compile_definition(&definition, resolver).await
    }

    pub async fn compile_definition(
        &self,
        definition: &GraphDefinition,
        resolver: Option<&CredentialResolver>,
    ) -> Result<CompiledGraph, OrcheoError> {
        let entry = definition.resolve_entry()?;
        let mut nodes: IndexMap<String, Arc<dyn Node>> = IndexMap::new();
        for spec in &definition.nodes {
            let config = match resolver {
                Some(resolver) => resolver.resolve_value(&spec.config).await?,
                None => spec.config.clone(),
            };
            let node = self.registry.construct(&spec.node_type, config)?;
            nodes.insert(spec.id.clone(), node);
        }

        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &definition.edges {
            if edge.from() == START {
                continue;
            }
            edges
                .entry(edge.from().to_string())
                .or_default()
                .push(edge.to().to_string());
        }
        let conditionals: HashMap<String, ConditionalEdgeSpec> = definition
            .conditional_edges
            .iter()
            .map(|conditional| (conditional.source.clone(), conditional.clone()))
            .collect();

        Ok(CompiledGraph {
            nodes,
            edges,
            conditionals,
            entry,
            expressions: Arc::new(ExpressionEngine::default()),
        })
    }
}

/// Executable form of a graph definition.
pub struct CompiledGraph {
    nodes: IndexMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Vec<String>>,
    conditionals: HashMap<String, ConditionalEdgeSpec>,
    entry: String,
    expressions: Arc<ExpressionEngine>,
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("edges", &self.edges)
            .field("conditionals", &self.conditionals)
            .field("entry", &self.entry)
            .finish()
    }
}

impl CompiledGraph {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Initial run state: the input object itself, or `{"input": ...}`
    /// for scalar inputs.
    pub fn start_state(&self, inputs: &Value) -> Value {
        match inputs {
            Value::Object(_) => inputs.clone(),
            Value::Null => Value::Object(Map::new()),
            other => {
                let mut state = Map::new();
                state.insert("input".to_string(), other.clone());
                Value::Object(state)
            }
        }
    }

    /// Pick the next vertex after `current`: conditional branch first,
    /// then plain edges, falling back to `END`.
    fn next_node(&self, current: &str, state: &Value) -> Result<String, OrcheoError> {
        if let Some(conditional) = self.conditionals.get(current) {
            let key = self
                .expressions
                .evaluate_branch_key(&conditional.predicate, state)?;
            if let Some(target) = conditional.branches.get(&key) {
                return Ok(target.clone());
            }
            if let Some(default) = &conditional.default {
                return Ok(default.clone());
            }
            return Err(OrcheoError::Execution(format!(
                "conditional edge on '{current}' produced unmapped branch key '{key}'"
            )));
        }
        Ok(self
            .edges
            .get(current)
            .and_then(|targets| targets.first())
            .cloned()
            .unwrap_or_else(|| END.to_string()))
    }

    /// Drive the graph from `state`, yielding one update per executed
    /// node. The stream ends at `END`, on cancellation, or with an error
    /// once the step budget is exceeded.
    pub fn stream(
        &self,
        state: Value,
        config: RunConfig,
    ) -> impl Stream<Item = Result<StepUpdate, OrcheoError>> + '_ {
        try_stream! {
            let mut state = state;
            let mut current = self.entry.clone();
            let mut executed = 0usize;
            loop {
                if current == END {
                    break;
                }
                if config.cancel.is_triggered() {
                    break;
                }
                let node = self.nodes.get(&current).ok_or_else(|| {
                    OrcheoError::Execution(format!("graph routed to unknown node '{current}'"))
                })?;
                if !config.completed.contains(&current) {
                    if executed >= config.step_budget {
                        Err(OrcheoError::StepBudgetExceeded(config.step_budget))?;
                    }
                    let ctx = NodeContext {
                        execution_id: config.execution_id.clone(),
                        workflow_id: config.workflow_id.clone(),
                        node_id: current.clone(),
                        cancel: config.cancel.clone(),
                    };
                    let output = node.run(&state, &ctx).await?;
                    merge_output(&mut state, &current, &output);
                    executed += 1;
                    let mut payload = Map::new();
                    payload.insert(current.clone(), output);
                    yield StepUpdate {
                        node_id: current.clone(),
                        payload: Value::Object(payload),
                        state: state.clone(),
                    };
                }
                current = self.next_node(&current, &state)?;
            }
        }
    }
}

/// Merge a node's partial output into the shared state: object outputs
/// merge key-wise, anything else lands under the node id.
fn merge_output(state: &mut Value, node_id: &str, output: &Value) {
    if !state.is_object() {
        *state = Value::Object(Map::new());
    }
    let Some(target) = state.as_object_mut() else {
        return;
    };
    match output {
        Value::Object(patch) => {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        other => {
            target.insert(node_id.to_string(), other.clone());
        }
    }
}
