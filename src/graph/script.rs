//! Sandboxed graph-builder scripts.
//!
//! Scripts run in a raw Rhai engine that exposes nothing but the
//! graph-builder API registered below: no modules, no imports, no
//! filesystem, bounded operations and depth. Any symbol outside the
//! allow-list fails evaluation, and the only observable output is the
//! graph-builder description. The script must leave a builder as its
//! result value, or define a zero-argument function returning one;
//! ambiguous scripts without a named entrypoint are rejected.

use crate::graph::expression::from_dynamic;
use crate::graph::schema::{
    ConditionalEdgeSpec, EdgeSpec, GraphDefinition, NodeSpec, SCRIPT_FORMAT,
};
use orcheo_types::OrcheoError;
use rhai::{Dynamic, Engine, Map, Scope, AST};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Mutable graph description assembled by a script.
#[derive(Debug, Clone, Default)]
pub struct ScriptGraphBuilder {
    nodes: Vec<NodeSpec>,
    edges: Vec<(String, String)>,
    conditionals: Vec<ConditionalEdgeSpec>,
    entry: Option<String>,
}

impl ScriptGraphBuilder {
    fn add_node(&mut self, id: &str, node_type: &str, config: Value) {
        self.nodes.push(NodeSpec {
            id: id.to_string(),
            node_type: node_type.to_string(),
            config,
        });
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        self.edges.push((from.to_string(), to.to_string()));
    }

    fn add_conditional(
        &mut self,
        source: &str,
        predicate: &str,
        branches: BTreeMap<String, String>,
        default: Option<String>,
    ) {
        self.conditionals.push(ConditionalEdgeSpec {
            source: source.to_string(),
            predicate: predicate.to_string(),
            branches,
            default,
        });
    }

    fn into_definition(self) -> Result<GraphDefinition, OrcheoError> {
        let definition = GraphDefinition {
            format: Some(SCRIPT_FORMAT.to_string()),
            nodes: self.nodes,
            edges: self
                .edges
                .into_iter()
                .map(|(from, to)| EdgeSpec::Named { from, to })
                .collect(),
            conditional_edges: self.conditionals,
            entry: self.entry,
        };
        definition.validate()?;
        Ok(definition)
    }
}

fn branches_from_map(map: Map) -> BTreeMap<String, String> {
    map.into_iter()
        .filter_map(|(key, value)| {
            value
                .try_cast::<String>()
                .map(|target| (key.to_string(), target))
        })
        .collect()
}

/// Build the sandbox engine with the graph-builder API as its entire
/// surface.
fn sandbox_engine() -> Engine {
    let mut engine = Engine::new_raw();
    engine.set_max_operations(100_000);
    engine.set_max_call_levels(32);
    engine.set_max_expr_depths(64, 64);
    engine.on_print(|_| {});
    engine.on_debug(|_, _, _| {});

    engine.register_type_with_name::<ScriptGraphBuilder>("GraphBuilder");
    engine.register_fn("graph", ScriptGraphBuilder::default);
    engine.register_fn(
        "node",
        |builder: &mut ScriptGraphBuilder, id: &str, node_type: &str| {
            builder.add_node(id, node_type, json!({}));
        },
    );
    engine.register_fn(
        "node",
        |builder: &mut ScriptGraphBuilder, id: &str, node_type: &str, config: Map| {
            let config = from_dynamic(Dynamic::from_map(config));
            builder.add_node(id, node_type, config);
        },
    );
    engine.register_fn(
        "edge",
        |builder: &mut ScriptGraphBuilder, from: &str, to: &str| {
            builder.add_edge(from, to);
        },
    );
    engine.register_fn(
        "conditional_edge",
        |builder: &mut ScriptGraphBuilder, source: &str, predicate: &str, branches: Map| {
            builder.add_conditional(source, predicate, branches_from_map(branches), None);
        },
    );
    engine.register_fn(
        "conditional_edge",
        |builder: &mut ScriptGraphBuilder,
         source: &str,
         predicate: &str,
         branches: Map,
         default: &str| {
            builder.add_conditional(
                source,
                predicate,
                branches_from_map(branches),
                Some(default.to_string()),
            );
        },
    );
    engine.register_fn("entry", |builder: &mut ScriptGraphBuilder, id: &str| {
        builder.entry = Some(id.to_string());
    });
    engine
}

/// Execute a graph-builder script and return the discovered definition.
pub fn load_definition_from_script(
    source: &str,
    entrypoint: Option<&str>,
) -> Result<GraphDefinition, OrcheoError> {
    let engine = sandbox_engine();
    let ast = engine.compile(source).map_err(|err| {
        OrcheoError::ScriptIngestion(format!("script failed to compile: {err}"))
    })?;

    let builder = resolve_builder(&engine, &ast, entrypoint)?;
    builder.into_definition()
}

fn resolve_builder(
    engine: &Engine,
    ast: &AST,
    entrypoint: Option<&str>,
) -> Result<ScriptGraphBuilder, OrcheoError> {
    let mut scope = Scope::new();
    if let Some(name) = entrypoint {
        if !ast
            .iter_functions()
            .any(|function| function.name == name && function.params.is_empty())
        {
            return Err(OrcheoError::ScriptIngestion(format!(
                "entrypoint '{name}' not found in script"
            )));
        }
        return engine
            .call_fn::<ScriptGraphBuilder>(&mut scope, ast, name, ())
            .map_err(|err| {
                OrcheoError::ScriptIngestion(format!(
                    "entrypoint '{name}' did not produce a graph builder: {err}"
                ))
            });
    }

    let result = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, ast)
        .map_err(|err| OrcheoError::ScriptIngestion(format!("script failed to run: {err}")))?;
    if let Some(builder) = result.clone().try_cast::<ScriptGraphBuilder>() {
        return Ok(builder);
    }

    let factories: Vec<String> = ast
        .iter_functions()
        .filter(|function| function.params.is_empty())
        .map(|function| function.name.to_string())
        .collect();
    match factories.as_slice() {
        [] => Err(OrcheoError::ScriptIngestion(
            "script did not produce a graph builder".to_string(),
        )),
        [single] => engine
            .call_fn::<ScriptGraphBuilder>(&mut scope, ast, single, ())
            .map_err(|err| {
                OrcheoError::ScriptIngestion(format!(
                    "factory '{single}' did not produce a graph builder: {err}"
                ))
            }),
        _ => Err(OrcheoError::ScriptIngestion(
            "multiple graph builder candidates discovered; specify an entrypoint".to_string(),
        )),
    }
}

/// Ingest a script into a storable graph payload: the original source
/// plus a structural summary for visualisation.
pub fn ingest_script(source: &str, entrypoint: Option<&str>) -> Result<Value, OrcheoError> {
    let definition = load_definition_from_script(source, entrypoint)?;
    let summary = json!({
        "nodes": definition
            .nodes
            .iter()
            .map(|node| json!({"name": node.id, "type": node.node_type}))
            .collect::<Vec<_>>(),
        "edges": definition
            .edges
            .iter()
            .map(|edge| json!([edge.from(), edge.to()]))
            .collect::<Vec<_>>(),
        "conditional_edges": definition
            .conditional_edges
            .iter()
            .map(|conditional| {
                json!({
                    "source": conditional.source,
                    "mapping": conditional.branches,
                    "default": conditional.default,
                })
            })
            .collect::<Vec<_>>(),
    });
    Ok(json!({
        "format": SCRIPT_FORMAT,
        "source": source,
        "entrypoint": entrypoint,
        "summary": summary,
    }))
}
