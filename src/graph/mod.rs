//! Graph compiler: structured documents and sandboxed scripts resolved
//! against a node registry into an executable step stream.

mod compile;
mod dot;
mod expression;
pub mod node;
pub mod schema;
pub mod script;

pub use compile::{CompiledGraph, GraphCompiler, RunConfig, StepUpdate};
pub use dot::definition_to_dot;
pub use expression::ExpressionEngine;
pub use node::{
    register_builtins, Node, NodeContext, NodeRegistry, NodeRegistryBuilder,
};
pub use schema::{
    ConditionalEdgeSpec, EdgeSpec, GraphDefinition, NodeSpec, END, SCRIPT_FORMAT, START,
    STRUCTURED_FORMAT,
};
pub use script::{ingest_script, load_definition_from_script};
