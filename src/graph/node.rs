//! Node trait, registry, and the built-in support nodes.

use crate::engine::CancelToken;
use async_trait::async_trait;
use orcheo_types::OrcheoError;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Execution context handed to each node run. Nodes cooperate with
/// cancellation by polling the token inside long operations.
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub cancel: CancelToken,
}

/// A workflow graph node. The returned object is merged into the run
/// state and becomes the node's step payload.
#[async_trait]
pub trait Node: Send + Sync + 'static {
    async fn run(&self, state: &Value, ctx: &NodeContext) -> Result<Value, OrcheoError>;
}

/// Constructor resolved from the registry. Receives the node config with
/// credential references already substituted.
pub type NodeConstructor =
    Arc<dyn Fn(Value) -> Result<Arc<dyn Node>, OrcheoError> + Send + Sync + 'static>;

/// Builder used to register node types before compiling graphs.
pub struct NodeRegistryBuilder {
    constructors: HashMap<String, NodeConstructor>,
}

impl Default for NodeRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistryBuilder {
    pub fn new() -> Self {
        NodeRegistryBuilder {
            constructors: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, node_type: &str, constructor: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Arc<dyn Node>, OrcheoError> + Send + Sync + 'static,
    {
        if self
            .constructors
            .insert(node_type.to_string(), Arc::new(constructor))
            .is_some()
        {
            panic!("duplicate node type registered: {node_type}");
        }
        self
    }

    pub fn build(self) -> NodeRegistry {
        NodeRegistry {
            inner: Arc::new(self.constructors),
        }
    }
}

/// Immutable registry mapping node type names to constructors.
#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<HashMap<String, NodeConstructor>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        NodeRegistryBuilder::new().build()
    }
}

impl NodeRegistry {
    pub fn builder() -> NodeRegistryBuilder {
        NodeRegistryBuilder::new()
    }

    /// Registry pre-loaded with the built-in support nodes.
    pub fn with_builtins() -> Self {
        let mut builder = NodeRegistryBuilder::new();
        register_builtins(&mut builder);
        builder.build()
    }

    pub fn construct(
        &self,
        node_type: &str,
        config: Value,
    ) -> Result<Arc<dyn Node>, OrcheoError> {
        let constructor = self.inner.get(node_type).ok_or_else(|| {
            OrcheoError::GraphValidation(format!("node type '{node_type}' is not registered"))
        })?;
        constructor(config)
    }
}

/// Register the built-in nodes: `Noop`, `SetValues`, `Reply`, `Fail`.
pub fn register_builtins(builder: &mut NodeRegistryBuilder) {
    builder.register("Noop", |_config| Ok(Arc::new(NoopNode) as Arc<dyn Node>));
    builder.register("SetValues", |config| {
        let values = config
            .as_object()
            .cloned()
            .ok_or_else(|| {
                OrcheoError::GraphValidation("SetValues config must be an object".to_string())
            })?;
        Ok(Arc::new(SetValuesNode { values }) as Arc<dyn Node>)
    });
    builder.register("Reply", |config| {
        let reply = config
            .get("reply")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                OrcheoError::GraphValidation(
                    "Reply config requires a string 'reply' field".to_string(),
                )
            })?
            .to_string();
        Ok(Arc::new(ReplyNode { reply }) as Arc<dyn Node>)
    });
    builder.register("Fail", |config| {
        let message = config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("node failed")
            .to_string();
        Ok(Arc::new(FailNode { message }) as Arc<dyn Node>)
    });
}

/// Emits `{ok: true}` without touching the state.
pub struct NoopNode;

#[async_trait]
impl Node for NoopNode {
    async fn run(&self, _state: &Value, _ctx: &NodeContext) -> Result<Value, OrcheoError> {
        Ok(json!({"ok": true}))
    }
}

/// Copies its configured key/value pairs into the state. Config strings
/// may carry credential references, which makes this the reference
/// exercise for `[[name]]` substitution.
pub struct SetValuesNode {
    values: Map<String, Value>,
}

#[async_trait]
impl Node for SetValuesNode {
    async fn run(&self, _state: &Value, _ctx: &NodeContext) -> Result<Value, OrcheoError> {
        Ok(Value::Object(self.values.clone()))
    }
}

/// Produces a `reply` plus an assistant `_messages` entry so downstream
/// transports can render chat output.
pub struct ReplyNode {
    reply: String,
}

#[async_trait]
impl Node for ReplyNode {
    async fn run(&self, state: &Value, _ctx: &NodeContext) -> Result<Value, OrcheoError> {
        let mut messages = state
            .get("_messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        messages.push(json!({"role": "assistant", "content": self.reply}));
        Ok(json!({"reply": self.reply, "_messages": messages}))
    }
}

/// Fails with the configured message; used to exercise error paths.
pub struct FailNode {
    message: String,
}

#[async_trait]
impl Node for FailNode {
    async fn run(&self, _state: &Value, _ctx: &NodeContext) -> Result<Value, OrcheoError> {
        Err(OrcheoError::Execution(self.message.clone()))
    }
}
